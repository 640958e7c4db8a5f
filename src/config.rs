use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub storage_backend: StorageBackend,
    pub horizon_url: String,
    pub settlement_relay_url: String,
    pub contract_id: String,
    pub custody_url: String,
    pub anchor_url: String,
    pub asset_code: String,
    pub billing_interval_secs: u64,
    pub deposit_sweep_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub ledger_call_timeout_secs: u64,
    pub stale_reference_secs: i64,
}

impl Config {
    /// Read configuration from the process environment (after `.env` has been loaded).
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("database_url", "postgresql://localhost/coverage")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("storage_backend", "postgres")?
            .set_default("horizon_url", "https://horizon-testnet.stellar.org")?
            .set_default("settlement_relay_url", "http://localhost:8787")?
            .set_default("contract_id", "")?
            .set_default("custody_url", "http://localhost:8788")?
            .set_default("anchor_url", "https://testanchor.stellar.org")?
            .set_default("asset_code", "XLM")?
            .set_default("billing_interval_secs", 300)?
            .set_default("deposit_sweep_interval_secs", 60)?
            .set_default("reconcile_interval_secs", 900)?
            .set_default("ledger_call_timeout_secs", 15)?
            .set_default("stale_reference_secs", 900)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn ledger_call_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger_call_timeout_secs)
    }

    pub fn stale_reference_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_reference_secs)
    }
}
