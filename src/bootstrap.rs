use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    claims::ClaimService,
    clock::{Clock, IntervalTicker, SystemClock},
    config::{Config, StorageBackend},
    error::{AppError, AppResult},
    execution::{LedgerClient, SorobanConfig, SorobanLedgerClient},
    funding::{DepositConfig, DepositReconciler},
    ledger::{memory::MemoryStore, repository::LedgerRepository, store::WalletDirectory, Stores},
    policies::{BillingScheduler, ChargeProtocol, PolicyService},
    settlement::SettlementReconciler,
    wallet::CustodyWalletDirectory,
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let wallets: Arc<dyn WalletDirectory> = Arc::new(CustodyWalletDirectory::new(&config.custody_url));
    info!("✅ Custody wallet directory: {}", config.custody_url);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let stores = match config.storage_backend {
        StorageBackend::Postgres => {
            let pool = initialize_database(&config.database_url).await?;
            Stores::from_backend(Arc::new(LedgerRepository::new(pool)), wallets)
        }
        StorageBackend::Memory => {
            warn!("⚠️  STORAGE_BACKEND=memory - state is lost on restart");
            Stores::from_backend(Arc::new(MemoryStore::new(clock.clone())), wallets)
        }
    };

    if config.contract_id.is_empty() {
        warn!("⚠️  CONTRACT_ID not set - every contract call will be rejected by the relay");
    }
    let ledger: Arc<dyn LedgerClient> = Arc::new(
        SorobanLedgerClient::new(SorobanConfig {
            relay_url: config.settlement_relay_url.clone(),
            contract_id: config.contract_id.clone(),
            horizon_url: config.horizon_url.clone(),
            asset_code: config.asset_code.clone(),
            request_timeout: config.ledger_call_timeout(),
        })
        .map_err(|e| AppError::Config(format!("Failed to build ledger client: {}", e)))?,
    );
    info!("✅ Ledger client: relay {} / horizon {}", config.settlement_relay_url, config.horizon_url);

    let call_timeout = config.ledger_call_timeout();

    let charges = Arc::new(ChargeProtocol::new(stores.clone(), ledger.clone(), call_timeout));
    let policies = Arc::new(PolicyService::new(
        stores.clone(),
        ledger.clone(),
        charges.clone(),
        clock.clone(),
        call_timeout,
    ));
    let claims = Arc::new(ClaimService::new(stores.clone(), ledger.clone(), clock.clone(), call_timeout));
    let deposits = Arc::new(DepositReconciler::new(
        stores.clone(),
        ledger.clone(),
        clock.clone(),
        DepositConfig {
            anchor_url: config.anchor_url.clone(),
            asset_code: config.asset_code.clone(),
        },
        call_timeout,
    ));
    let scheduler = Arc::new(BillingScheduler::new(
        stores.clone(),
        policies.clone(),
        charges,
        clock.clone(),
    ));
    let reconciler = Arc::new(SettlementReconciler::new(
        stores.clone(),
        clock,
        config.stale_reference_age(),
    ));

    // Background jobs
    scheduler
        .clone()
        .start(IntervalTicker::new(Duration::from_secs(config.billing_interval_secs)));
    info!("✅ Billing scheduler started (every {}s)", config.billing_interval_secs);

    deposits
        .clone()
        .start(IntervalTicker::new(Duration::from_secs(config.deposit_sweep_interval_secs)));
    info!("✅ Deposit sweep started (every {}s)", config.deposit_sweep_interval_secs);

    reconciler
        .clone()
        .start(IntervalTicker::new(Duration::from_secs(config.reconcile_interval_secs)));
    info!("✅ Settlement reconciler started (every {}s)", config.reconcile_interval_secs);

    Ok(AppState {
        stores,
        ledger,
        policies,
        claims,
        deposits,
        scheduler,
        reconciler,
        storage: config.storage_backend,
        call_timeout,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
