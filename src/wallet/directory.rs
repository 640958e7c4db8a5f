use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stellar_sdk::Keypair;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::store::WalletDirectory;

/// Length of a base32 StrKey account id.
const ACCOUNT_ID_LEN: usize = 56;

/// Reject anything that is not a valid Stellar account id (G...).
///
/// The shape is checked before the checksum: `Keypair::from_public_key` indexes into
/// the decoded bytes and panics on short input.
pub fn validate_stellar_address(address: &str) -> AppResult<()> {
    let well_formed = address.len() == ACCOUNT_ID_LEN
        && address.starts_with('G')
        && address
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b));
    if !well_formed {
        return Err(AppError::Validation(format!("Invalid Stellar address: {}", address)));
    }

    Keypair::from_public_key(address)
        .map(|_| ())
        .map_err(|_| AppError::Validation(format!("Invalid Stellar address: {}", address)))
}

#[derive(Debug, Serialize)]
struct CreateWalletRequest {
    owner_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct WalletResponse {
    public_key: String,
}

/// Owner -> settlement address mapping backed by the custody service.
///
/// Keys never leave custody; this only sees public keys. Resolved addresses are
/// cached for the life of the process since the mapping never changes.
pub struct CustodyWalletDirectory {
    base_url: String,
    client: reqwest::Client,
    cache: tokio::sync::RwLock<HashMap<Uuid, String>>,
}

impl CustodyWalletDirectory {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            cache: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    async fn fetch(&self, owner_id: Uuid) -> AppResult<Option<String>> {
        let url = format!("{}/wallets/{}", self.base_url, owner_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("Custody lookup failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "Custody lookup returned {}",
                response.status()
            )));
        }

        let wallet: WalletResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Invalid custody response: {}", e)))?;
        Ok(Some(wallet.public_key))
    }

    async fn create(&self, owner_id: Uuid) -> AppResult<String> {
        let url = format!("{}/wallets", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&CreateWalletRequest { owner_id })
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("Custody wallet creation failed: {}", e)))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(format!("Custody wallet creation rejected: {}", body)));
        }

        let wallet: WalletResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Invalid custody response: {}", e)))?;

        info!("👛 Created settlement wallet for owner {}", owner_id);
        Ok(wallet.public_key)
    }
}

#[async_trait]
impl WalletDirectory for CustodyWalletDirectory {
    async fn get_or_create_address(&self, owner_id: Uuid) -> AppResult<String> {
        if let Some(address) = self.cache.read().await.get(&owner_id) {
            return Ok(address.clone());
        }

        let address = match self.fetch(owner_id).await? {
            Some(address) => address,
            None => self.create(owner_id).await?,
        };
        validate_stellar_address(&address)?;

        debug!("Resolved settlement address for owner {}", owner_id);
        self.cache.write().await.insert(owner_id, address.clone());
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "GAAZI4TCR3TY5OJHCTJC2A4QSY6CJWJH5IAJTGKIN2ER7LBNVKOCCWN7";

    #[test]
    fn test_accepts_account_id() {
        assert!(validate_stellar_address(ADDRESS).is_ok());
    }

    #[test]
    fn test_rejects_malformed_address() {
        let lowercase = ADDRESS.to_lowercase();
        let secret_seed = format!("S{}", &ADDRESS[1..]);
        for bad in ["", "G", "not-an-address", &ADDRESS[..55], lowercase.as_str(), secret_seed.as_str()] {
            assert!(
                matches!(validate_stellar_address(bad), Err(AppError::Validation(_))),
                "expected validation error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let directory = CustodyWalletDirectory::new("http://custody.local/");
        assert_eq!(directory.base_url, "http://custody.local");
    }
}
