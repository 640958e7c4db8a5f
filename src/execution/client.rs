use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::amount::Stroops;
use crate::error::SettlementError;

pub type SettlementResult<T> = Result<T, SettlementError>;

/// Incoming payment as reported by the settlement chain's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPayment {
    pub id: String,
    pub tx_ref: String,
    pub from: Option<String>,
    pub to: String,
    /// `XLM` for the native asset
    pub asset_code: String,
    pub amount: Stroops,
    pub created_at: DateTime<Utc>,
}

/// Ledger client - the engine's only way to move money
///
/// Implementations classify every failure as `Hard`, `Soft`, `Ambiguous` or `Timeout`;
/// callers never look at error text. After `Ambiguous` or `Timeout` funds may have moved.
///
/// All amounts are base units.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Collect a premium without an idempotency key. Returns the external tx ref.
    async fn collect_premium(&self, account: &str, amount: Stroops) -> SettlementResult<String>;

    /// Collect a premium keyed by `reference`; the chain rejects a reused key.
    async fn collect_premium_with_ref(
        &self,
        account: &str,
        amount: Stroops,
        reference: &str,
    ) -> SettlementResult<String>;

    async fn activate_policy(
        &self,
        account: &str,
        product_id: &str,
        amount: Stroops,
        reference: &str,
    ) -> SettlementResult<String>;

    async fn payout(&self, account: &str, amount: Stroops) -> SettlementResult<String>;

    /// Best-effort notification; most deployments do not expose it.
    async fn pause_policy(&self, _account: &str, _policy_id: Uuid) -> SettlementResult<()> {
        Err(SettlementError::Soft("pause_policy is not supported".to_string()))
    }

    async fn get_balance(&self, account: &str) -> SettlementResult<Stroops>;

    async fn get_policy(&self, policy_id: Uuid) -> SettlementResult<serde_json::Value>;

    /// Incoming payments to `account`, newest first.
    async fn payment_history(&self, account: &str) -> SettlementResult<Vec<ExternalPayment>>;
}

/// Bound a ledger call; an elapsed deadline is a `Timeout`, never a soft skip.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> SettlementResult<T>
where
    F: Future<Output = SettlementResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SettlementError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, SettlementError>("tx".to_string())
        };
        let result = with_timeout(Duration::from_millis(10), slow).await;
        assert_eq!(result, Err(SettlementError::Timeout));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let fast = async { Err::<String, _>(SettlementError::Soft("missing".into())) };
        let result = with_timeout(Duration::from_secs(1), fast).await;
        assert!(result.unwrap_err().is_soft());
    }
}
