// Deposit Reconciler
//
// Two paths lead to the same finalize step:
// - the anchor webhook, which names the deposit
// - the periodic sweep, which matches pending intents against incoming payments on chain
//
// Finalize is a compare-and-set on the intent; only the caller that wins it credits the
// event ledger, so a deposit is credited once no matter how many paths observe it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::amount::Stroops;
use crate::clock::{Clock, Ticker};
use crate::error::{AppError, AppResult};
use crate::execution::{with_timeout, ExternalPayment, LedgerClient};
use crate::ledger::models::*;
use crate::ledger::Stores;

#[derive(Debug, Clone)]
pub struct DepositConfig {
    pub anchor_url: String,
    pub asset_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepositInitiated {
    pub intent: DepositIntent,
    pub wallet: String,
    pub interactive_url: String,
}

/// Anchor status callback (SEP-24 transaction object)
#[derive(Debug, Clone, Deserialize)]
pub struct AnchorWebhook {
    pub transaction: AnchorTransaction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnchorTransaction {
    pub id: String,
    pub status: String,
    pub amount_in: Option<String>,
    pub stellar_transaction_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub completed: usize,
    pub unmatched: usize,
    pub failed: usize,
}

/// What an anchor status means for an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnchorStatus {
    Open(DepositStatus),
    Completed,
    Unknown,
}

fn map_anchor_status(status: &str) -> AnchorStatus {
    match status {
        "completed" => AnchorStatus::Completed,
        "pending_trust" => AnchorStatus::Open(DepositStatus::PendingTrust),
        "pending_user_transfer_start" => AnchorStatus::Open(DepositStatus::PendingUserTransferStart),
        s if s.starts_with("pending_") || s == "incomplete" => AnchorStatus::Open(DepositStatus::Pending),
        _ => AnchorStatus::Unknown,
    }
}

pub struct DepositReconciler {
    stores: Stores,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    config: DepositConfig,
    call_timeout: Duration,
}

impl DepositReconciler {
    pub fn new(
        stores: Stores,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        config: DepositConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            stores,
            ledger,
            clock,
            config,
            call_timeout,
        }
    }

    #[instrument(skip(self))]
    pub async fn initiate_deposit(
        &self,
        owner_id: Uuid,
        amount: Stroops,
        asset_code: Option<String>,
    ) -> AppResult<DepositInitiated> {
        if !amount.is_positive() {
            return Err(AppError::Validation("Deposit amount must be positive".into()));
        }
        let asset_code = asset_code.unwrap_or_else(|| self.config.asset_code.clone());
        let wallet = self.stores.wallets.get_or_create_address(owner_id).await?;
        let now = self.clock.now();

        let intent = DepositIntent {
            id: Uuid::new_v4(),
            owner_id,
            expected_amount: amount,
            asset_code,
            status: DepositStatus::Pending,
            external_id: None,
            matched_tx_ref: None,
            received_amount: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.stores.deposits.insert_deposit(&intent).await?;

        let interactive_url = format!(
            "{}/deposit?wallet={}&amount={}&asset={}",
            self.config.anchor_url.trim_end_matches('/'),
            wallet,
            amount,
            intent.asset_code
        );

        info!("🏦 Deposit {} initiated for owner {}: {} {}", intent.id, owner_id, amount, intent.asset_code);
        Ok(DepositInitiated {
            intent,
            wallet,
            interactive_url,
        })
    }

    pub async fn get_deposit(&self, id: Uuid) -> AppResult<DepositIntent> {
        self.stores
            .deposits
            .get_deposit(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Deposit {} not found", id)))
    }

    /// Apply an anchor status callback. Repeated `completed` callbacks are no-ops.
    #[instrument(skip(self, payload), fields(anchor_tx = %payload.transaction.id, status = %payload.transaction.status))]
    pub async fn handle_webhook(&self, payload: AnchorWebhook) -> AppResult<DepositIntent> {
        let tx = payload.transaction;

        let intent = match self.stores.deposits.find_deposit_by_external_id(&tx.id).await? {
            Some(intent) => intent,
            None => {
                let id = Uuid::parse_str(&tx.id)
                    .map_err(|_| AppError::NotFound(format!("No deposit for anchor transaction {}", tx.id)))?;
                self.get_deposit(id).await?
            }
        };

        if intent.status.is_terminal() {
            debug!("Deposit {} already completed, ignoring {}", intent.id, tx.status);
            return Ok(intent);
        }

        let external_id = intent.external_id.is_none().then(|| tx.id.clone());

        match map_anchor_status(&tx.status) {
            AnchorStatus::Open(status) => {
                self.stores
                    .deposits
                    .update_deposit_status(intent.id, status, external_id)
                    .await
            }
            AnchorStatus::Completed => {
                let received = match tx.amount_in.as_deref() {
                    Some(raw) => Stroops::parse(raw)?,
                    None => intent.expected_amount,
                };
                if external_id.is_some() {
                    self.stores
                        .deposits
                        .update_deposit_status(intent.id, intent.status, external_id)
                        .await?;
                }
                self.finalize(&intent, tx.stellar_transaction_id, received, "webhook")
                    .await?;
                self.get_deposit(intent.id).await
            }
            AnchorStatus::Unknown => {
                warn!("Unhandled anchor status '{}' for deposit {}", tx.status, intent.id);
                Ok(intent)
            }
        }
    }

    /// Match every open intent against incoming payments on chain.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> AppResult<SweepReport> {
        let pending = self.stores.deposits.find_pending_deposits().await?;
        let mut report = SweepReport {
            scanned: pending.len(),
            ..Default::default()
        };

        for intent in &pending {
            match self.sweep_one(intent).await {
                Ok(true) => report.completed += 1,
                Ok(false) => report.unmatched += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("❌ Deposit sweep failed for intent {}: {}", intent.id, e);
                }
            }
        }

        if report.completed > 0 || report.failed > 0 {
            info!(
                "🔎 Deposit sweep: {} scanned, {} completed, {} failed",
                report.scanned, report.completed, report.failed
            );
        }
        Ok(report)
    }

    async fn sweep_one(&self, intent: &DepositIntent) -> AppResult<bool> {
        let wallet = self.stores.wallets.get_or_create_address(intent.owner_id).await?;
        let payments = with_timeout(self.call_timeout, self.ledger.payment_history(&wallet))
            .await
            .map_err(|e| e.into_app_error(intent.id, "payment_history"))?;

        for payment in payments.iter().filter(|p| qualifies(intent, p)) {
            if self.stores.deposits.is_payment_matched(&payment.tx_ref).await? {
                continue;
            }
            match self
                .finalize(intent, Some(payment.tx_ref.clone()), payment.amount, "sweep")
                .await
            {
                Ok(won) => return Ok(won),
                // Bound to another intent between the check and the write; try the next one.
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Move the intent to COMPLETED and credit it. Returns whether this call did the transition.
    async fn finalize(
        &self,
        intent: &DepositIntent,
        tx_ref: Option<String>,
        received: Stroops,
        source: &str,
    ) -> AppResult<bool> {
        let now: DateTime<Utc> = self.clock.now();
        let Some(done) = self
            .stores
            .deposits
            .complete_deposit(intent.id, tx_ref.clone(), received, now)
            .await?
        else {
            debug!("Deposit {} was finalized by another path", intent.id);
            return Ok(false);
        };

        self.stores
            .events
            .append_event(NewLedgerEvent {
                owner_id: done.owner_id,
                policy_id: None,
                event_type: EventType::DepositCredited,
                amount: received,
                reference: Some(refs::deposit(done.owner_id, done.id)),
                tx_ref,
                data: serde_json::json!({
                    "deposit_id": done.id,
                    "expected_amount": done.expected_amount,
                    "asset_code": done.asset_code,
                    "source": source,
                }),
                created_at: now,
            })
            .await?;

        info!("✅ Deposit {} completed via {}: {} {}", done.id, source, received, done.asset_code);
        Ok(true)
    }

    pub fn start<T: Ticker + 'static>(self: Arc<Self>, mut ticker: T) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("⏰ Deposit sweep started");
            while ticker.tick().await {
                if let Err(e) = self.sweep().await {
                    error!("❌ Deposit sweep aborted: {}", e);
                }
            }
        })
    }
}

/// Heuristic match: same asset, at least the expected amount, not older than the intent.
fn qualifies(intent: &DepositIntent, payment: &ExternalPayment) -> bool {
    payment.asset_code == intent.asset_code
        && payment.amount >= intent.expected_amount
        && payment.created_at >= intent.created_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::DepositStore;
    use crate::test_support::{harness, t0, OWNER_ADDRESS, OWNER_ID};

    fn payment(tx: &str, amount: i64) -> ExternalPayment {
        ExternalPayment {
            id: format!("op-{}", tx),
            tx_ref: tx.to_string(),
            from: Some("GANCHOR".into()),
            to: OWNER_ADDRESS.to_string(),
            asset_code: "XLM".into(),
            amount: Stroops(amount),
            created_at: t0() + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_initiate_builds_anchor_url() {
        let h = harness();
        let started = h
            .deposits
            .initiate_deposit(OWNER_ID, Stroops(500_000_000), None)
            .await
            .unwrap();

        assert_eq!(started.intent.status, DepositStatus::Pending);
        assert_eq!(
            started.interactive_url,
            format!(
                "https://testanchor.stellar.org/deposit?wallet={}&amount=50&asset=XLM",
                OWNER_ADDRESS
            )
        );
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_complete_once() {
        let h = harness();
        let started = h.deposits.initiate_deposit(OWNER_ID, Stroops(50), None).await.unwrap();
        h.ledger.add_payment(OWNER_ADDRESS, payment("tx-60", 60));
        h.ledger.set_delay(Duration::from_millis(20));

        let (a, b) = tokio::join!(h.deposits.sweep(), h.deposits.sweep());
        let completed = a.unwrap().completed + b.unwrap().completed;

        assert_eq!(completed, 1);
        let done = h.store.get_deposit(started.intent.id).await.unwrap().unwrap();
        assert_eq!(done.status, DepositStatus::Completed);
        assert_eq!(done.received_amount, Some(Stroops(60)));
        assert_eq!(h.store.event_count(EventType::DepositCredited), 1);
    }

    #[tokio::test]
    async fn test_smaller_or_older_payments_do_not_match() {
        let h = harness();
        h.deposits.initiate_deposit(OWNER_ID, Stroops(50), None).await.unwrap();
        h.ledger.add_payment(OWNER_ADDRESS, payment("tx-small", 49));
        let mut old = payment("tx-old", 100);
        old.created_at = t0() - chrono::Duration::days(1);
        h.ledger.add_payment(OWNER_ADDRESS, old);

        let report = h.deposits.sweep().await.unwrap();

        assert_eq!(report.unmatched, 1);
        assert_eq!(h.store.event_count(EventType::DepositCredited), 0);
    }

    #[tokio::test]
    async fn test_one_payment_never_completes_two_intents() {
        let h = harness();
        h.deposits.initiate_deposit(OWNER_ID, Stroops(50), None).await.unwrap();
        h.deposits.initiate_deposit(OWNER_ID, Stroops(50), None).await.unwrap();
        h.ledger.add_payment(OWNER_ADDRESS, payment("tx-only", 50));

        let report = h.deposits.sweep().await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.unmatched, 1);
    }

    #[tokio::test]
    async fn test_webhook_and_sweep_converge() {
        let h = harness();
        let started = h.deposits.initiate_deposit(OWNER_ID, Stroops(50), None).await.unwrap();
        let hook = |status: &str| AnchorWebhook {
            transaction: AnchorTransaction {
                id: started.intent.id.to_string(),
                status: status.to_string(),
                amount_in: Some("0.000006".into()),
                stellar_transaction_id: Some("tx-anchor".into()),
            },
        };

        let waiting = h.deposits.handle_webhook(hook("pending_trust")).await.unwrap();
        assert_eq!(waiting.status, DepositStatus::PendingTrust);
        let waiting = h
            .deposits
            .handle_webhook(hook("pending_user_transfer_start"))
            .await
            .unwrap();
        assert_eq!(waiting.status, DepositStatus::PendingUserTransferStart);

        let done = h.deposits.handle_webhook(hook("completed")).await.unwrap();
        assert_eq!(done.status, DepositStatus::Completed);
        assert_eq!(done.received_amount, Some(Stroops(60)));

        let again = h.deposits.handle_webhook(hook("completed")).await.unwrap();
        assert_eq!(again.status, DepositStatus::Completed);

        h.ledger.add_payment(OWNER_ADDRESS, payment("tx-anchor", 60));
        let report = h.deposits.sweep().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(h.store.event_count(EventType::DepositCredited), 1);
    }

    #[test]
    fn test_anchor_status_mapping() {
        assert_eq!(map_anchor_status("incomplete"), AnchorStatus::Open(DepositStatus::Pending));
        assert_eq!(map_anchor_status("pending_anchor"), AnchorStatus::Open(DepositStatus::Pending));
        assert_eq!(map_anchor_status("completed"), AnchorStatus::Completed);
        assert_eq!(map_anchor_status("refunded"), AnchorStatus::Unknown);
    }
}
