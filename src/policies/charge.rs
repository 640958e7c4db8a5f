// Premium charge protocol.
//
// Order is fixed: reserve the reference, call the chain, record the outcome on the
// reference, then touch local balances and the event log. A crash after the chain call
// leaves a `pending` or `collected` reference behind for the reconciler.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::amount::Stroops;
use crate::error::{AppResult, SettlementError};
use crate::execution::{with_timeout, LedgerClient, SettlementResult};
use crate::ledger::models::*;
use crate::ledger::Stores;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// Funds moved on the chain and were debited locally.
    Collected {
        reference: String,
        tx_ref: String,
        legacy: bool,
    },
    /// The chain entry point was unavailable; nothing moved, the cycle is recorded as skipped.
    Skipped { reference: String, reason: String },
    /// An earlier attempt already resolved this reference.
    AlreadySettled(PremiumRef),
    /// Another worker holds the reservation and its call has not resolved yet.
    InFlight(PremiumRef),
}

impl ChargeOutcome {
    pub fn is_collected(&self) -> bool {
        match self {
            ChargeOutcome::Collected { .. } => true,
            ChargeOutcome::AlreadySettled(r) => r.status == RefStatus::Collected,
            _ => false,
        }
    }

    fn from_existing(record: PremiumRef) -> Self {
        if record.is_settled() {
            ChargeOutcome::AlreadySettled(record)
        } else {
            ChargeOutcome::InFlight(record)
        }
    }
}

pub struct ChargeProtocol {
    stores: Stores,
    ledger: Arc<dyn LedgerClient>,
    call_timeout: Duration,
}

impl ChargeProtocol {
    pub fn new(stores: Stores, ledger: Arc<dyn LedgerClient>, call_timeout: Duration) -> Self {
        Self {
            stores,
            ledger,
            call_timeout,
        }
    }

    /// Charge one hour of premium on `policy` under `reference`.
    ///
    /// Hard failures and timeouts mark the reference `failed` and surface as
    /// `HardSettlement`, so the next attempt retries under the same reference.
    #[instrument(skip(self, policy), fields(policy_id = %policy.id))]
    pub async fn charge(
        &self,
        policy: &Policy,
        kind: RefKind,
        reference: &str,
        at: DateTime<Utc>,
    ) -> AppResult<ChargeOutcome> {
        let amount = policy.hourly_rate;

        if self.stores.refs.ref_exists(reference).await? {
            if let Some(existing) = self.stores.refs.get_ref(reference).await? {
                return Ok(ChargeOutcome::from_existing(existing));
            }
        }

        let reservation = self
            .stores
            .refs
            .reserve_ref(NewPremiumRef {
                reference: reference.to_string(),
                kind,
                policy_id: policy.id,
                owner_id: policy.owner_id,
                amount,
            })
            .await?;

        if let Reservation::AlreadyExists(existing) = reservation {
            return Ok(ChargeOutcome::from_existing(existing));
        }

        match self.call_chain(policy, kind, reference).await {
            Ok((tx_ref, legacy)) => {
                self.stores
                    .refs
                    .attach_ref(
                        reference,
                        RefOutcome::Collected {
                            tx_ref: tx_ref.clone(),
                            legacy,
                        },
                    )
                    .await?;

                if let Err(e) = self
                    .stores
                    .policies
                    .adjust_policy_balances(policy.id, -amount, amount)
                    .await
                {
                    error!(
                        "❌ Collected {} on chain (tx {}) but local debit failed for policy {} ref {}: {}",
                        amount, tx_ref, policy.id, reference, e
                    );
                    return Err(e);
                }

                self.stores
                    .events
                    .append_event(
                        NewLedgerEvent::for_policy(policy, EventType::PolicyHourlyCharge, amount, at)
                            .with_reference(reference)
                            .with_tx_ref(Some(tx_ref.clone()))
                            .with_data(serde_json::json!({ "kind": kind, "legacy": legacy })),
                    )
                    .await?;

                info!("💰 Collected {} XLM for policy {} ({})", amount, policy.id, reference);
                Ok(ChargeOutcome::Collected {
                    reference: reference.to_string(),
                    tx_ref,
                    legacy,
                })
            }
            Err(err @ (SettlementError::Soft(_) | SettlementError::Ambiguous(_))) => {
                let outcome_unknown = matches!(err, SettlementError::Ambiguous(_));
                let reason = err.to_string();
                if outcome_unknown {
                    error!(
                        "❌ Charge outcome unknown for policy {} ref {}, recording skip for review: {}",
                        policy.id, reference, reason
                    );
                } else {
                    warn!(
                        "⚠️ Settlement entry point unavailable for policy {} ref {}, skipping cycle: {}",
                        policy.id, reference, reason
                    );
                }
                self.stores
                    .refs
                    .attach_ref(
                        reference,
                        RefOutcome::Skipped {
                            reason: reason.clone(),
                        },
                    )
                    .await?;

                self.stores
                    .events
                    .append_event(
                        NewLedgerEvent::for_policy(policy, EventType::PremiumChargeSkipped, amount, at)
                            .with_reference(reference)
                            .with_data(serde_json::json!({
                                "kind": kind,
                                "reason": reason,
                                "outcome_unknown": outcome_unknown,
                            })),
                    )
                    .await?;

                Ok(ChargeOutcome::Skipped {
                    reference: reference.to_string(),
                    reason,
                })
            }
            Err(err) => {
                self.stores.refs.fail_ref(reference, &err.to_string()).await?;
                Err(err.into_app_error(policy.id, reference))
            }
        }
    }

    /// Returns the tx ref and whether it went through the non-keyed entry point.
    /// Only a missing keyed entry point falls back; an unreadable keyed result may already
    /// have charged, so it is returned as is.
    async fn call_chain(
        &self,
        policy: &Policy,
        kind: RefKind,
        reference: &str,
    ) -> SettlementResult<(String, bool)> {
        let account = policy.settlement_address.as_str();
        let amount: Stroops = policy.hourly_rate;

        if kind == RefKind::Activation {
            return with_timeout(
                self.call_timeout,
                self.ledger
                    .activate_policy(account, &policy.product_id, amount, reference),
            )
            .await
            .map(|tx| (tx, false));
        }

        match with_timeout(
            self.call_timeout,
            self.ledger.collect_premium_with_ref(account, amount, reference),
        )
        .await
        {
            Err(SettlementError::Soft(reason)) => {
                warn!(
                    "collect_premium_with_ref unavailable ({}), falling back to collect_premium for {}",
                    reason, reference
                );
                with_timeout(self.call_timeout, self.ledger.collect_premium(account, amount))
                    .await
                    .map(|tx| (tx, true))
            }
            other => other.map(|tx| (tx, false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::execution::mock::MockLedgerClient;
    use crate::ledger::memory::MemoryStore;
    use crate::ledger::store::{EventStore, PolicyStore, PremiumRefStore};
    use crate::test_support::{active_policy, memory_store, t0};

    fn protocol(store: &Arc<MemoryStore>, ledger: &Arc<MockLedgerClient>) -> ChargeProtocol {
        ChargeProtocol::new(Stores::memory(store.clone()), ledger.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_same_period_charges_once() {
        let store = memory_store();
        let ledger = Arc::new(MockLedgerClient::new());
        let policy = active_policy(&store, Stroops(100), Stroops(1000)).await;
        let charges = protocol(&store, &ledger);
        let reference = refs::hourly(policy.id, t0());

        let first = charges.charge(&policy, RefKind::Hourly, &reference, t0()).await.unwrap();
        let second = charges.charge(&policy, RefKind::Hourly, &reference, t0()).await.unwrap();

        assert!(matches!(first, ChargeOutcome::Collected { legacy: false, .. }));
        assert!(matches!(second, ChargeOutcome::AlreadySettled(_)));
        assert_eq!(ledger.calls("collect_premium_with_ref"), 1);

        let after = store.get_policy(policy.id).await.unwrap().unwrap();
        assert_eq!(after.funding_balance, Stroops(900));
        assert_eq!(after.total_premium_paid, Stroops(100));
        assert_eq!(store.event_count(EventType::PolicyHourlyCharge), 1);
    }

    #[tokio::test]
    async fn test_missing_keyed_entry_point_falls_back_to_legacy() {
        let store = memory_store();
        let ledger = Arc::new(MockLedgerClient::new());
        ledger.fail_always(
            "collect_premium_with_ref",
            SettlementError::Soft("non-existent contract function".into()),
        );
        let policy = active_policy(&store, Stroops(100), Stroops(1000)).await;
        let reference = refs::hourly(policy.id, t0());

        let outcome = protocol(&store, &ledger)
            .charge(&policy, RefKind::Hourly, &reference, t0())
            .await
            .unwrap();

        assert!(matches!(outcome, ChargeOutcome::Collected { legacy: true, .. }));
        assert_eq!(ledger.calls("collect_premium"), 1);
        assert!(store.get_ref(&reference).await.unwrap().unwrap().legacy);
    }

    #[tokio::test]
    async fn test_unreadable_keyed_result_never_falls_back() {
        let store = memory_store();
        let ledger = Arc::new(MockLedgerClient::new());
        ledger.script(
            "collect_premium_with_ref",
            Err(SettlementError::Ambiguous("failed to decode relay result: EOF".into())),
        );
        let policy = active_policy(&store, Stroops(100), Stroops(1000)).await;
        let reference = refs::hourly(policy.id, t0());
        let charges = protocol(&store, &ledger);

        let outcome = charges
            .charge(&policy, RefKind::Hourly, &reference, t0())
            .await
            .unwrap();

        assert!(matches!(outcome, ChargeOutcome::Skipped { .. }));
        assert_eq!(ledger.calls("collect_premium"), 0);
        assert_eq!(
            store.get_ref(&reference).await.unwrap().unwrap().status,
            RefStatus::Skipped
        );
        let untouched = store.get_policy(policy.id).await.unwrap().unwrap();
        assert_eq!(untouched.funding_balance, Stroops(1000));
        let skipped = store
            .list_events_by_policy(policy.id, &[EventType::PremiumChargeSkipped])
            .await
            .unwrap();
        assert_eq!(skipped[0].data["outcome_unknown"], serde_json::json!(true));

        let again = charges.charge(&policy, RefKind::Hourly, &reference, t0()).await.unwrap();
        assert!(matches!(again, ChargeOutcome::AlreadySettled(_)));
        assert_eq!(ledger.calls("collect_premium_with_ref"), 1);
    }

    #[tokio::test]
    async fn test_soft_failure_records_skip_without_debit() {
        let store = memory_store();
        let ledger = Arc::new(MockLedgerClient::new());
        let missing = SettlementError::Soft("unknown method".into());
        ledger.fail_always("collect_premium_with_ref", missing.clone());
        ledger.fail_always("collect_premium", missing);
        let policy = active_policy(&store, Stroops(100), Stroops(1000)).await;
        let reference = refs::hourly(policy.id, t0());

        let outcome = protocol(&store, &ledger)
            .charge(&policy, RefKind::Hourly, &reference, t0())
            .await
            .unwrap();

        assert!(matches!(outcome, ChargeOutcome::Skipped { .. }));
        let after = store.get_policy(policy.id).await.unwrap().unwrap();
        assert_eq!(after.funding_balance, Stroops(1000));
        let skipped = store
            .list_events_by_policy(policy.id, &[EventType::PremiumChargeSkipped])
            .await
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(
            store.get_ref(&reference).await.unwrap().unwrap().status,
            RefStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_hard_failure_fails_reference_and_retries() {
        let store = memory_store();
        let ledger = Arc::new(MockLedgerClient::new());
        ledger.script("collect_premium_with_ref", Err(SettlementError::Hard("rejected".into())));
        let policy = active_policy(&store, Stroops(100), Stroops(1000)).await;
        let reference = refs::hourly(policy.id, t0());
        let charges = protocol(&store, &ledger);

        let err = charges
            .charge(&policy, RefKind::Hourly, &reference, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::HardSettlement { .. }));
        assert!(!store.ref_exists(&reference).await.unwrap());

        let retry = charges.charge(&policy, RefKind::Hourly, &reference, t0()).await.unwrap();
        assert!(retry.is_collected());
        assert_eq!(store.get_ref(&reference).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_timeout_is_hard_not_skipped() {
        let store = memory_store();
        let ledger = Arc::new(MockLedgerClient::new());
        ledger.set_delay(Duration::from_millis(200));
        let policy = active_policy(&store, Stroops(100), Stroops(1000)).await;
        let reference = refs::hourly(policy.id, t0());
        let charges =
            ChargeProtocol::new(Stores::memory(store.clone()), ledger.clone(), Duration::from_millis(20));

        let err = charges
            .charge(&policy, RefKind::Hourly, &reference, t0())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::HardSettlement { .. }));
        assert_eq!(store.event_count(EventType::PremiumChargeSkipped), 0);
        assert_eq!(
            store.get_ref(&reference).await.unwrap().unwrap().status,
            RefStatus::Failed
        );
    }
}
