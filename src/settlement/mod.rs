// Settlement reconciliation logic
//
// Local writes happen after the chain call, one point write at a time. A crash in between
// leaves one of these behind, and this sweep repairs each:
// - a `pending` reference whose call never resolved: failed, so billing retries it
// - a `collected` reference with no charge event: event appended, marked recovered
// - collected premium above `total_premium_paid`: the missing debit is applied
// - a completed deposit with no credit event: event appended
//
// Only records untouched for the stale window are considered, so a charge still
// finishing its local writes is never repaired twice.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::amount::Stroops;
use crate::clock::{Clock, Ticker};
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::Stores;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub stale_references_failed: u64,
    pub events_recovered: usize,
    pub balances_repaired: usize,
    pub deposits_recovered: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.stale_references_failed == 0
            && self.events_recovered == 0
            && self.balances_repaired == 0
            && self.deposits_recovered == 0
    }
}

pub struct SettlementReconciler {
    stores: Stores,
    clock: Arc<dyn Clock>,
    stale_after: ChronoDuration,
}

impl SettlementReconciler {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>, stale_after: ChronoDuration) -> Self {
        Self {
            stores,
            clock,
            stale_after,
        }
    }

    #[instrument(skip(self))]
    pub async fn reconcile_pending(&self) -> AppResult<ReconcileReport> {
        let now = self.clock.now();
        let cutoff = now - self.stale_after;
        let mut report = ReconcileReport::default();

        report.stale_references_failed = self
            .stores
            .refs
            .fail_stale_refs(cutoff, "no outcome recorded within the stale window")
            .await?;
        if report.stale_references_failed > 0 {
            warn!(
                "⚠️ Failed {} stale pending references; they will be retried",
                report.stale_references_failed
            );
        }

        for policy in self.stores.policies.list_policies().await? {
            if let Err(e) = self.reconcile_policy(&policy, cutoff, now, &mut report).await {
                report.failed += 1;
                error!("❌ Reconciliation failed for policy {}: {}", policy.id, e);
            }
        }

        for intent in self.stores.deposits.list_completed_deposits().await? {
            if let Err(e) = self.reconcile_deposit(&intent, cutoff, now, &mut report).await {
                report.failed += 1;
                error!("❌ Reconciliation failed for deposit {}: {}", intent.id, e);
            }
        }

        if !report.is_clean() {
            info!("🔧 Reconciliation repaired state: {:?}", report);
        }
        Ok(report)
    }

    async fn reconcile_policy(
        &self,
        policy: &Policy,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> AppResult<()> {
        let references = self.stores.refs.list_refs_by_policy(policy.id).await?;
        for record in references.iter().filter(|r| r.kind != RefKind::Payout) {
            let event_type = match record.status {
                RefStatus::Collected => EventType::PolicyHourlyCharge,
                RefStatus::Skipped => EventType::PremiumChargeSkipped,
                _ => continue,
            };

            if record.updated_at >= cutoff
                || self.stores.events.event_exists(&record.reference, event_type).await?
            {
                continue;
            }

            self.stores
                .events
                .append_event(
                    NewLedgerEvent::for_policy(policy, event_type, record.amount, now)
                        .with_reference(&record.reference)
                        .with_tx_ref(record.tx_ref.clone())
                        .with_data(serde_json::json!({
                            "kind": record.kind,
                            "legacy": record.legacy,
                            "recovered": true,
                        })),
                )
                .await?;
            report.events_recovered += 1;
            warn!("Recovered missing {:?} event for {}", event_type, record.reference);
        }

        // Count only references old enough that their own local writes have finished.
        let settled = Stroops::checked_sum(
            references
                .iter()
                .filter(|r| r.kind != RefKind::Payout && r.status == RefStatus::Collected && r.updated_at < cutoff)
                .map(|r| r.amount),
        )?;

        if settled > policy.total_premium_paid {
            let missing = settled
                .checked_sub(policy.total_premium_paid)
                .ok_or_else(|| AppError::Validation(format!("Premium totals out of range on policy {}", policy.id)))?;
            let debit = missing.min(policy.funding_balance);
            self.stores
                .policies
                .adjust_policy_balances(policy.id, -debit, missing)
                .await?;
            report.balances_repaired += 1;

            if debit < missing {
                error!(
                    "🚨 Policy {} collected {} on chain without local debit; only {} was available to debit",
                    policy.id, missing, debit
                );
            } else {
                warn!("Applied missing debit of {} to policy {}", missing, policy.id);
            }
        }

        Ok(())
    }

    async fn reconcile_deposit(
        &self,
        intent: &DepositIntent,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> AppResult<()> {
        if matches!(intent.completed_at, Some(at) if at >= cutoff) {
            return Ok(());
        }

        let reference = refs::deposit(intent.owner_id, intent.id);
        if self
            .stores
            .events
            .event_exists(&reference, EventType::DepositCredited)
            .await?
        {
            return Ok(());
        }

        let amount = intent.received_amount.unwrap_or(intent.expected_amount);
        self.stores
            .events
            .append_event(NewLedgerEvent {
                owner_id: intent.owner_id,
                policy_id: None,
                event_type: EventType::DepositCredited,
                amount,
                reference: Some(reference),
                tx_ref: intent.matched_tx_ref.clone(),
                data: serde_json::json!({
                    "deposit_id": intent.id,
                    "expected_amount": intent.expected_amount,
                    "asset_code": intent.asset_code,
                    "recovered": true,
                }),
                created_at: now,
            })
            .await?;
        report.deposits_recovered += 1;
        warn!("Recovered missing credit for deposit {}", intent.id);
        Ok(())
    }

    pub fn start<T: Ticker + 'static>(self: Arc<Self>, mut ticker: T) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("⏰ Settlement reconciler started");
            while ticker.tick().await {
                if let Err(e) = self.reconcile_pending().await {
                    error!("❌ Reconciliation sweep aborted: {}", e);
                }
            }
        })
    }
}
