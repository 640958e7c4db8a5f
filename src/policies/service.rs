use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::charge::{ChargeOutcome, ChargeProtocol};
use crate::amount::Stroops;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::execution::{with_timeout, LedgerClient};
use crate::ledger::models::*;
use crate::ledger::Stores;

/// Idempotency records and charge events for one policy
#[derive(Debug, Clone, Serialize)]
pub struct ChargeHistory {
    pub policy_id: Uuid,
    pub references: Vec<PremiumRef>,
    pub events: Vec<LedgerEvent>,
}

/// Policy lifecycle: issuance, activation, pause, funding and reads with lazy expiry.
pub struct PolicyService {
    stores: Stores,
    ledger: Arc<dyn LedgerClient>,
    charges: Arc<ChargeProtocol>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl PolicyService {
    pub fn new(
        stores: Stores,
        ledger: Arc<dyn LedgerClient>,
        charges: Arc<ChargeProtocol>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            stores,
            ledger,
            charges,
            clock,
            call_timeout,
        }
    }

    async fn load(&self, id: Uuid) -> AppResult<Policy> {
        self.stores
            .policies
            .get_policy(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Policy {} not found", id)))
    }

    #[instrument(skip(self, input), fields(owner_id = %input.owner_id))]
    pub async fn create_policy(&self, input: NewPolicy) -> AppResult<Policy> {
        if !input.hourly_rate.is_positive() {
            return Err(AppError::Validation("hourly_rate must be positive".into()));
        }
        if input.coverage_limit.is_negative() || input.initial_funding.is_negative() {
            return Err(AppError::Validation("Amounts must not be negative".into()));
        }
        if let (Some(start), Some(end)) = (input.start_date, input.end_date) {
            if end <= start {
                return Err(AppError::Validation("end_date must be after start_date".into()));
            }
        }

        let settlement_address = self.stores.wallets.get_or_create_address(input.owner_id).await?;
        let now = self.clock.now();

        let policy = Policy {
            id: Uuid::new_v4(),
            owner_id: input.owner_id,
            product_id: input.product_id,
            status: PolicyStatus::PendingFunding,
            settlement_address,
            hourly_rate: input.hourly_rate,
            funding_balance: input.initial_funding,
            total_premium_paid: Stroops::ZERO,
            coverage_limit: input.coverage_limit,
            start_date: input.start_date,
            end_date: input.end_date,
            last_charge_at: None,
            next_charge_at: None,
            created_at: now,
            updated_at: now,
        };
        self.stores.policies.insert_policy(&policy).await?;

        if input.initial_funding.is_positive() {
            self.stores
                .events
                .append_event(
                    NewLedgerEvent::for_policy(&policy, EventType::FundingTopUp, input.initial_funding, now)
                        .with_data(serde_json::json!({ "source": "issuance" })),
                )
                .await?;
        }

        info!("📄 Issued policy {} for owner {}", policy.id, policy.owner_id);
        Ok(policy)
    }

    /// PENDING_FUNDING | PAUSED -> ACTIVE, charging the first hour synchronously.
    #[instrument(skip(self))]
    pub async fn activate_policy(&self, id: Uuid) -> AppResult<Policy> {
        let now = self.clock.now();
        let policy = self.load(id).await?.with_effective_status(now);

        match policy.status {
            PolicyStatus::PendingFunding | PolicyStatus::Paused => {}
            other => {
                return Err(AppError::InvalidTransition {
                    from: other.to_string(),
                    to: PolicyStatus::Active.to_string(),
                })
            }
        }

        if !policy.can_cover_hour() {
            return Err(AppError::InsufficientFunding {
                policy_id: id,
                required: policy.hourly_rate,
                available: policy.funding_balance,
            });
        }

        let reference = refs::activation(id, now);
        let outcome = self
            .charges
            .charge(&policy, RefKind::Activation, &reference, now)
            .await?;

        let skipped = match &outcome {
            ChargeOutcome::Collected { .. } => false,
            ChargeOutcome::Skipped { .. } => true,
            ChargeOutcome::AlreadySettled(record) => record.status == RefStatus::Skipped,
            ChargeOutcome::InFlight(_) => {
                return Err(AppError::Conflict(format!(
                    "Activation {} is already in progress",
                    reference
                )))
            }
        };

        let updated = self
            .stores
            .policies
            .update_policy_fields(
                id,
                PolicyPatch {
                    status: Some(PolicyStatus::Active),
                    next_charge_at: Some(Some(now + ChronoDuration::hours(1))),
                    last_charge_at: if skipped { None } else { Some(now) },
                },
            )
            .await?;

        let charged = if skipped { Stroops::ZERO } else { policy.hourly_rate };
        self.stores
            .events
            .append_event(
                NewLedgerEvent::for_policy(&updated, EventType::PolicyActivated, charged, now)
                    .with_reference(&reference)
                    .with_data(serde_json::json!({
                        "from": policy.status,
                        "premium_skipped": skipped,
                    })),
            )
            .await?;

        if skipped {
            warn!("⚠️ Policy {} activated without collecting premium ({})", id, reference);
        } else {
            info!("✅ Policy {} activated ({})", id, reference);
        }
        Ok(updated.with_effective_status(now))
    }

    /// Manual pause. Pausing an already paused policy is a no-op.
    #[instrument(skip(self))]
    pub async fn pause_policy(&self, id: Uuid, reason: &str) -> AppResult<Policy> {
        let now = self.clock.now();
        let policy = self.load(id).await?.with_effective_status(now);
        match policy.status {
            PolicyStatus::Active => self.pause(&policy, reason, now).await,
            PolicyStatus::Paused => Ok(policy),
            other => Err(AppError::InvalidTransition {
                from: other.to_string(),
                to: PolicyStatus::Paused.to_string(),
            }),
        }
    }

    /// ACTIVE -> PAUSED. The chain is notified best-effort; its failure never blocks the pause.
    pub(crate) async fn pause(&self, policy: &Policy, reason: &str, at: DateTime<Utc>) -> AppResult<Policy> {
        let updated = self
            .stores
            .policies
            .update_policy_fields(
                policy.id,
                PolicyPatch {
                    status: Some(PolicyStatus::Paused),
                    next_charge_at: Some(None),
                    last_charge_at: None,
                },
            )
            .await?;

        self.stores
            .events
            .append_event(
                NewLedgerEvent::for_policy(policy, EventType::PolicyPaused, Stroops::ZERO, at)
                    .with_data(serde_json::json!({
                        "reason": reason,
                        "funding_balance": policy.funding_balance,
                        "hourly_rate": policy.hourly_rate,
                    })),
            )
            .await?;

        if let Err(e) = with_timeout(
            self.call_timeout,
            self.ledger.pause_policy(&policy.settlement_address, policy.id),
        )
        .await
        {
            warn!("Pause notification for policy {} not delivered: {}", policy.id, e);
        }

        info!("⏸️ Policy {} paused: {}", policy.id, reason);
        Ok(updated)
    }

    /// Top up a policy's funding balance.
    #[instrument(skip(self))]
    pub async fn fund_policy(&self, id: Uuid, amount: Stroops) -> AppResult<Policy> {
        if !amount.is_positive() {
            return Err(AppError::Validation("Funding amount must be positive".into()));
        }
        let now = self.clock.now();
        let policy = self.load(id).await?;
        if policy.effective_status(now) == PolicyStatus::Expired {
            return Err(AppError::InvalidTransition {
                from: PolicyStatus::Expired.to_string(),
                to: "FUNDED".to_string(),
            });
        }

        let updated = self
            .stores
            .policies
            .adjust_policy_balances(id, amount, Stroops::ZERO)
            .await?;

        self.stores
            .events
            .append_event(
                NewLedgerEvent::for_policy(&updated, EventType::FundingTopUp, amount, now)
                    .with_data(serde_json::json!({ "funding_balance": updated.funding_balance })),
            )
            .await?;

        info!("💵 Funded policy {} with {} XLM", id, amount);
        Ok(updated.with_effective_status(now))
    }

    pub async fn get_policy(&self, id: Uuid) -> AppResult<Policy> {
        let now = self.clock.now();
        Ok(self.load(id).await?.with_effective_status(now))
    }

    pub async fn list_policies(&self, owner_id: Uuid) -> AppResult<Vec<Policy>> {
        let now = self.clock.now();
        Ok(self
            .stores
            .policies
            .list_policies_by_owner(owner_id)
            .await?
            .into_iter()
            .map(|p| p.with_effective_status(now))
            .collect())
    }

    pub async fn charge_history(&self, id: Uuid) -> AppResult<ChargeHistory> {
        self.load(id).await?;
        let references = self.stores.refs.list_refs_by_policy(id).await?;
        let events = self
            .stores
            .events
            .list_events_by_policy(id, &EventType::CHARGES)
            .await?;
        Ok(ChargeHistory {
            policy_id: id,
            references,
            events,
        })
    }

    pub async fn onchain_policy(&self, id: Uuid) -> AppResult<serde_json::Value> {
        self.load(id).await?;
        with_timeout(self.call_timeout, self.ledger.get_policy(id))
            .await
            .map_err(|e| e.into_app_error(id, "get_policy"))
    }

    /// Persist EXPIRED for every policy whose end date has passed. Returns how many moved.
    pub async fn expire_lapsed(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let lapsed: Vec<Policy> = self
            .stores
            .policies
            .list_policies()
            .await?
            .into_iter()
            .filter(|p| p.status != PolicyStatus::Expired && p.is_past_end(now))
            .collect();

        let mut expired = 0;
        for policy in lapsed {
            match self.expire(&policy, now).await {
                Ok(()) => expired += 1,
                Err(e) => error!("❌ Failed to expire policy {}: {}", policy.id, e),
            }
        }

        if expired > 0 {
            info!("⌛ Expired {} lapsed policies", expired);
        }
        Ok(expired)
    }

    async fn expire(&self, policy: &Policy, now: DateTime<Utc>) -> AppResult<()> {
        self.stores
            .policies
            .update_policy_fields(
                policy.id,
                PolicyPatch {
                    status: Some(PolicyStatus::Expired),
                    next_charge_at: Some(None),
                    last_charge_at: None,
                },
            )
            .await?;

        self.stores
            .events
            .append_event(
                NewLedgerEvent::for_policy(policy, EventType::PolicyExpired, Stroops::ZERO, now)
                    .with_data(serde_json::json!({ "from": policy.status, "end_date": policy.end_date })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SettlementError;
    use crate::execution::mock::MockLedgerClient;
    use crate::ledger::memory::MemoryStore;
    use crate::ledger::store::{EventStore, PolicyStore, PremiumRefStore};
    use crate::test_support::{harness, new_policy, t0, OWNER_ADDRESS};

    #[tokio::test]
    async fn test_create_resolves_canonical_address() {
        let h = harness();
        let policy = h.policies.create_policy(new_policy(Stroops(10), Stroops(10))).await.unwrap();
        assert_eq!(policy.status, PolicyStatus::PendingFunding);
        assert_eq!(policy.settlement_address, OWNER_ADDRESS);
        assert_eq!(h.store.event_count(EventType::FundingTopUp), 1);
    }

    #[tokio::test]
    async fn test_create_without_wallet_fails() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let ledger = Arc::new(MockLedgerClient::new());
        let stores = Stores::memory(store);
        let charges = Arc::new(ChargeProtocol::new(stores.clone(), ledger.clone(), Duration::from_secs(1)));
        let service = PolicyService::new(stores, ledger, charges, clock, Duration::from_secs(1));

        let err = service.create_policy(new_policy(Stroops(10), Stroops(10))).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_activation_with_exact_balance_ends_at_zero() {
        let h = harness();
        let policy = h.policies.create_policy(new_policy(Stroops(50), Stroops(50))).await.unwrap();

        let active = h.policies.activate_policy(policy.id).await.unwrap();

        assert_eq!(active.status, PolicyStatus::Active);
        assert_eq!(active.funding_balance, Stroops::ZERO);
        assert_eq!(active.total_premium_paid, Stroops(50));
        assert_eq!(active.next_charge_at, Some(t0() + ChronoDuration::hours(1)));
        assert_eq!(h.ledger.calls("activate_policy"), 1);
        assert_eq!(h.store.event_count(EventType::PolicyActivated), 1);
        assert_eq!(h.store.event_count(EventType::PolicyHourlyCharge), 1);
    }

    #[tokio::test]
    async fn test_activation_below_rate_is_rejected() {
        let h = harness();
        let policy = h.policies.create_policy(new_policy(Stroops(50), Stroops(49))).await.unwrap();

        let err = h.policies.activate_policy(policy.id).await.unwrap_err();

        assert!(matches!(err, AppError::InsufficientFunding { .. }));
        let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PolicyStatus::PendingFunding);
        assert_eq!(h.ledger.calls("activate_policy"), 0);
    }

    #[tokio::test]
    async fn test_soft_fail_activation_still_activates() {
        let h = harness();
        h.ledger.fail_always(
            "activate_policy",
            SettlementError::Soft("HostError: Error(WasmVm, MissingValue)".into()),
        );
        let policy = h.policies.create_policy(new_policy(Stroops(50), Stroops(80))).await.unwrap();

        let active = h.policies.activate_policy(policy.id).await.unwrap();

        assert_eq!(active.status, PolicyStatus::Active);
        assert_eq!(active.funding_balance, Stroops(80));
        assert_eq!(active.total_premium_paid, Stroops::ZERO);
        assert_eq!(h.store.event_count(EventType::PremiumChargeSkipped), 1);
        let record = h
            .store
            .get_ref(&refs::activation(policy.id, t0()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RefStatus::Skipped);
    }

    #[tokio::test]
    async fn test_hard_fail_activation_leaves_status() {
        let h = harness();
        h.ledger.script("activate_policy", Err(SettlementError::Hard("contract panicked".into())));
        let policy = h.policies.create_policy(new_policy(Stroops(50), Stroops(80))).await.unwrap();

        let err = h.policies.activate_policy(policy.id).await.unwrap_err();

        assert!(matches!(err, AppError::HardSettlement { .. }));
        let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PolicyStatus::PendingFunding);
        assert_eq!(stored.funding_balance, Stroops(80));
    }

    #[tokio::test]
    async fn test_pause_survives_failed_notification() {
        let h = harness();
        let policy = h.policies.create_policy(new_policy(Stroops(50), Stroops(100))).await.unwrap();
        h.policies.activate_policy(policy.id).await.unwrap();
        h.ledger.fail_always("pause_policy", SettlementError::Hard("relay down".into()));

        let paused = h.policies.pause_policy(policy.id, "manual").await.unwrap();

        assert_eq!(paused.status, PolicyStatus::Paused);
        assert_eq!(paused.next_charge_at, None);
        assert_eq!(h.ledger.calls("pause_policy"), 1);
        assert_eq!(h.store.event_count(EventType::PolicyPaused), 1);
    }

    #[tokio::test]
    async fn test_fund_and_reactivate_after_pause() {
        let h = harness();
        let policy = h.policies.create_policy(new_policy(Stroops(50), Stroops(50))).await.unwrap();
        h.policies.activate_policy(policy.id).await.unwrap();
        h.policies.pause_policy(policy.id, "manual").await.unwrap();

        let funded = h.policies.fund_policy(policy.id, Stroops(120)).await.unwrap();
        assert_eq!(funded.funding_balance, Stroops(120));

        h.clock.advance(ChronoDuration::hours(2));
        let active = h.policies.activate_policy(policy.id).await.unwrap();
        assert_eq!(active.status, PolicyStatus::Active);
        assert_eq!(active.funding_balance, Stroops(70));
        assert_eq!(h.ledger.calls("activate_policy"), 2);
    }

    #[tokio::test]
    async fn test_lazy_expiry_and_persisting_job() {
        let h = harness();
        let mut input = new_policy(Stroops(10), Stroops(100));
        input.end_date = Some(t0() + ChronoDuration::hours(3));
        let policy = h.policies.create_policy(input).await.unwrap();
        h.policies.activate_policy(policy.id).await.unwrap();

        h.clock.advance(ChronoDuration::hours(4));
        let read = h.policies.get_policy(policy.id).await.unwrap();
        assert_eq!(read.status, PolicyStatus::Expired);
        let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PolicyStatus::Active);

        let moved = h.policies.expire_lapsed(h.clock.now()).await.unwrap();
        assert_eq!(moved, 1);
        let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PolicyStatus::Expired);
        assert_eq!(stored.next_charge_at, None);
        assert_eq!(h.policies.expire_lapsed(h.clock.now()).await.unwrap(), 0);

        let err = h.policies.fund_policy(policy.id, Stroops(5)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_charge_history_lists_references_and_events() {
        let h = harness();
        let policy = h.policies.create_policy(new_policy(Stroops(10), Stroops(100))).await.unwrap();
        h.policies.activate_policy(policy.id).await.unwrap();

        let history = h.policies.charge_history(policy.id).await.unwrap();

        assert_eq!(history.references.len(), 1);
        assert_eq!(history.events.len(), 1);
        assert!(h
            .store
            .list_events_by_policy(policy.id, &[])
            .await
            .unwrap()
            .len()
            >= 3);
    }
}
