use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::amount::Stroops;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct State {
    policies: HashMap<Uuid, Policy>,
    refs: HashMap<String, PremiumRef>,
    events: Vec<LedgerEvent>,
    deposits: HashMap<Uuid, DepositIntent>,
    claims: HashMap<Uuid, Claim>,
    wallets: HashMap<Uuid, String>,
}

/// Process-local implementation of every storage port.
///
/// A single lock guards all tables, so each port call is atomic the same way a
/// single-statement Postgres write is. Row timestamps come from `clock`, the same
/// clock the jobs reading them use.
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    /// Pre-register an owner's settlement address.
    pub fn register_wallet(&self, owner_id: Uuid, address: &str) {
        self.state.lock().wallets.insert(owner_id, address.to_string());
    }

    pub fn event_count(&self, event_type: EventType) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> AppError {
    AppError::NotFound(format!("{} {} not found", kind, id))
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn insert_policy(&self, policy: &Policy) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.policies.contains_key(&policy.id) {
            return Err(AppError::Conflict(format!("Policy {} already exists", policy.id)));
        }
        state.policies.insert(policy.id, policy.clone());
        Ok(())
    }

    async fn get_policy(&self, id: Uuid) -> AppResult<Option<Policy>> {
        Ok(self.state.lock().policies.get(&id).cloned())
    }

    async fn list_policies(&self) -> AppResult<Vec<Policy>> {
        let mut policies: Vec<Policy> = self.state.lock().policies.values().cloned().collect();
        policies.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(policies)
    }

    async fn list_policies_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Policy>> {
        let mut policies: Vec<Policy> = self
            .state
            .lock()
            .policies
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        policies.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(policies)
    }

    async fn update_policy_fields(&self, id: Uuid, patch: PolicyPatch) -> AppResult<Policy> {
        let mut state = self.state.lock();
        let policy = state.policies.get_mut(&id).ok_or_else(|| not_found("Policy", id))?;
        if let Some(status) = patch.status {
            policy.status = status;
        }
        if let Some(next) = patch.next_charge_at {
            policy.next_charge_at = next;
        }
        if let Some(last) = patch.last_charge_at {
            policy.last_charge_at = Some(last);
        }
        policy.updated_at = self.clock.now();
        Ok(policy.clone())
    }

    async fn adjust_policy_balances(
        &self,
        id: Uuid,
        funding_delta: Stroops,
        paid_delta: Stroops,
    ) -> AppResult<Policy> {
        let mut state = self.state.lock();
        let policy = state.policies.get_mut(&id).ok_or_else(|| not_found("Policy", id))?;
        let funding = policy
            .funding_balance
            .checked_add(funding_delta)
            .ok_or_else(|| AppError::Validation("Funding balance overflow".into()))?;
        if funding.is_negative() {
            return Err(AppError::InsufficientFunding {
                policy_id: id,
                required: -funding_delta,
                available: policy.funding_balance,
            });
        }
        let paid = policy
            .total_premium_paid
            .checked_add(paid_delta)
            .ok_or_else(|| AppError::Validation("Premium total overflow".into()))?;
        policy.funding_balance = funding;
        policy.total_premium_paid = paid;
        policy.updated_at = self.clock.now();
        Ok(policy.clone())
    }
}

#[async_trait]
impl PremiumRefStore for MemoryStore {
    async fn ref_exists(&self, reference: &str) -> AppResult<bool> {
        Ok(self
            .state
            .lock()
            .refs
            .get(reference)
            .map(|r| r.status != RefStatus::Failed)
            .unwrap_or(false))
    }

    async fn get_ref(&self, reference: &str) -> AppResult<Option<PremiumRef>> {
        Ok(self.state.lock().refs.get(reference).cloned())
    }

    async fn reserve_ref(&self, new: NewPremiumRef) -> AppResult<Reservation> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        if let Some(existing) = state.refs.get_mut(&new.reference) {
            if existing.status == RefStatus::Failed {
                existing.status = RefStatus::Pending;
                existing.amount = new.amount;
                existing.attempts += 1;
                existing.failure_reason = None;
                existing.updated_at = now;
                return Ok(Reservation::Reserved(existing.clone()));
            }
            if existing.amount != new.amount {
                return Err(AppError::Validation(format!(
                    "Reference {} already recorded with amount {}",
                    new.reference, existing.amount
                )));
            }
            return Ok(Reservation::AlreadyExists(existing.clone()));
        }

        let record = PremiumRef {
            reference: new.reference.clone(),
            kind: new.kind,
            policy_id: new.policy_id,
            owner_id: new.owner_id,
            amount: new.amount,
            status: RefStatus::Pending,
            tx_ref: None,
            legacy: false,
            failure_reason: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
        };
        state.refs.insert(new.reference, record.clone());
        Ok(Reservation::Reserved(record))
    }

    async fn attach_ref(&self, reference: &str, outcome: RefOutcome) -> AppResult<PremiumRef> {
        let mut state = self.state.lock();
        let record = state
            .refs
            .get_mut(reference)
            .ok_or_else(|| not_found("Reference", reference))?;
        if record.status != RefStatus::Pending {
            return Err(AppError::Conflict(format!(
                "Reference {} is {:?}, expected pending",
                reference, record.status
            )));
        }
        match outcome {
            RefOutcome::Collected { tx_ref, legacy } => {
                record.status = RefStatus::Collected;
                record.tx_ref = Some(tx_ref);
                record.legacy = legacy;
            }
            RefOutcome::Skipped { reason } => {
                record.status = RefStatus::Skipped;
                record.failure_reason = Some(reason);
            }
        }
        record.updated_at = self.clock.now();
        Ok(record.clone())
    }

    async fn fail_ref(&self, reference: &str, reason: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        if let Some(record) = state.refs.get_mut(reference) {
            if record.status == RefStatus::Pending {
                record.status = RefStatus::Failed;
                record.failure_reason = Some(reason.to_string());
                record.updated_at = self.clock.now();
            }
        }
        Ok(())
    }

    async fn list_refs_by_policy(&self, policy_id: Uuid) -> AppResult<Vec<PremiumRef>> {
        let mut refs: Vec<PremiumRef> = self
            .state
            .lock()
            .refs
            .values()
            .filter(|r| r.policy_id == policy_id)
            .cloned()
            .collect();
        refs.sort_by(|a, b| b.reference.cmp(&a.reference));
        Ok(refs)
    }

    async fn fail_stale_refs(&self, cutoff: DateTime<Utc>, reason: &str) -> AppResult<u64> {
        let mut state = self.state.lock();
        let mut moved = 0;
        for record in state.refs.values_mut() {
            if record.status == RefStatus::Pending && record.updated_at < cutoff {
                record.status = RefStatus::Failed;
                record.failure_reason = Some(reason.to_string());
                record.updated_at = self.clock.now();
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, event: NewLedgerEvent) -> AppResult<LedgerEvent> {
        let entry = LedgerEvent {
            id: Uuid::new_v4(),
            owner_id: event.owner_id,
            policy_id: event.policy_id,
            event_type: event.event_type,
            amount: event.amount,
            currency: CURRENCY.to_string(),
            reference: event.reference,
            tx_ref: event.tx_ref,
            data: event.data,
            created_at: event.created_at,
        };
        self.state.lock().events.push(entry.clone());
        Ok(entry)
    }

    async fn list_events_by_policy(
        &self,
        policy_id: Uuid,
        types: &[EventType],
    ) -> AppResult<Vec<LedgerEvent>> {
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .rev()
            .filter(|e| e.policy_id == Some(policy_id))
            .filter(|e| types.is_empty() || types.contains(&e.event_type))
            .cloned()
            .collect())
    }

    async fn list_events_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<LedgerEvent>> {
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .rev()
            .filter(|e| e.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn event_exists(&self, reference: &str, event_type: EventType) -> AppResult<bool> {
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .any(|e| e.event_type == event_type && e.reference.as_deref() == Some(reference)))
    }
}

#[async_trait]
impl DepositStore for MemoryStore {
    async fn insert_deposit(&self, intent: &DepositIntent) -> AppResult<()> {
        self.state.lock().deposits.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn get_deposit(&self, id: Uuid) -> AppResult<Option<DepositIntent>> {
        Ok(self.state.lock().deposits.get(&id).cloned())
    }

    async fn find_deposit_by_external_id(&self, external_id: &str) -> AppResult<Option<DepositIntent>> {
        Ok(self
            .state
            .lock()
            .deposits
            .values()
            .find(|d| d.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_pending_deposits(&self) -> AppResult<Vec<DepositIntent>> {
        let mut open: Vec<DepositIntent> = self
            .state
            .lock()
            .deposits
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(open)
    }

    async fn list_completed_deposits(&self) -> AppResult<Vec<DepositIntent>> {
        Ok(self
            .state
            .lock()
            .deposits
            .values()
            .filter(|d| d.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_deposit_status(
        &self,
        id: Uuid,
        status: DepositStatus,
        external_id: Option<String>,
    ) -> AppResult<DepositIntent> {
        let mut state = self.state.lock();
        let intent = state.deposits.get_mut(&id).ok_or_else(|| not_found("Deposit", id))?;
        if !intent.status.is_terminal() {
            intent.status = status;
            if external_id.is_some() {
                intent.external_id = external_id;
            }
            intent.updated_at = self.clock.now();
        }
        Ok(intent.clone())
    }

    async fn complete_deposit(
        &self,
        id: Uuid,
        tx_ref: Option<String>,
        received: Stroops,
        at: DateTime<Utc>,
    ) -> AppResult<Option<DepositIntent>> {
        let mut state = self.state.lock();
        if let Some(tx) = tx_ref.as_deref() {
            let taken = state
                .deposits
                .values()
                .any(|d| d.id != id && d.matched_tx_ref.as_deref() == Some(tx));
            if taken {
                return Err(AppError::Conflict(format!("Payment {} already matched", tx)));
            }
        }
        let intent = state.deposits.get_mut(&id).ok_or_else(|| not_found("Deposit", id))?;
        if intent.status.is_terminal() {
            return Ok(None);
        }
        intent.status = DepositStatus::Completed;
        intent.matched_tx_ref = tx_ref;
        intent.received_amount = Some(received);
        intent.completed_at = Some(at);
        intent.updated_at = at;
        Ok(Some(intent.clone()))
    }

    async fn is_payment_matched(&self, tx_ref: &str) -> AppResult<bool> {
        Ok(self
            .state
            .lock()
            .deposits
            .values()
            .any(|d| d.matched_tx_ref.as_deref() == Some(tx_ref)))
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn insert_claim(&self, claim: &Claim) -> AppResult<()> {
        self.state.lock().claims.insert(claim.id, claim.clone());
        Ok(())
    }

    async fn get_claim(&self, id: Uuid) -> AppResult<Option<Claim>> {
        Ok(self.state.lock().claims.get(&id).cloned())
    }

    async fn list_claims_by_policy(&self, policy_id: Uuid) -> AppResult<Vec<Claim>> {
        Ok(self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| c.policy_id == policy_id)
            .cloned()
            .collect())
    }

    async fn list_claims_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Claim>> {
        let mut claims: Vec<Claim> = self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect();
        claims.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(claims)
    }

    async fn transition_claim(&self, id: Uuid, transition: ClaimTransition) -> AppResult<Option<Claim>> {
        let mut state = self.state.lock();
        let claim = state.claims.get_mut(&id).ok_or_else(|| not_found("Claim", id))?;
        if claim.status != transition.from {
            return Ok(None);
        }
        claim.status = transition.to;
        if transition.approved_amount.is_some() {
            claim.approved_amount = transition.approved_amount;
        }
        if transition.payout_tx_ref.is_some() {
            claim.payout_tx_ref = transition.payout_tx_ref;
        }
        claim.updated_at = self.clock.now();
        Ok(Some(claim.clone()))
    }
}

#[async_trait]
impl WalletDirectory for MemoryStore {
    async fn get_or_create_address(&self, owner_id: Uuid) -> AppResult<String> {
        self.state
            .lock()
            .wallets
            .get(&owner_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("No settlement wallet for owner {}", owner_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(SystemClock))
    }

    fn new_ref(reference: &str, amount: i64) -> NewPremiumRef {
        NewPremiumRef {
            reference: reference.to_string(),
            kind: RefKind::Hourly,
            policy_id: Uuid::nil(),
            owner_id: Uuid::nil(),
            amount: Stroops(amount),
        }
    }

    #[tokio::test]
    async fn test_reserve_is_insert_or_fail() {
        let store = store();
        assert!(matches!(
            store.reserve_ref(new_ref("hour:a:1", 10)).await.unwrap(),
            Reservation::Reserved(_)
        ));
        assert!(matches!(
            store.reserve_ref(new_ref("hour:a:1", 10)).await.unwrap(),
            Reservation::AlreadyExists(_)
        ));
        assert!(matches!(
            store.reserve_ref(new_ref("hour:a:1", 11)).await,
            Err(AppError::Validation(_))
        ));
        assert!(store.ref_exists("hour:a:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_reference_can_be_reclaimed() {
        let store = store();
        store.reserve_ref(new_ref("hour:a:1", 10)).await.unwrap();
        store.fail_ref("hour:a:1", "rejected").await.unwrap();
        assert!(!store.ref_exists("hour:a:1").await.unwrap());

        match store.reserve_ref(new_ref("hour:a:1", 10)).await.unwrap() {
            Reservation::Reserved(r) => assert_eq!(r.attempts, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_reference_is_reclaimed_at_new_amount() {
        let store = store();
        store.reserve_ref(new_ref("payout:a:b", 300)).await.unwrap();
        store.fail_ref("payout:a:b", "treasury empty").await.unwrap();

        match store.reserve_ref(new_ref("payout:a:b", 250)).await.unwrap() {
            Reservation::Reserved(r) => {
                assert_eq!(r.amount, Stroops(250));
                assert_eq!(r.attempts, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            store.reserve_ref(new_ref("payout:a:b", 200)).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_records_are_stamped_by_injected_clock() {
        let start = crate::test_support::t0();
        let clock = Arc::new(ManualClock::new(start));
        let store = MemoryStore::new(clock.clone());

        let reserved = match store.reserve_ref(new_ref("hour:a:1", 10)).await.unwrap() {
            Reservation::Reserved(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reserved.created_at, start);

        clock.advance(chrono::Duration::hours(2));
        let settled = store
            .attach_ref(
                "hour:a:1",
                RefOutcome::Collected {
                    tx_ref: "tx1".into(),
                    legacy: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(settled.created_at, start);
        assert_eq!(settled.updated_at, start + chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn test_settled_reference_is_never_reopened() {
        let store = store();
        store.reserve_ref(new_ref("hour:a:1", 10)).await.unwrap();
        store
            .attach_ref(
                "hour:a:1",
                RefOutcome::Collected {
                    tx_ref: "tx1".into(),
                    legacy: false,
                },
            )
            .await
            .unwrap();
        store.fail_ref("hour:a:1", "late failure").await.unwrap();

        let record = store.get_ref("hour:a:1").await.unwrap().unwrap();
        assert_eq!(record.status, RefStatus::Collected);
        assert!(store
            .attach_ref("hour:a:1", RefOutcome::Skipped { reason: "x".into() })
            .await
            .is_err());
    }
}
