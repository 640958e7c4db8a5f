// Storage ports. Every engine component receives these through its constructor;
// `repository::LedgerRepository` backs them with Postgres and `memory::MemoryStore`
// with process memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::amount::Stroops;
use crate::error::AppResult;

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn insert_policy(&self, policy: &Policy) -> AppResult<()>;

    async fn get_policy(&self, id: Uuid) -> AppResult<Option<Policy>>;

    async fn list_policies(&self) -> AppResult<Vec<Policy>>;

    async fn list_policies_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Policy>>;

    /// UpdatePolicyFields: status and billing cursor only.
    async fn update_policy_fields(&self, id: Uuid, patch: PolicyPatch) -> AppResult<Policy>;

    /// Atomically add the deltas to funding balance and cumulative premium.
    ///
    /// Fails with `InsufficientFunding` (and changes nothing) if the funding balance
    /// would go negative.
    async fn adjust_policy_balances(
        &self,
        id: Uuid,
        funding_delta: Stroops,
        paid_delta: Stroops,
    ) -> AppResult<Policy>;
}

#[async_trait]
pub trait PremiumRefStore: Send + Sync {
    /// True for any record that is not `failed`.
    async fn ref_exists(&self, reference: &str) -> AppResult<bool>;

    async fn get_ref(&self, reference: &str) -> AppResult<Option<PremiumRef>>;

    /// Insert-or-fail. A `failed` record is re-claimed atomically and takes the new amount;
    /// a live reference with a different amount is a validation error.
    async fn reserve_ref(&self, new: NewPremiumRef) -> AppResult<Reservation>;

    /// `pending` -> `collected` | `skipped`.
    async fn attach_ref(&self, reference: &str, outcome: RefOutcome) -> AppResult<PremiumRef>;

    /// `pending` -> `failed`.
    async fn fail_ref(&self, reference: &str, reason: &str) -> AppResult<()>;

    async fn list_refs_by_policy(&self, policy_id: Uuid) -> AppResult<Vec<PremiumRef>>;

    /// Move `pending` records last touched before `cutoff` to `failed`. Returns how many moved.
    async fn fail_stale_refs(&self, cutoff: DateTime<Utc>, reason: &str) -> AppResult<u64>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, event: NewLedgerEvent) -> AppResult<LedgerEvent>;

    /// Events for a policy, newest first. An empty type filter returns every type.
    async fn list_events_by_policy(
        &self,
        policy_id: Uuid,
        types: &[EventType],
    ) -> AppResult<Vec<LedgerEvent>>;

    async fn list_events_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<LedgerEvent>>;

    async fn event_exists(&self, reference: &str, event_type: EventType) -> AppResult<bool>;
}

#[async_trait]
pub trait DepositStore: Send + Sync {
    async fn insert_deposit(&self, intent: &DepositIntent) -> AppResult<()>;

    async fn get_deposit(&self, id: Uuid) -> AppResult<Option<DepositIntent>>;

    async fn find_deposit_by_external_id(&self, external_id: &str) -> AppResult<Option<DepositIntent>>;

    /// FindDepositIntentsPending: every intent not yet COMPLETED, oldest first.
    async fn find_pending_deposits(&self) -> AppResult<Vec<DepositIntent>>;

    async fn list_completed_deposits(&self) -> AppResult<Vec<DepositIntent>>;

    /// Update an open intent's intermediate status. COMPLETED intents are returned unchanged.
    async fn update_deposit_status(
        &self,
        id: Uuid,
        status: DepositStatus,
        external_id: Option<String>,
    ) -> AppResult<DepositIntent>;

    /// Compare-and-set to COMPLETED. `Some` only for the caller that performed the transition.
    async fn complete_deposit(
        &self,
        id: Uuid,
        tx_ref: Option<String>,
        received: Stroops,
        at: DateTime<Utc>,
    ) -> AppResult<Option<DepositIntent>>;

    /// Whether an external payment has already been bound to a completed intent.
    async fn is_payment_matched(&self, tx_ref: &str) -> AppResult<bool>;
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn insert_claim(&self, claim: &Claim) -> AppResult<()>;

    async fn get_claim(&self, id: Uuid) -> AppResult<Option<Claim>>;

    async fn list_claims_by_policy(&self, policy_id: Uuid) -> AppResult<Vec<Claim>>;

    async fn list_claims_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Claim>>;

    /// Conditional update; `None` if the claim was no longer in `transition.from`.
    async fn transition_claim(&self, id: Uuid, transition: ClaimTransition) -> AppResult<Option<Claim>>;
}

/// GetOrCreateWalletAddress: canonical owner -> settlement address mapping.
#[async_trait]
pub trait WalletDirectory: Send + Sync {
    async fn get_or_create_address(&self, owner_id: Uuid) -> AppResult<String>;
}
