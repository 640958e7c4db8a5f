use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::amount::Stroops;
use crate::clock::hour_key;

pub const CURRENCY: &str = "XLM";

/// Policy lifecycle status
///
/// PENDING_FUNDING → ACTIVE ⇄ PAUSED → EXPIRED, plus ACTIVE → EXPIRED on end date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "policy_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyStatus {
    PendingFunding,
    Active,
    Paused,
    Expired,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::PendingFunding => "PENDING_FUNDING",
            PolicyStatus::Active => "ACTIVE",
            PolicyStatus::Paused => "PAUSED",
            PolicyStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy / funding account
///
/// INVARIANTS:
/// - funding_balance >= 0
/// - next_charge_at is None only when status is not billing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Policy {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub product_id: String,
    pub status: PolicyStatus,
    pub settlement_address: String,
    pub hourly_rate: Stroops,
    pub funding_balance: Stroops,
    pub total_premium_paid: Stroops,
    pub coverage_limit: Stroops,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub last_charge_at: Option<DateTime<Utc>>,
    pub next_charge_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn is_past_end(&self, now: DateTime<Utc>) -> bool {
        matches!(self.end_date, Some(end) if end < now)
    }

    /// Status as seen by readers: a lapsed end date reads as EXPIRED even before it is persisted.
    pub fn effective_status(&self, now: DateTime<Utc>) -> PolicyStatus {
        if self.status != PolicyStatus::Expired && self.is_past_end(now) {
            PolicyStatus::Expired
        } else {
            self.status
        }
    }

    pub fn with_effective_status(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.effective_status(now);
        self
    }

    pub fn can_cover_hour(&self) -> bool {
        self.funding_balance >= self.hourly_rate
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == PolicyStatus::Active
            && matches!(self.next_charge_at, Some(next) if next <= now)
    }
}

/// Input for issuing a policy (the product catalog lives outside this service)
#[derive(Debug, Clone)]
pub struct NewPolicy {
    pub owner_id: Uuid,
    pub product_id: String,
    pub hourly_rate: Stroops,
    pub coverage_limit: Stroops,
    pub initial_funding: Stroops,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Partial update of a policy's status and billing cursor
#[derive(Debug, Clone, Default)]
pub struct PolicyPatch {
    pub status: Option<PolicyStatus>,
    /// `Some(None)` clears the cursor.
    pub next_charge_at: Option<Option<DateTime<Utc>>>,
    pub last_charge_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "premium_ref_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Activation,
    Hourly,
    Payout,
}

impl RefKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RefKind::Activation => "activate",
            RefKind::Hourly => "hour",
            RefKind::Payout => "payout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "premium_ref_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RefStatus {
    /// Reserved; external call in flight or outcome unknown
    Pending,
    Collected,
    /// External entry point unavailable; cycle advanced without moving funds
    Skipped,
    /// External call rejected; the reference may be re-reserved with the same amount
    Failed,
}

/// Idempotency record, one per logical settlement action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PremiumRef {
    pub reference: String,
    pub kind: RefKind,
    pub policy_id: Uuid,
    pub owner_id: Uuid,
    pub amount: Stroops,
    pub status: RefStatus,
    pub tx_ref: Option<String>,
    pub legacy: bool,
    pub failure_reason: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PremiumRef {
    pub fn is_settled(&self) -> bool {
        matches!(self.status, RefStatus::Collected | RefStatus::Skipped)
    }
}

#[derive(Debug, Clone)]
pub struct NewPremiumRef {
    pub reference: String,
    pub kind: RefKind,
    pub policy_id: Uuid,
    pub owner_id: Uuid,
    pub amount: Stroops,
}

/// Result of an atomic insert-or-fail on the idempotency ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Reserved(PremiumRef),
    AlreadyExists(PremiumRef),
}

/// How a reserved reference resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefOutcome {
    Collected { tx_ref: String, legacy: bool },
    Skipped { reason: String },
}

/// Deterministic idempotency references.
pub mod refs {
    use super::*;

    pub fn activation(policy_id: Uuid, at: DateTime<Utc>) -> String {
        format!("{}:{}:{}", RefKind::Activation.prefix(), policy_id, hour_key(at))
    }

    /// Reference for the billing period starting at the policy's charge cursor.
    pub fn hourly(policy_id: Uuid, period_start: DateTime<Utc>) -> String {
        format!("{}:{}:{}", RefKind::Hourly.prefix(), policy_id, hour_key(period_start))
    }

    pub fn payout(policy_id: Uuid, claim_id: Uuid) -> String {
        format!("{}:{}:{}", RefKind::Payout.prefix(), policy_id, claim_id)
    }

    pub fn deposit(owner_id: Uuid, intent_id: Uuid) -> String {
        format!("deposit:{}:{}", owner_id, intent_id)
    }
}

/// Ledger event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PolicyActivated,
    PolicyHourlyCharge,
    PremiumChargeSkipped,
    PolicyPaused,
    PolicyExpired,
    FundingTopUp,
    DepositCredited,
    ClaimPayout,
}

impl EventType {
    pub const CHARGES: [EventType; 2] = [EventType::PolicyHourlyCharge, EventType::PremiumChargeSkipped];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PolicyActivated => "policy_activated",
            EventType::PolicyHourlyCharge => "policy_hourly_charge",
            EventType::PremiumChargeSkipped => "premium_charge_skipped",
            EventType::PolicyPaused => "policy_paused",
            EventType::PolicyExpired => "policy_expired",
            EventType::FundingTopUp => "funding_top_up",
            EventType::DepositCredited => "deposit_credited",
            EventType::ClaimPayout => "claim_payout",
        }
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub policy_id: Option<Uuid>,
    pub event_type: EventType,
    pub amount: Stroops,
    pub currency: String,
    pub reference: Option<String>,
    pub tx_ref: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEvent {
    pub owner_id: Uuid,
    pub policy_id: Option<Uuid>,
    pub event_type: EventType,
    pub amount: Stroops,
    pub reference: Option<String>,
    pub tx_ref: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEvent {
    pub fn for_policy(policy: &Policy, event_type: EventType, amount: Stroops, at: DateTime<Utc>) -> Self {
        Self {
            owner_id: policy.owner_id,
            policy_id: Some(policy.id),
            event_type,
            amount,
            reference: None,
            tx_ref: None,
            data: serde_json::json!({}),
            created_at: at,
        }
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    pub fn with_tx_ref(mut self, tx_ref: Option<String>) -> Self {
        self.tx_ref = tx_ref;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Deposit intent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "deposit_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    Pending,
    PendingTrust,
    PendingUserTransferStart,
    Completed,
}

impl DepositStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositStatus::Completed)
    }
}

/// Expected incoming top-up awaiting confirmation on the external ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DepositIntent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub expected_amount: Stroops,
    pub asset_code: String,
    pub status: DepositStatus,
    pub external_id: Option<String>,
    pub matched_tx_ref: Option<String>,
    pub received_amount: Option<Stroops>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "claim_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Submitted,
    Approved,
    Paid,
}

impl ClaimStatus {
    /// Counts against the policy's coverage limit.
    pub fn is_committed(&self) -> bool {
        matches!(self, ClaimStatus::Approved | ClaimStatus::Paid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Claim {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub policy_id: Uuid,
    pub claim_type: String,
    pub description: String,
    pub incident_date: NaiveDate,
    pub claimed_amount: Stroops,
    pub approved_amount: Option<Stroops>,
    pub status: ClaimStatus,
    pub payout_tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    pub fn committed_amount(&self) -> Stroops {
        if self.status.is_committed() {
            self.approved_amount.unwrap_or(Stroops::ZERO)
        } else {
            Stroops::ZERO
        }
    }
}

/// Conditional claim update: applied only if the claim is still in `from`
#[derive(Debug, Clone)]
pub struct ClaimTransition {
    pub from: ClaimStatus,
    pub to: ClaimStatus,
    pub approved_amount: Option<Stroops>,
    pub payout_tx_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(end: Option<DateTime<Utc>>) -> Policy {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Policy {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            product_id: "INCOME_PER_DIEM".into(),
            status: PolicyStatus::Active,
            settlement_address: "G".into(),
            hourly_rate: Stroops(10),
            funding_balance: Stroops(10),
            total_premium_paid: Stroops::ZERO,
            coverage_limit: Stroops(1000),
            start_date: None,
            end_date: end,
            last_charge_at: None,
            next_charge_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_lazy_expiry() {
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let p = policy(Some(end));
        assert_eq!(p.effective_status(end - chrono::Duration::hours(1)), PolicyStatus::Active);
        assert_eq!(p.effective_status(end + chrono::Duration::hours(1)), PolicyStatus::Expired);
        assert!(!p.is_due(end + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_reference_formats_are_deterministic() {
        let id = Uuid::nil();
        let a = Utc.with_ymd_and_hms(2024, 5, 1, 13, 1, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 5, 1, 13, 59, 59).unwrap();
        assert_eq!(refs::hourly(id, a), refs::hourly(id, b));
        assert_eq!(
            refs::hourly(id, a),
            "hour:00000000-0000-0000-0000-000000000000:2024-05-01T13"
        );
        assert!(refs::activation(id, a).starts_with("activate:"));
    }
}
