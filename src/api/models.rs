use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::amount::Stroops;
use crate::claims::NewClaim;
use crate::error::{AppError, AppResult};
use crate::funding::SweepReport;
use crate::ledger::models::NewPolicy;
use crate::settlement::ReconcileReport;

// ========== REQUEST MODELS ==========
//
// Amounts arrive as decimal XLM strings (or JSON integers) and are parsed by the
// amount codec during deserialization.

fn positive_amount(amount: &Stroops) -> Result<(), ValidationError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(ValidationError::new("amount_must_be_positive"))
    }
}

/// Issue a policy (called by the product catalog on purchase)
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePolicyRequest {
    pub owner_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub product_id: String,
    #[validate(custom = "positive_amount")]
    pub hourly_rate: Stroops,
    #[validate(custom = "positive_amount")]
    pub coverage_limit: Stroops,
    #[serde(default)]
    pub initial_funding: Option<Stroops>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl CreatePolicyRequest {
    pub fn into_new_policy(self) -> AppResult<NewPolicy> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end <= start {
                return Err(AppError::Validation("end_date must be after start_date".into()));
            }
        }
        Ok(NewPolicy {
            owner_id: self.owner_id,
            product_id: self.product_id,
            hourly_rate: self.hourly_rate,
            coverage_limit: self.coverage_limit,
            initial_funding: self.initial_funding.unwrap_or(Stroops::ZERO),
            start_date: self.start_date,
            end_date: self.end_date,
        })
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct PausePolicyRequest {
    #[validate(length(min = 1, max = 256))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FundPolicyRequest {
    #[validate(custom = "positive_amount")]
    pub amount: Stroops,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitClaimRequest {
    pub owner_id: Uuid,
    pub policy_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub claim_type: String,
    #[validate(length(max = 4000))]
    #[serde(default)]
    pub description: String,
    pub incident_date: NaiveDate,
    #[validate(custom = "positive_amount")]
    pub claimed_amount: Stroops,
}

impl From<SubmitClaimRequest> for NewClaim {
    fn from(request: SubmitClaimRequest) -> Self {
        Self {
            owner_id: request.owner_id,
            policy_id: request.policy_id,
            claim_type: request.claim_type,
            description: request.description,
            incident_date: request.incident_date,
            claimed_amount: request.claimed_amount,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApproveClaimRequest {
    #[validate(custom = "positive_amount")]
    pub approved_amount: Stroops,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDepositRequest {
    pub owner_id: Uuid,
    #[validate(custom = "positive_amount")]
    pub amount: Stroops,
    #[validate(length(min = 1, max = 12))]
    pub asset_code: Option<String>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub storage: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WalletBalanceResponse {
    pub owner_id: Uuid,
    pub address: String,
    pub balance: Stroops,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub deposits: SweepReport,
    pub settlement: ReconcileReport,
}
