use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::amount::Stroops;
use crate::clock::Clock;
use crate::error::{AppError, AppResult, SettlementError};
use crate::execution::{with_timeout, LedgerClient};
use crate::ledger::models::*;
use crate::ledger::Stores;

#[derive(Debug, Clone)]
pub struct NewClaim {
    pub owner_id: Uuid,
    pub policy_id: Uuid,
    pub claim_type: String,
    pub description: String,
    pub incident_date: NaiveDate,
    pub claimed_amount: Stroops,
}

/// Claim Settlement
///
/// Approval order: coverage check, local PAID mark, payout through the ledger client,
/// compensation back to APPROVED if the payout fails. Approval is not automatically
/// retryable; callers re-read the claim first.
pub struct ClaimService {
    stores: Stores,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl ClaimService {
    pub fn new(
        stores: Stores,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            stores,
            ledger,
            clock,
            call_timeout,
        }
    }

    async fn load(&self, id: Uuid) -> AppResult<Claim> {
        self.stores
            .claims
            .get_claim(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Claim {} not found", id)))
    }

    #[instrument(skip(self, input), fields(policy_id = %input.policy_id))]
    pub async fn submit_claim(&self, input: NewClaim) -> AppResult<Claim> {
        if !input.claimed_amount.is_positive() {
            return Err(AppError::Validation("claim_amount must be positive".into()));
        }
        if input.claim_type.trim().is_empty() {
            return Err(AppError::Validation("claim_type is required".into()));
        }

        let policy = self
            .stores
            .policies
            .get_policy(input.policy_id)
            .await?
            .filter(|p| p.owner_id == input.owner_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Policy {} not found for owner {}",
                    input.policy_id, input.owner_id
                ))
            })?;

        let now = self.clock.now();
        let claim = Claim {
            id: Uuid::new_v4(),
            owner_id: input.owner_id,
            policy_id: policy.id,
            claim_type: input.claim_type,
            description: input.description,
            incident_date: input.incident_date,
            claimed_amount: input.claimed_amount,
            approved_amount: None,
            status: ClaimStatus::Submitted,
            payout_tx_ref: None,
            created_at: now,
            updated_at: now,
        };
        self.stores.claims.insert_claim(&claim).await?;

        info!("📝 Claim {} submitted on policy {}", claim.id, policy.id);
        Ok(claim)
    }

    pub async fn list_claims(&self, owner_id: Uuid) -> AppResult<Vec<Claim>> {
        self.stores.claims.list_claims_by_owner(owner_id).await
    }

    #[instrument(skip(self))]
    pub async fn approve_claim(&self, id: Uuid, approved_amount: Stroops) -> AppResult<Claim> {
        let claim = self.load(id).await?;
        if claim.status == ClaimStatus::Paid {
            return Err(AppError::Conflict(format!("Claim {} is already paid", id)));
        }
        if !approved_amount.is_positive() || approved_amount > claim.claimed_amount {
            return Err(AppError::Validation(format!(
                "approved_amount must be in (0, {}]",
                claim.claimed_amount
            )));
        }

        let policy = self
            .stores
            .policies
            .get_policy(claim.policy_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Policy {} not found", claim.policy_id)))?;

        let committed = Stroops::checked_sum(
            self.stores
                .claims
                .list_claims_by_policy(policy.id)
                .await?
                .iter()
                .filter(|c| c.id != claim.id)
                .map(Claim::committed_amount),
        )?;
        let requested_total = committed
            .checked_add(approved_amount)
            .ok_or_else(|| AppError::Validation("Committed claim total out of range".into()))?;

        if requested_total > policy.coverage_limit {
            return Err(AppError::CoverageExceeded {
                policy_id: policy.id,
                limit: policy.coverage_limit,
                committed,
                requested: approved_amount,
            });
        }

        self.transition(
            &claim,
            ClaimTransition {
                from: claim.status,
                to: ClaimStatus::Approved,
                approved_amount: Some(approved_amount),
                payout_tx_ref: None,
            },
        )
        .await?;

        let paid = self
            .transition(
                &claim,
                ClaimTransition {
                    from: ClaimStatus::Approved,
                    to: ClaimStatus::Paid,
                    approved_amount: None,
                    payout_tx_ref: None,
                },
            )
            .await?;

        self.pay_out(&policy, paid, approved_amount).await
    }

    async fn transition(&self, claim: &Claim, transition: ClaimTransition) -> AppResult<Claim> {
        let (from, to) = (transition.from, transition.to);
        self.stores
            .claims
            .transition_claim(claim.id, transition)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!(
                    "Claim {} changed concurrently (expected {:?} -> {:?})",
                    claim.id, from, to
                ))
            })
    }

    /// External payout for a claim already marked PAID.
    async fn pay_out(&self, policy: &Policy, claim: Claim, amount: Stroops) -> AppResult<Claim> {
        let reference = refs::payout(policy.id, claim.id);

        let reservation = match self
            .stores
            .refs
            .reserve_ref(NewPremiumRef {
                reference: reference.clone(),
                kind: RefKind::Payout,
                policy_id: policy.id,
                owner_id: claim.owner_id,
                amount,
            })
            .await
        {
            Ok(reservation) => reservation,
            Err(e) => return Err(self.compensate(&claim, &reference, e).await),
        };

        if let Reservation::AlreadyExists(existing) = reservation {
            return match (existing.status, existing.tx_ref) {
                (RefStatus::Collected, Some(tx_ref)) => {
                    info!("Payout {} already settled as {}, completing claim locally", reference, tx_ref);
                    self.record_payout(policy, &claim, amount, &reference, tx_ref).await
                }
                _ => {
                    let conflict = AppError::Conflict(format!(
                        "Payout {} is unresolved; reconcile before retrying",
                        reference
                    ));
                    Err(self.compensate(&claim, &reference, conflict).await)
                }
            };
        }

        let result = with_timeout(
            self.call_timeout,
            self.ledger.payout(&policy.settlement_address, amount),
        )
        .await;

        match result {
            Ok(tx_ref) => {
                self.stores
                    .refs
                    .attach_ref(
                        &reference,
                        RefOutcome::Collected {
                            tx_ref: tx_ref.clone(),
                            legacy: false,
                        },
                    )
                    .await?;
                info!("💸 Paid out {} XLM for claim {} ({})", amount, claim.id, tx_ref);
                self.record_payout(policy, &claim, amount, &reference, tx_ref).await
            }
            Err(SettlementError::Ambiguous(reason)) => {
                // Funds may have moved; the claim stays PAID until an operator resolves it.
                error!(
                    "🚨 Payout outcome unknown for claim {} ({}), left PAID without tx ref: {}",
                    claim.id, reference, reason
                );
                Err(SettlementError::Ambiguous(reason).into_app_error(policy.id, &reference))
            }
            Err(e) => {
                warn!("Payout for claim {} failed ({}): {}", claim.id, reference, e);
                self.stores.refs.fail_ref(&reference, &e.to_string()).await?;
                let failure = e.into_app_error(policy.id, &reference);
                Err(self.compensate(&claim, &reference, failure).await)
            }
        }
    }

    async fn record_payout(
        &self,
        policy: &Policy,
        claim: &Claim,
        amount: Stroops,
        reference: &str,
        tx_ref: String,
    ) -> AppResult<Claim> {
        let updated = self
            .transition(
                claim,
                ClaimTransition {
                    from: ClaimStatus::Paid,
                    to: ClaimStatus::Paid,
                    approved_amount: None,
                    payout_tx_ref: Some(tx_ref.clone()),
                },
            )
            .await?;

        if !self
            .stores
            .events
            .event_exists(reference, EventType::ClaimPayout)
            .await?
        {
            self.stores
                .events
                .append_event(
                    NewLedgerEvent::for_policy(policy, EventType::ClaimPayout, amount, self.clock.now())
                        .with_reference(reference)
                        .with_tx_ref(Some(tx_ref))
                        .with_data(serde_json::json!({
                            "claim_id": claim.id,
                            "claim_type": claim.claim_type,
                        })),
                )
                .await?;
        }
        Ok(updated)
    }

    /// Revert PAID -> APPROVED after a failed payout. Returns the error to surface.
    async fn compensate(&self, claim: &Claim, reference: &str, cause: AppError) -> AppError {
        let reverted = self
            .stores
            .claims
            .transition_claim(
                claim.id,
                ClaimTransition {
                    from: ClaimStatus::Paid,
                    to: ClaimStatus::Approved,
                    approved_amount: None,
                    payout_tx_ref: None,
                },
            )
            .await;

        match reverted {
            Ok(Some(_)) => cause,
            Ok(None) => {
                error!(
                    "🚨 COMPENSATION FAILED: claim {} left the PAID state concurrently after payout failure ({})",
                    claim.id, reference
                );
                AppError::CompensationFailure {
                    claim_id: claim.id,
                    reference: reference.to_string(),
                    message: format!("claim no longer PAID; original failure: {}", cause),
                }
            }
            Err(e) => {
                error!(
                    "🚨 COMPENSATION FAILED: claim {} stuck in PAID without payout ({}): {}",
                    claim.id, reference, e
                );
                AppError::CompensationFailure {
                    claim_id: claim.id,
                    reference: reference.to_string(),
                    message: format!("revert failed: {}; original failure: {}", e, cause),
                }
            }
        }
    }
}
