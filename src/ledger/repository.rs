use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::amount::Stroops;
use crate::error::{AppError, AppResult};

const POLICY_COLUMNS: &str = r#"
    id, owner_id, product_id, status, settlement_address,
    hourly_rate, funding_balance, total_premium_paid, coverage_limit,
    start_date, end_date, last_charge_at, next_charge_at, created_at, updated_at
"#;

const REF_COLUMNS: &str = r#"
    reference, kind, policy_id, owner_id, amount, status, tx_ref, legacy,
    failure_reason, attempts, created_at, updated_at
"#;

const EVENT_COLUMNS: &str = r#"
    id, owner_id, policy_id, event_type, amount, currency, reference, tx_ref, data, created_at
"#;

const DEPOSIT_COLUMNS: &str = r#"
    id, owner_id, expected_amount, asset_code, status, external_id, matched_tx_ref,
    received_amount, created_at, updated_at, completed_at
"#;

const CLAIM_COLUMNS: &str = r#"
    id, owner_id, policy_id, claim_type, description, incident_date, claimed_amount,
    approved_amount, status, payout_tx_ref, created_at, updated_at
"#;

/// Ledger repository - Postgres backing for every storage port
///
/// Each method is a single statement; cross-row consistency is the engine's job.
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ========== POLICY OPERATIONS ==========

#[async_trait]
impl PolicyStore for LedgerRepository {
    async fn insert_policy(&self, policy: &Policy) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO policies (
                id, owner_id, product_id, status, settlement_address,
                hourly_rate, funding_balance, total_premium_paid, coverage_limit,
                start_date, end_date, last_charge_at, next_charge_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(policy.id)
        .bind(policy.owner_id)
        .bind(&policy.product_id)
        .bind(policy.status)
        .bind(&policy.settlement_address)
        .bind(policy.hourly_rate)
        .bind(policy.funding_balance)
        .bind(policy.total_premium_paid)
        .bind(policy.coverage_limit)
        .bind(policy.start_date)
        .bind(policy.end_date)
        .bind(policy.last_charge_at)
        .bind(policy.next_charge_at)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_policy(&self, id: Uuid) -> AppResult<Option<Policy>> {
        let policy = sqlx::query_as::<_, Policy>(&format!(
            "SELECT {} FROM policies WHERE id = $1",
            POLICY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(policy)
    }

    async fn list_policies(&self) -> AppResult<Vec<Policy>> {
        let policies = sqlx::query_as::<_, Policy>(&format!(
            "SELECT {} FROM policies ORDER BY created_at DESC",
            POLICY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(policies)
    }

    async fn list_policies_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Policy>> {
        let policies = sqlx::query_as::<_, Policy>(&format!(
            "SELECT {} FROM policies WHERE owner_id = $1 ORDER BY created_at DESC",
            POLICY_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(policies)
    }

    async fn update_policy_fields(&self, id: Uuid, patch: PolicyPatch) -> AppResult<Policy> {
        let (set_next, next) = match patch.next_charge_at {
            Some(next) => (true, next),
            None => (false, None),
        };

        sqlx::query_as::<_, Policy>(&format!(
            r#"
            UPDATE policies
            SET status = COALESCE($2, status),
                next_charge_at = CASE WHEN $3 THEN $4 ELSE next_charge_at END,
                last_charge_at = COALESCE($5, last_charge_at),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            POLICY_COLUMNS
        ))
        .bind(id)
        .bind(patch.status)
        .bind(set_next)
        .bind(next)
        .bind(patch.last_charge_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Policy {} not found", id)))
    }

    async fn adjust_policy_balances(
        &self,
        id: Uuid,
        funding_delta: Stroops,
        paid_delta: Stroops,
    ) -> AppResult<Policy> {
        let updated = sqlx::query_as::<_, Policy>(&format!(
            r#"
            UPDATE policies
            SET funding_balance = funding_balance + $2,
                total_premium_paid = total_premium_paid + $3,
                updated_at = NOW()
            WHERE id = $1 AND funding_balance + $2 >= 0
            RETURNING {}
            "#,
            POLICY_COLUMNS
        ))
        .bind(id)
        .bind(funding_delta)
        .bind(paid_delta)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(policy) => Ok(policy),
            None => {
                let current = self
                    .get_policy(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("Policy {} not found", id)))?;
                Err(AppError::InsufficientFunding {
                    policy_id: id,
                    required: -funding_delta,
                    available: current.funding_balance,
                })
            }
        }
    }
}

// ========== IDEMPOTENCY LEDGER ==========

#[async_trait]
impl PremiumRefStore for LedgerRepository {
    async fn ref_exists(&self, reference: &str) -> AppResult<bool> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT reference FROM premium_refs WHERE reference = $1 AND status <> 'failed'",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn get_ref(&self, reference: &str) -> AppResult<Option<PremiumRef>> {
        let record = sqlx::query_as::<_, PremiumRef>(&format!(
            "SELECT {} FROM premium_refs WHERE reference = $1",
            REF_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn reserve_ref(&self, new: NewPremiumRef) -> AppResult<Reservation> {
        // Insert-or-fail in one statement; only a failed row is re-claimed, at the new amount.
        let reserved = sqlx::query_as::<_, PremiumRef>(&format!(
            r#"
            INSERT INTO premium_refs (reference, kind, policy_id, owner_id, amount, status, attempts)
            VALUES ($1, $2, $3, $4, $5, 'pending', 1)
            ON CONFLICT (reference) DO UPDATE
                SET status = 'pending',
                    amount = EXCLUDED.amount,
                    attempts = premium_refs.attempts + 1,
                    failure_reason = NULL,
                    updated_at = NOW()
                WHERE premium_refs.status = 'failed'
            RETURNING {}
            "#,
            REF_COLUMNS
        ))
        .bind(&new.reference)
        .bind(new.kind)
        .bind(new.policy_id)
        .bind(new.owner_id)
        .bind(new.amount)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = reserved {
            return Ok(Reservation::Reserved(record));
        }

        let existing = self.get_ref(&new.reference).await?.ok_or_else(|| {
            AppError::Internal(format!("Reference {} vanished during reserve", new.reference))
        })?;

        if existing.amount != new.amount {
            return Err(AppError::Validation(format!(
                "Reference {} already recorded with amount {}",
                new.reference, existing.amount
            )));
        }

        Ok(Reservation::AlreadyExists(existing))
    }

    async fn attach_ref(&self, reference: &str, outcome: RefOutcome) -> AppResult<PremiumRef> {
        let (status, tx_ref, legacy, reason) = match outcome {
            RefOutcome::Collected { tx_ref, legacy } => (RefStatus::Collected, Some(tx_ref), legacy, None),
            RefOutcome::Skipped { reason } => (RefStatus::Skipped, None, false, Some(reason)),
        };

        sqlx::query_as::<_, PremiumRef>(&format!(
            r#"
            UPDATE premium_refs
            SET status = $2, tx_ref = $3, legacy = $4, failure_reason = $5, updated_at = NOW()
            WHERE reference = $1 AND status = 'pending'
            RETURNING {}
            "#,
            REF_COLUMNS
        ))
        .bind(reference)
        .bind(status)
        .bind(tx_ref)
        .bind(legacy)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("Reference {} is not pending", reference)))
    }

    async fn fail_ref(&self, reference: &str, reason: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE premium_refs
            SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE reference = $1 AND status = 'pending'
            "#,
        )
        .bind(reference)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_refs_by_policy(&self, policy_id: Uuid) -> AppResult<Vec<PremiumRef>> {
        let refs = sqlx::query_as::<_, PremiumRef>(&format!(
            "SELECT {} FROM premium_refs WHERE policy_id = $1 ORDER BY reference DESC",
            REF_COLUMNS
        ))
        .bind(policy_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(refs)
    }

    async fn fail_stale_refs(&self, cutoff: DateTime<Utc>, reason: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE premium_refs
            SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE status = 'pending' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ========== EVENT LEDGER ==========

#[async_trait]
impl EventStore for LedgerRepository {
    async fn append_event(&self, event: NewLedgerEvent) -> AppResult<LedgerEvent> {
        let entry = sqlx::query_as::<_, LedgerEvent>(&format!(
            r#"
            INSERT INTO ledger_events (
                id, owner_id, policy_id, event_type, amount, currency, reference, tx_ref, data, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(event.owner_id)
        .bind(event.policy_id)
        .bind(event.event_type)
        .bind(event.amount)
        .bind(CURRENCY)
        .bind(event.reference)
        .bind(event.tx_ref)
        .bind(event.data)
        .bind(event.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn list_events_by_policy(
        &self,
        policy_id: Uuid,
        types: &[EventType],
    ) -> AppResult<Vec<LedgerEvent>> {
        let events = sqlx::query_as::<_, LedgerEvent>(&format!(
            r#"
            SELECT {} FROM ledger_events
            WHERE policy_id = $1 AND (cardinality($2::text[]) = 0 OR event_type::text = ANY($2))
            ORDER BY created_at DESC
            "#,
            EVENT_COLUMNS
        ))
        .bind(policy_id)
        .bind(types.iter().map(|t| t.as_str().to_string()).collect::<Vec<_>>())
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn list_events_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<LedgerEvent>> {
        let events = sqlx::query_as::<_, LedgerEvent>(&format!(
            "SELECT {} FROM ledger_events WHERE owner_id = $1 ORDER BY created_at DESC",
            EVENT_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn event_exists(&self, reference: &str, event_type: EventType) -> AppResult<bool> {
        let found: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM ledger_events WHERE reference = $1 AND event_type = $2 LIMIT 1",
        )
        .bind(reference)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }
}

// ========== DEPOSIT INTENTS ==========

#[async_trait]
impl DepositStore for LedgerRepository {
    async fn insert_deposit(&self, intent: &DepositIntent) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deposit_intents (
                id, owner_id, expected_amount, asset_code, status, external_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(intent.id)
        .bind(intent.owner_id)
        .bind(intent.expected_amount)
        .bind(&intent.asset_code)
        .bind(intent.status)
        .bind(&intent.external_id)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_deposit(&self, id: Uuid) -> AppResult<Option<DepositIntent>> {
        let intent = sqlx::query_as::<_, DepositIntent>(&format!(
            "SELECT {} FROM deposit_intents WHERE id = $1",
            DEPOSIT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(intent)
    }

    async fn find_deposit_by_external_id(&self, external_id: &str) -> AppResult<Option<DepositIntent>> {
        let intent = sqlx::query_as::<_, DepositIntent>(&format!(
            "SELECT {} FROM deposit_intents WHERE external_id = $1",
            DEPOSIT_COLUMNS
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(intent)
    }

    async fn find_pending_deposits(&self) -> AppResult<Vec<DepositIntent>> {
        let intents = sqlx::query_as::<_, DepositIntent>(&format!(
            "SELECT {} FROM deposit_intents WHERE status <> 'COMPLETED' ORDER BY created_at ASC",
            DEPOSIT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(intents)
    }

    async fn list_completed_deposits(&self) -> AppResult<Vec<DepositIntent>> {
        let intents = sqlx::query_as::<_, DepositIntent>(&format!(
            "SELECT {} FROM deposit_intents WHERE status = 'COMPLETED'",
            DEPOSIT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(intents)
    }

    async fn update_deposit_status(
        &self,
        id: Uuid,
        status: DepositStatus,
        external_id: Option<String>,
    ) -> AppResult<DepositIntent> {
        let updated = sqlx::query_as::<_, DepositIntent>(&format!(
            r#"
            UPDATE deposit_intents
            SET status = $2, external_id = COALESCE($3, external_id), updated_at = NOW()
            WHERE id = $1 AND status <> 'COMPLETED'
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        ))
        .bind(id)
        .bind(status)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(intent) => Ok(intent),
            None => self
                .get_deposit(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Deposit {} not found", id))),
        }
    }

    async fn complete_deposit(
        &self,
        id: Uuid,
        tx_ref: Option<String>,
        received: Stroops,
        at: DateTime<Utc>,
    ) -> AppResult<Option<DepositIntent>> {
        let completed = sqlx::query_as::<_, DepositIntent>(&format!(
            r#"
            UPDATE deposit_intents
            SET status = 'COMPLETED', matched_tx_ref = $2, received_amount = $3,
                completed_at = $4, updated_at = $4
            WHERE id = $1 AND status <> 'COMPLETED'
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        ))
        .bind(id)
        .bind(tx_ref)
        .bind(received)
        .bind(at)
        .fetch_optional(&self.pool)
        .await;

        match completed {
            Ok(intent) => Ok(intent),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(AppError::Conflict(
                format!("Payment for deposit {} already matched to another intent", id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_payment_matched(&self, tx_ref: &str) -> AppResult<bool> {
        let found: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM deposit_intents WHERE matched_tx_ref = $1")
                .bind(tx_ref)
                .fetch_optional(&self.pool)
                .await?;

        Ok(found.is_some())
    }
}

// ========== CLAIMS ==========

#[async_trait]
impl ClaimStore for LedgerRepository {
    async fn insert_claim(&self, claim: &Claim) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO claims (
                id, owner_id, policy_id, claim_type, description, incident_date,
                claimed_amount, approved_amount, status, payout_tx_ref, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(claim.id)
        .bind(claim.owner_id)
        .bind(claim.policy_id)
        .bind(&claim.claim_type)
        .bind(&claim.description)
        .bind(claim.incident_date)
        .bind(claim.claimed_amount)
        .bind(claim.approved_amount)
        .bind(claim.status)
        .bind(&claim.payout_tx_ref)
        .bind(claim.created_at)
        .bind(claim.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_claim(&self, id: Uuid) -> AppResult<Option<Claim>> {
        let claim = sqlx::query_as::<_, Claim>(&format!(
            "SELECT {} FROM claims WHERE id = $1",
            CLAIM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claim)
    }

    async fn list_claims_by_policy(&self, policy_id: Uuid) -> AppResult<Vec<Claim>> {
        let claims = sqlx::query_as::<_, Claim>(&format!(
            "SELECT {} FROM claims WHERE policy_id = $1",
            CLAIM_COLUMNS
        ))
        .bind(policy_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(claims)
    }

    async fn list_claims_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Claim>> {
        let claims = sqlx::query_as::<_, Claim>(&format!(
            "SELECT {} FROM claims WHERE owner_id = $1 ORDER BY created_at DESC",
            CLAIM_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(claims)
    }

    async fn transition_claim(&self, id: Uuid, transition: ClaimTransition) -> AppResult<Option<Claim>> {
        let claim = sqlx::query_as::<_, Claim>(&format!(
            r#"
            UPDATE claims
            SET status = $3,
                approved_amount = COALESCE($4, approved_amount),
                payout_tx_ref = COALESCE($5, payout_tx_ref),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            CLAIM_COLUMNS
        ))
        .bind(id)
        .bind(transition.from)
        .bind(transition.to)
        .bind(transition.approved_amount)
        .bind(transition.payout_tx_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claim)
    }
}
