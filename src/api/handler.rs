use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::models::*;
use crate::{
    claims::ClaimService,
    config::StorageBackend,
    error::{AppError, AppResult},
    execution::{with_timeout, LedgerClient},
    funding::{AnchorWebhook, DepositInitiated, DepositReconciler},
    ledger::{
        models::{Claim, DepositIntent, LedgerEvent, Policy},
        Stores,
    },
    policies::{BillingScheduler, ChargeHistory, PolicyService, TickReport},
    settlement::SettlementReconciler,
};

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub ledger: Arc<dyn LedgerClient>,
    pub policies: Arc<PolicyService>,
    pub claims: Arc<ClaimService>,
    pub deposits: Arc<DepositReconciler>,
    pub scheduler: Arc<BillingScheduler>,
    pub reconciler: Arc<SettlementReconciler>,
    pub storage: StorageBackend,
    pub call_timeout: Duration,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        storage: format!("{:?}", state.storage).to_lowercase(),
        timestamp: chrono::Utc::now(),
    })
}

// ========== POLICIES ==========

/// POST /policies
pub async fn create_policy(
    State(state): State<AppState>,
    Json(request): Json<CreatePolicyRequest>,
) -> AppResult<Json<Policy>> {
    request.validate()?;
    let policy = state.policies.create_policy(request.into_new_policy()?).await?;
    Ok(Json(policy))
}

/// GET /policies?owner_id=
pub async fn list_policies(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> AppResult<Json<Vec<Policy>>> {
    Ok(Json(state.policies.list_policies(query.owner_id).await?))
}

/// GET /policies/:id
pub async fn get_policy(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Policy>> {
    Ok(Json(state.policies.get_policy(id).await?))
}

/// POST /policies/:id/activate
///
/// Charges the first hour under `activate:<policy>:<hour>`; a retry inside the same hour
/// returns the already-active policy without a second charge.
pub async fn activate_policy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Policy>> {
    info!("Activating policy {}", id);
    Ok(Json(state.policies.activate_policy(id).await?))
}

/// POST /policies/:id/pause
pub async fn pause_policy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<PausePolicyRequest>>,
) -> AppResult<Json<Policy>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    let reason = request.reason.as_deref().unwrap_or("owner_request");
    Ok(Json(state.policies.pause_policy(id, reason).await?))
}

/// POST /policies/:id/fund
pub async fn fund_policy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<FundPolicyRequest>,
) -> AppResult<Json<Policy>> {
    request.validate()?;
    Ok(Json(state.policies.fund_policy(id, request.amount).await?))
}

/// GET /policies/:id/charges
pub async fn get_charge_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ChargeHistory>> {
    Ok(Json(state.policies.charge_history(id).await?))
}

/// GET /policies/:id/onchain
pub async fn get_onchain_policy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    Ok(Json(state.policies.onchain_policy(id).await?))
}

// ========== CLAIMS ==========

/// POST /claims
pub async fn submit_claim(
    State(state): State<AppState>,
    Json(request): Json<SubmitClaimRequest>,
) -> AppResult<Json<Claim>> {
    request.validate()?;
    Ok(Json(state.claims.submit_claim(request.into()).await?))
}

/// GET /claims?owner_id=
pub async fn list_claims(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> AppResult<Json<Vec<Claim>>> {
    Ok(Json(state.claims.list_claims(query.owner_id).await?))
}

/// POST /claims/:id/approve
pub async fn approve_claim(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ApproveClaimRequest>,
) -> AppResult<Json<Claim>> {
    request.validate()?;
    Ok(Json(state.claims.approve_claim(id, request.approved_amount).await?))
}

// ========== DEPOSITS ==========

/// POST /deposits
pub async fn initiate_deposit(
    State(state): State<AppState>,
    Json(request): Json<CreateDepositRequest>,
) -> AppResult<Json<DepositInitiated>> {
    request.validate()?;
    let started = state
        .deposits
        .initiate_deposit(request.owner_id, request.amount, request.asset_code)
        .await?;
    Ok(Json(started))
}

/// GET /deposits/:id
pub async fn get_deposit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DepositIntent>> {
    Ok(Json(state.deposits.get_deposit(id).await?))
}

/// POST /webhooks/anchor
pub async fn anchor_webhook(
    State(state): State<AppState>,
    Json(payload): Json<AnchorWebhook>,
) -> AppResult<Json<DepositIntent>> {
    Ok(Json(state.deposits.handle_webhook(payload).await?))
}

// ========== LEDGER & WALLETS ==========

/// GET /ledger?owner_id=
pub async fn list_ledger_events(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> AppResult<Json<Vec<LedgerEvent>>> {
    Ok(Json(state.stores.events.list_events_by_owner(query.owner_id).await?))
}

/// GET /wallets/:owner_id/balance
pub async fn get_wallet_balance(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
) -> AppResult<Json<WalletBalanceResponse>> {
    let address = state.stores.wallets.get_or_create_address(owner_id).await?;
    let balance = with_timeout(state.call_timeout, state.ledger.get_balance(&address))
        .await
        .map_err(|e| AppError::LedgerRead {
            owner_id,
            address: address.clone(),
            message: e.to_string(),
        })?;

    Ok(Json(WalletBalanceResponse {
        owner_id,
        address,
        balance,
    }))
}

// ========== ADMIN ==========

/// POST /admin/reconcile - run a deposit sweep and a settlement reconciliation now
pub async fn run_reconciliation(State(state): State<AppState>) -> AppResult<Json<ReconcileResponse>> {
    info!("🔧 Manual reconciliation requested");
    let deposits = state.deposits.sweep().await?;
    let settlement = state.reconciler.reconcile_pending().await?;
    Ok(Json(ReconcileResponse { deposits, settlement }))
}

/// POST /admin/billing/run - run one billing tick now
pub async fn run_billing(State(state): State<AppState>) -> AppResult<Json<TickReport>> {
    info!("🧾 Manual billing tick requested");
    Ok(Json(state.scheduler.tick().await?))
}
