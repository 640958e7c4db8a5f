use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    activate_policy, anchor_webhook, approve_claim, create_policy, fund_policy, get_charge_history,
    get_deposit, get_onchain_policy, get_policy, get_wallet_balance, health_check, initiate_deposit,
    list_claims, list_ledger_events, list_policies, pause_policy, run_billing, run_reconciliation,
    submit_claim, AppState,
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Policy lifecycle
                .route("/policies", post(create_policy).get(list_policies))
                .route("/policies/:id", get(get_policy))
                .route("/policies/:id/activate", post(activate_policy))
                .route("/policies/:id/pause", post(pause_policy))
                .route("/policies/:id/fund", post(fund_policy))
                .route("/policies/:id/charges", get(get_charge_history))
                .route("/policies/:id/onchain", get(get_onchain_policy))
                // Claims
                .route("/claims", post(submit_claim).get(list_claims))
                .route("/claims/:id/approve", post(approve_claim))
                // Deposits
                .route("/deposits", post(initiate_deposit))
                .route("/deposits/:id", get(get_deposit))
                .route("/webhooks/anchor", post(anchor_webhook))
                // Ledger reads
                .route("/ledger", get(list_ledger_events))
                .route("/wallets/:owner_id/balance", get(get_wallet_balance))
                // Admin
                .route("/admin/reconcile", post(run_reconciliation))
                .route("/admin/billing/run", post(run_billing)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await
}
