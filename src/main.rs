mod amount;
mod api;
mod bootstrap;
mod claims;
mod clock;
mod config;
mod error;
mod execution;
mod funding;
mod ledger;
mod policies;
mod server;
mod settlement;
mod wallet;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting usage-based coverage billing engine");

    let config = config::Config::from_env().context("loading configuration")?;

    let state = bootstrap::initialize_app_state(&config)
        .await
        .context("initializing application state")?;

    let app = server::create_app(state);

    server::run_server(app, &config.bind_address)
        .await
        .with_context(|| format!("serving on {}", config.bind_address))?;

    Ok(())
}
