use std::sync::Arc;

use rust_decimal::Decimal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pebble_backend::config::AppConfig;
use pebble_backend::ledger::dev::DevLedger;
use pebble_backend::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pebble_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();

    tracing::info!("Starting Pebble trading core v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);
    tracing::info!(
        "Canton endpoint: {}:{} (tls={})",
        config.canton_host,
        config.canton_json_port,
        config.canton_use_tls
    );

    // The Canton JSON-API client is injected by the deployment harness;
    // standalone runs use the in-process dev ledger.
    tracing::warn!("No external ledger client wired, using in-process dev ledger");
    let ledger = Arc::new(DevLedger::new());

    let bootstrap = config.bootstrap_test_parties;
    let mut context = AppContext::init(config, ledger).await?;
    context.run().await?;
    tracing::info!("Trading core running");

    if bootstrap {
        for user in ["alice", "bob"] {
            match context.accounts.open_account(user).await {
                Ok(_) => {
                    if let Err(e) = context.accounts.faucet(user, Decimal::from(1000)).await {
                        tracing::warn!("bootstrap faucet for {user} failed: {e}");
                    }
                }
                Err(e) => tracing::warn!("bootstrap account for {user} failed: {e}"),
            }
        }
        tracing::info!("Test parties bootstrapped");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received");
    context.shutdown().await;

    Ok(())
}
