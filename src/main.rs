// src/main.rs
// Wire everything together: config, storage, processor client, notifier,
// transfer worker, HTTP server.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zarlink::api;
use zarlink::chat::ChatRelay;
use zarlink::config::{self, RelayConfig};
use zarlink::notify::{ChannelNotifier, Notifier};
use zarlink::processor::{Processor, ProcessorClient};
use zarlink::store::{create_store, StoreMode};
use zarlink::transfer::{Orchestrator, TransferWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let validation = config::validate_config();
    validation.print_summary();
    if !validation.valid {
        anyhow::bail!("configuration invalid, refusing to start");
    }

    let config = RelayConfig::from_env();

    let store = create_store(StoreMode::from_env())
        .await
        .context("storage init")?;
    info!("Storage initialized. Ready for new user registrations.");

    let processor: Arc<dyn Processor> = Arc::new(ProcessorClient::new(
        &config.processor_base_url,
        &config.processor_api_key,
    ));
    let notifier: Arc<dyn Notifier> = Arc::new(ChannelNotifier::new(
        config.telegram_bot_token.clone(),
        config.twilio.clone(),
    ));

    let orchestrator = Orchestrator::new(
        store.clone(),
        processor.clone(),
        notifier.clone(),
        config.community_fund_handle.clone(),
    );
    let worker = Arc::new(TransferWorker::spawn(orchestrator));

    let relay = Arc::new(ChatRelay::new(
        store.clone(),
        processor.clone(),
        notifier.clone(),
        worker,
        config.stablecoin_name.clone(),
        config.coupon_reward,
    ));

    let app = api::router(relay, store, processor, config.clone());

    info!("🚀 ZarLink relay listening on {}", config.api_addr);
    axum::Server::bind(&config.api_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
