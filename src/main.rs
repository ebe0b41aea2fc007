use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chaingate::backend::BackendRegistry;
use chaingate::config::{BackendKind, Config};
use chaingate::console::AdminConsole;
use chaingate::engine::AlertEngine;
use chaingate::logbuf::{BufferLayer, LogBuffer};
use chaingate::market::MarketDataFetcher;
use chaingate::notify::ChannelNotifier;
use chaingate::state::{StateStore, StoreOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // ========================================================================
    // Step 1: Initialize tracing with EnvFilter plus the console log buffer
    // ========================================================================
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("Failed to create EnvFilter");

    let log_buffer = LogBuffer::new(500);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(BufferLayer::new(log_buffer.clone()))
        .init();

    info!("🚀 Starting chaingate...");

    // ========================================================================
    // Step 2: Load configuration
    // ========================================================================
    let config = Config::load().context("Failed to load configuration")?;
    info!("✅ Configuration loaded");
    debug!(
        backends = config.backends.len(),
        primary_evm = %config.primary_evm,
        poll_interval_secs = config.poller.interval.as_secs(),
        "Backend configuration"
    );

    // ========================================================================
    // Step 3: Open the state store (runs the one-time legacy import)
    // ========================================================================
    let store = StateStore::open(StoreOptions {
        path: config.store_path.clone(),
        legacy_path: Some(config.legacy_state_path.clone()),
        default_thresholds: config.default_thresholds,
        default_settings: config.default_settings,
    })
    .await
    .context("Failed to open state store")?;
    let store = Arc::new(store);
    info!(
        pairs = store.pair_count().await,
        path = %config.store_path.display(),
        "✅ State store ready"
    );

    // ========================================================================
    // Step 4: Build the backend registry and start stdio subprocesses
    // ========================================================================
    let registry = Arc::new(BackendRegistry::from_config(&config));
    registry.start_all().await;
    info!(backends = ?registry.keys(), "✅ Backend registry ready");

    let evm = registry
        .primary(BackendKind::Evm)
        .context("Primary EVM backend missing from registry")?;
    let dex = registry.primary(BackendKind::DexData).ok();
    let fetcher = MarketDataFetcher::new(evm, dex);

    // ========================================================================
    // Step 5: Wire the poller, notification drain, and admin console
    // ========================================================================
    let cancel = CancellationToken::new();

    let (notifier, mut notifications) = ChannelNotifier::new();
    // The chat transport is out of scope here; deliveries are logged so an
    // operator can watch them via the console's `log` command.
    let drain = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            info!(chat_id = notification.chat_id, "📤 {}", notification.text);
        }
    });

    let engine = AlertEngine::new(
        store.clone(),
        fetcher,
        notifier,
        config.poller.interval,
    );
    let engine_cancel = cancel.clone();
    let engine_task = tokio::spawn(async move { engine.run(engine_cancel).await });

    let console = AdminConsole::new(store.clone(), log_buffer, cancel.clone());
    let console_task = tokio::spawn(async move { console.run().await });

    info!("✅ chaingate is up; type 'help' for admin commands");

    // ========================================================================
    // Step 6: Wait for ctrl-c or console quit, then shut down in order
    // ========================================================================
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received ctrl-c, shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    if let Err(e) = engine_task.await {
        warn!("Poller task ended abnormally: {e}");
    }
    console_task.abort();
    drain.abort();

    registry.shutdown_all().await;
    info!("👋 Shutdown complete");
    Ok(())
}
