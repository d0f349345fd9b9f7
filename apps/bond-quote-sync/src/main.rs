//! Bond Quote Sync Binary
//!
//! Runs the quote engine headless against a JSON workbook snapshot.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin bond-quote-sync
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DEEPMM_EMAIL`: Market-data account email
//! - `DEEPMM_PASSWORD`: Market-data account password
//! - `QUOTE_SYNC_WORKBOOK`: Workbook snapshot to load
//!
//! ## Optional
//! - `QUOTE_SYNC_WORKBOOK_OUT`: Where to write the workbook on shutdown
//! - `QUOTE_SYNC_CONFIG_PATH`: Worksheet configuration file (default: quote-sync-config.json)
//! - `QUOTE_SYNC_FIGI_DIRECTORY`: `[{F,C,I}]` bond reference file for CUSIP/ISIN rows
//! - `QUOTE_SYNC_STREAM_URL`: Stream endpoint (default: wss://staging1.deepmm.com)
//! - `QUOTE_SYNC_METRICS_PORT`: Prometheus metrics port (default: 0 = disabled)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `RUST_LOG`: Log filter (default: bond_quote_sync=info)

use std::sync::Arc;

use anyhow::Context;
use bond_quote_sync::application::ports::{FigiOnlyResolver, IdentifierResolver};
use bond_quote_sync::infrastructure::telemetry;
use bond_quote_sync::{
    DeepMmStreamConnector, FigiDirectory, InMemoryWorkbook, JsonFileConfigStore, QuoteSyncEngine,
    SyncConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    // Initialize telemetry (tracing + optional OTLP)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Bond Quote Sync");

    let config = SyncConfig::from_env()?;
    log_config(&config);

    let _metrics_handle = init_metrics(config.metrics_port).context("metrics recorder")?;

    let workbook = InMemoryWorkbook::load(&config.storage.workbook_path)
        .with_context(|| format!("loading {}", config.storage.workbook_path.display()))?;

    let resolver: Arc<dyn IdentifierResolver> = match &config.storage.figi_directory {
        Some(path) => Arc::new(
            FigiDirectory::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
        ),
        None => Arc::new(FigiOnlyResolver),
    };

    let mut engine = QuoteSyncEngine::new(
        Box::new(workbook.clone()),
        Box::new(JsonFileConfigStore::new(&config.storage.config_path)),
        resolver,
        Arc::new(DeepMmStreamConnector::new(config.stream.client_config())),
        config.engine.engine_config(),
    );

    let sheets = engine.load_configuration()?;
    if sheets == 0 {
        tracing::warn!(
            path = %config.storage.config_path.display(),
            "No worksheets configured; nothing will be subscribed"
        );
    }

    let session = engine.login(config.credentials.clone())?;
    tracing::info!(session, sheets, "Engine running");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        await_shutdown(signal_token).await;
    });

    engine.run(shutdown_token).await;
    engine.logout();

    if let Some(out) = &config.storage.workbook_out {
        workbook
            .save(out)
            .with_context(|| format!("writing {}", out.display()))?;
    }

    tracing::info!("Bond Quote Sync stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    tracing::info!(
        stream_url = %config.stream.url,
        workbook = %config.storage.workbook_path.display(),
        config_path = %config.storage.config_path.display(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_interval_secs = config.stream.heartbeat_interval.as_secs(),
        reconnect_max_secs = config.stream.reconnect_delay_max.as_secs(),
        edit_debounce_ms = u64::try_from(config.engine.edit_debounce.as_millis()).unwrap_or(u64::MAX),
        "Engine tuning"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
