// ABOUTME: CLI entry point for sync-worker
// ABOUTME: Resolves config and credentials, connects the stores and runs the SyncDaemon

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use sync_worker::config::{
    Credentials, FileConfig, Overrides, Settings, DEFAULT_CONFIG_PATH, ENV_SOURCE_KEY,
    ENV_SOURCE_URL, ENV_TARGET_KEY, ENV_TARGET_URL,
};
use sync_worker::postgres::init_tls_policy;
use sync_worker::registry::TableRegistry;
use sync_worker::sync::{CursorStore, PgSource, PgTarget, SyncDaemon, WorkerContext};

#[derive(Parser)]
#[command(name = "sync-worker")]
#[command(
    about = "Keep target tables in sync with a source: realtime change events plus periodic reconciliation",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Run a single reconciliation cycle and exit
    #[arg(long = "reconcile-only")]
    reconcile_only: bool,
    /// Alias for --reconcile-only, for scheduled invocations
    #[arg(long)]
    cron: bool,
    /// Alias for --reconcile-only
    #[arg(long)]
    once: bool,
    /// Force realtime plus the reconciliation loop, ignoring SYNC_MODE/SYNC_REALTIME/SYNC_LOOP
    #[arg(long = "default")]
    force_default: bool,
    /// Disable realtime subscriptions
    #[arg(long = "no-realtime")]
    no_realtime: bool,
    /// Path to the table configuration file
    #[arg(long = "config", env = "SYNC_TABLE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Path to the cursor state file
    #[arg(long = "state-path", env = "SYNC_STATE_PATH")]
    state_path: Option<PathBuf>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(long = "allow-self-signed-certs", default_value_t = false)]
    allow_self_signed_certs: bool,

    /// default, reconcile, cron or once
    #[arg(long, env = "SYNC_MODE", hide = true)]
    mode: Option<String>,
    #[arg(long, env = "SYNC_REALTIME", hide = true)]
    realtime: Option<String>,
    #[arg(long = "loop", env = "SYNC_LOOP", hide = true)]
    loop_enabled: Option<String>,
    #[arg(long, env = "SYNC_RECONCILE_INTERVAL_MS")]
    interval_ms: Option<u64>,
    #[arg(long, env = "SYNC_RECONCILE_LOOKBACK_MS")]
    lookback_ms: Option<u64>,
    #[arg(long, env = "SYNC_RECONCILE_BATCH_SIZE")]
    batch_size: Option<usize>,
    #[arg(long, env = "SYNC_INITIAL_BACKFILL_MS")]
    initial_backfill_ms: Option<u64>,

    #[arg(long, env = ENV_SOURCE_URL, hide = true)]
    source_url: Option<String>,
    #[arg(long, env = ENV_SOURCE_KEY, hide = true, hide_env_values = true)]
    source_key: Option<String>,
    #[arg(long, env = ENV_TARGET_URL, hide = true)]
    target_url: Option<String>,
    #[arg(long, env = ENV_TARGET_KEY, hide = true, hide_env_values = true)]
    target_key: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            force_default: self.force_default,
            once: self.once || self.cron || self.reconcile_only,
            no_realtime: self.no_realtime,
            mode: self.mode.clone(),
            realtime: self.realtime.clone(),
            loop_enabled: self.loop_enabled.clone(),
            interval_ms: self.interval_ms,
            lookback_ms: self.lookback_ms,
            batch_size: self.batch_size,
            initial_backfill_ms: self.initial_backfill_ms,
            state_path: self.state_path.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    init_tls_policy(cli.allow_self_signed_certs);

    let credentials = Credentials::from_values(
        cli.source_url.clone(),
        cli.source_key.clone(),
        cli.target_url.clone(),
        cli.target_key.clone(),
    )?;
    let file = FileConfig::load(&cli.config)?;
    let settings = Settings::resolve(&file, &cli.overrides())?;
    let specs = TableRegistry::from_config(file.tables, &file.defaults)?;
    if specs.is_empty() {
        tracing::warn!("No tables configured in {:?}", cli.config);
    }

    tracing::info!(
        "Source: {}, target: {}",
        credentials.source.display_url(),
        credentials.target.display_url()
    );

    let source = PgSource::connect(
        credentials.source,
        settings.deletion_log.clone(),
        settings.realtime.subscribe_timeout,
        &settings.retry,
    )
    .await?;
    let target = PgTarget::connect(&credentials.target, &settings.retry).await?;

    let registry = TableRegistry::resolve(specs, &source).await;
    let cursors = CursorStore::load_or_empty(&settings.state_path).await;

    let ctx = Arc::new(WorkerContext::new(
        Arc::new(source),
        Arc::new(target),
        registry,
        cursors,
        settings,
    ));
    let daemon = SyncDaemon::new(ctx);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    let summary = daemon
        .run(&shutdown_tx)
        .await
        .context("Sync worker stopped with an error")?;

    tracing::info!(
        "Sync worker finished: {} cycles, {} realtime events applied, {} dropped",
        summary.cycles,
        summary.events.applied,
        summary.events.failed
    );
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
