//! # ragsyncd
//!
//! Ragsync daemon: runs the sync scheduler and serves the control API.
//!
//! ## Configuration
//!
//! - `RAGSYNC_HOST` - Bind host (default: "127.0.0.1")
//! - `RAGSYNC_PORT` - Bind port (default: "7878")
//! - `RAGSYNC_DATA_DIR` - State, token and log directory
//! - `RAGSYNC_INGEST_URL` - Downstream indexing service
//!
//! A `.env` file in the working directory is read first.

use clap::Parser;
use ragsync_core::{MemoryLedger, RagSync, SyncConfig};
use ragsync_web::{router, AppState, LOG_FILE_PREFIX};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ragsyncd")]
#[command(author, version, about = "Ragsync daemon", long_about = None)]
struct Args {
    /// Bind port (overrides RAGSYNC_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Keep state in memory and ingest into an in-process ledger
    #[arg(long)]
    dry_run: bool,

    /// Do not start the timer; runs happen only on trigger
    #[arg(long)]
    no_schedule: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }

    // Console plus a daily-rotated file the control API can tail
    std::fs::create_dir_all(config.log_dir())?;
    let file_appender = tracing_appender::rolling::daily(config.log_dir(), LOG_FILE_PREFIX);
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ragsync_web=info,ragsync_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!(
        "Initializing Ragsync with data directory: {:?}",
        config.data_dir
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let mut builder = RagSync::builder(config);
    if args.dry_run {
        info!("Dry run: state in memory, nothing sent to the indexing service");
        builder = builder
            .in_memory_state()
            .ledger(Arc::new(MemoryLedger::new()));
    }
    let sync = Arc::new(builder.build().await?);

    if args.no_schedule {
        info!("Timer disabled; waiting for manual triggers");
    } else {
        sync.start();
    }

    let app = router(AppState::new(sync.clone()));

    info!("Starting Ragsync control API on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // An in-flight run keeps going until its own deadline
    sync.shutdown().await;
    info!("Ragsync daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}
