//! reservio server
//!
//! Serves the REST API over one Sled store.
//!
//! Usage:
//!   cargo run --bin seed          # admin account + upcoming slots
//!   cargo run --bin reservio      # start server (PORT, default 8080)

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use reservio::config::Config;
use reservio::mailer::{LogMailer, Mailer, SmtpMailer};
use reservio::rest::{create_router, AppState};
use reservio::storage::Storage;
use reservio::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "reservio")]
#[command(about = "Childcare slot reservation server", long_about = None)]
struct Args {
    /// Listen port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Sled data directory (overrides DATA_DIR)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Listen address (overrides BIND_ADDR)
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    // a missing .env is fine
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if config.test_mode {
        tracing::warn!("TEST_MODE is on: built-in session secret allowed");
    }

    let storage = Storage::open(&config.data_dir)?;
    tracing::info!(data_dir = %config.data_dir.display(), "store opened");

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => {
            tracing::info!(host = %smtp.host, port = smtp.port, "SMTP delivery enabled");
            Arc::new(SmtpMailer::new(smtp)?)
        }
        None => {
            tracing::warn!("SMTP_HOST not set, reset mails are only logged");
            Arc::new(LogMailer)
        }
    };

    let addr = config.listen_addr();
    let state = Arc::new(AppState::new(storage.clone(), config, mailer));
    let app = create_router(state.clone());

    // idle throttle buckets would otherwise accumulate per client address
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let tracked = state.request_limiter.purge_idle();
            tracing::debug!(tracked, "throttle buckets purged");
        }
    });

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, version = env!("CARGO_PKG_VERSION"), "reservio listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    storage.flush().await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
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
    tracing::info!("shutting down...");
}
