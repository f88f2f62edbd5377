//! greenroom-daemon: the mock-interview backend gateway.
//!
//! Configuration comes from `GREENROOM_*` environment variables (see
//! `greenroom_core::config`); the flags below override the common ones for
//! local runs. The process runs in the foreground and exits cleanly on
//! SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use greenroom_core::ai::AiProxy;
use greenroom_core::codeeval::CodeEvaluator;
use greenroom_core::config::Config;
use greenroom_core::fanout::EventBus;
use greenroom_core::service::SessionService;
use greenroom_core::store::SessionStore;
use greenroom_core::token::TokenAuthority;
use greenroom_daemon::gateway::{self, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// greenroom daemon - mock interview backend
#[derive(Parser, Debug)]
#[command(name = "greenroom-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Listen address (overrides GREENROOM_BIND_ADDR)
    #[arg(long)]
    bind_addr: Option<String>,

    /// SQLite database path (overrides GREENROOM_DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Log filter (overrides RUST_LOG), e.g. "info,greenroom_core=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let store = Arc::new(
        SessionStore::open(&config.db_path).context("failed to open session store")?,
    );
    let bus = Arc::new(EventBus::new());
    let proxy = AiProxy::from_config(&config);
    let authority = Arc::new(TokenAuthority::new(config.auth_secret.clone()));
    let service = Arc::new(SessionService::new(
        store,
        bus,
        proxy,
        CodeEvaluator::detect(),
    ));

    let config = Arc::new(config);
    let state = AppState {
        service,
        authority,
        config: Arc::clone(&config),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, db = %config.db_path, "greenroom daemon listening");

    axum::serve(listener, gateway::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
