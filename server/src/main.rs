//! # MatchMates Server
//!
//! Accounts, friends, chat and rank-based partner search over a JSON API,
//! with a WebSocket channel for presence and live messages.

use anyhow::{Context, Result};
use clap::Parser;
use matchmates_server::config::Args;
use matchmates_server::router::ENDPOINTS;
use matchmates_server::{build_router, AppState, SharedState};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting MatchMates Server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Bind address: {}", args.bind_addr());
    info!("Match policy: {}", args.match_policy);

    info!("Initializing database: {}", args.database);
    let app_state = AppState::new(&args.database)
        .await?
        .with_match_policy(args.match_policy)
        .with_token_ttl(args.token_ttl());

    if args.seed_demo_user {
        app_state.seed_demo_user().await?;
    }
    if args.database == ":memory:" {
        warn!("Using an in-memory database, all data is lost on exit");
    }

    let state: SharedState = Arc::new(app_state);
    let app = build_router(state.clone());

    for (method, path, description) in ENDPOINTS {
        info!("  {:<8} {:<36} {}", method, path, description);
    }

    let listener = tokio::net::TcpListener::bind(args.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", args.bind_addr()))?;

    info!("Server successfully bound to {}", args.bind_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down server...");
    state.db.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
