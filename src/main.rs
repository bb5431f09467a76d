use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use rewrite_proxy::logging::init_tracing;
use rewrite_proxy::session::spawn_sweeper;
use rewrite_proxy::{router, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);

    let state = AppState::new(&config).context("failed to build the upstream client")?;
    let sweeper = spawn_sweeper(state.sessions.clone(), config.sweep_interval());

    let port = config.resolve_port().context("failed to find a free port")?;
    let addr = format!("{}:{}", config.bind, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        max_redirects = config.max_redirects,
        session_ttl_secs = config.session_ttl,
        "rewrite proxy listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.abort();
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, finishing in-flight requests");
}
