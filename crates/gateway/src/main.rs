use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_domain::config::Config;
use courier_gateway::api;
use courier_gateway::bootstrap::build_app_state;

#[derive(Parser, Debug)]
#[command(name = "courier", about = "Multi-channel AI-agent gateway")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Override the state directory from the config file.
    #[arg(long)]
    state_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("courier=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();

    // ── Config ─────────────────────────────────────────────────────
    let mut config: Config = match std::fs::read_to_string(&cli.config) {
        Ok(raw) => toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", cli.config))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %cli.config, "no config file, using defaults");
            Config::default()
        }
        Err(err) => return Err(err).context(format!("reading config file {}", cli.config)),
    };
    if let Some(state_dir) = cli.state_dir {
        config.state.path = state_dir;
    }
    let config = Arc::new(config);

    // ── Boot ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let state = build_app_state(config.clone(), shutdown.clone()).await?;

    let app = api::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "courier gateway listening");

    // ── Serve until ctrl-c ─────────────────────────────────────────
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("serving HTTP")?;

    // ── Drain ──────────────────────────────────────────────────────
    state.orchestrator.shutdown();
    shutdown.cancel();
    if let Err(err) = state.sessions.flush() {
        tracing::warn!(error = %err, "final session flush failed");
    }
    tracing::info!("courier gateway stopped");
    Ok(())
}
