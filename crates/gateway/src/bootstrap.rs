//! AppState construction and background-task spawning extracted from
//! `main.rs`, so tests and alternative front-ends can boot the full
//! runtime without an HTTP listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use courier_channels::{AdapterRegistry, MemoryAdapter};
use courier_domain::config::{Config, ConfigSeverity};
use courier_sessions::SessionStore;

use crate::engine::{EchoEngine, EngineRegistry};
use crate::inbound::InboundRouter;
use crate::runtime::abort::AbortRegistry;
use crate::runtime::bus::RunBus;
use crate::runtime::delivery::ChannelsDelivery;
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::outbox::Outbox;
use crate::runtime::run_store::RunStore;
use crate::state::AppState;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Durable state ────────────────────────────────────────────────
    let sessions = Arc::new(
        SessionStore::new(&config.state.path).context("initializing session store")?,
    );
    let run_store = Arc::new(RunStore::new(&config.state.path));
    tracing::info!(path = %config.state.path.display(), "state stores ready");

    // ── Channels ─────────────────────────────────────────────────────
    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(Arc::new(MemoryAdapter::new("loopback")));
    tracing::info!(channels = adapters.len(), "channel adapters ready");

    // ── Outbox + delivery ────────────────────────────────────────────
    let outbox = Arc::new(Outbox::new(
        adapters.clone(),
        config.outbox.clone(),
        shutdown.clone(),
    ));
    let delivery = Arc::new(ChannelsDelivery::new(adapters.clone(), outbox.clone()));

    // ── Engines ──────────────────────────────────────────────────────
    let engines = Arc::new(EngineRegistry::new(&config.engines.default_engine));
    engines.register(Arc::new(EchoEngine::new()));
    tracing::info!(default_engine = %engines.default_id(), "engines ready");

    // ── Run supervision ──────────────────────────────────────────────
    let bus = Arc::new(RunBus::new());
    let aborts = Arc::new(AbortRegistry::new());
    let orchestrator = Orchestrator::new(
        config.clone(),
        sessions.clone(),
        run_store.clone(),
        bus.clone(),
        delivery.clone(),
        aborts.clone(),
        engines.clone(),
    );

    // ── Inbound routing ──────────────────────────────────────────────
    let router = Arc::new(InboundRouter::new(
        config.clone(),
        orchestrator.clone(),
        engines.clone(),
    ));

    // ── Periodic session flush ───────────────────────────────────────
    {
        let sessions = sessions.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.state.flush_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = sessions.flush() {
                            tracing::warn!(error = %err, "periodic session flush failed");
                        }
                    }
                }
            }
            let _ = sessions.flush();
        });
    }

    Ok(AppState {
        config,
        engines,
        sessions,
        run_store,
        bus,
        adapters,
        outbox,
        delivery,
        orchestrator,
        router,
        aborts,
        shutdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boots_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state.path = dir.path().to_path_buf();

        let state = build_app_state(Arc::new(config), CancellationToken::new())
            .await
            .unwrap();
        assert!(state.engines.contains("loopback"));
        assert!(state.adapters.get("loopback").is_some());
        assert_eq!(state.orchestrator.active_count(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let mut config = Config::default();
        config.server.port = 0;
        let result = build_app_state(Arc::new(config), CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
