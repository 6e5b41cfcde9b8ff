//! Shared application state passed to all API handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use courier_channels::AdapterRegistry;
use courier_domain::config::Config;
use courier_sessions::SessionStore;

use crate::engine::EngineRegistry;
use crate::inbound::InboundRouter;
use crate::runtime::abort::AbortRegistry;
use crate::runtime::bus::RunBus;
use crate::runtime::delivery::ChannelsDelivery;
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::outbox::Outbox;
use crate::runtime::run_store::RunStore;

/// Fields are grouped by concern:
/// - **Core** — config, engines
/// - **Sessions & runs** — durable session state, run records, run bus
/// - **Delivery** — channel adapters, per-peer outbox, delivery façade
/// - **Runtime** — orchestrator, inbound router, abort table, shutdown
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub engines: Arc<EngineRegistry>,

    // ── Sessions & runs ───────────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub run_store: Arc<RunStore>,
    pub bus: Arc<RunBus>,

    // ── Delivery ──────────────────────────────────────────────────────
    pub adapters: Arc<AdapterRegistry>,
    pub outbox: Arc<Outbox>,
    pub delivery: Arc<ChannelsDelivery>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub orchestrator: Arc<Orchestrator>,
    pub router: Arc<InboundRouter>,
    pub aborts: Arc<AbortRegistry>,
    pub shutdown: CancellationToken,
}
