//! Run admission and per-session arbitration.
//!
//! `submit` assigns a sortable run id, enforces the session's queue mode
//! against any active run (reject, steer, follow-up, or interrupt), and
//! spawns the run process. Terminated runs unregister themselves through
//! a completion channel; any resubmissions they queued (zero-answer
//! retries, unconsumed follow-ups) are admitted right after.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use courier_domain::config::Config;
use courier_domain::error::{Error, Result};
use courier_domain::request::{new_run_id, Job, QueueMode, RunRequest};
use courier_sessions::SessionStore;

use crate::engine::EngineRegistry;

use super::abort::AbortRegistry;
use super::bus::{RunBus, RunBusEvent};
use super::delivery::ChannelsDelivery;
use super::run_process::{spawn_run, RunDeps, RunHandle, RunTerminated};
use super::run_store::RunStore;

pub struct Orchestrator {
    deps: RunDeps,
    engines: Arc<EngineRegistry>,
    active: Mutex<HashMap<String, RunHandle>>,
    done_tx: mpsc::UnboundedSender<RunTerminated>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionStore>,
        run_store: Arc<RunStore>,
        bus: Arc<RunBus>,
        delivery: Arc<ChannelsDelivery>,
        aborts: Arc<AbortRegistry>,
        engines: Arc<EngineRegistry>,
    ) -> Arc<Self> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RunTerminated>();

        let orchestrator = Arc::new(Self {
            deps: RunDeps {
                config,
                sessions,
                run_store,
                bus,
                delivery,
                aborts,
            },
            engines,
            active: Mutex::new(HashMap::new()),
            done_tx,
        });

        // Unregister terminated runs, then admit whatever they left
        // behind (zero-answer retries, unconsumed follow-ups). The
        // removal is guarded by run id so an interrupt replacement is
        // never evicted by its predecessor's cleanup.
        {
            let weak = Arc::downgrade(&orchestrator);
            tokio::spawn(async move {
                while let Some(terminated) = done_rx.recv().await {
                    let Some(orchestrator) = weak.upgrade() else {
                        break;
                    };
                    {
                        let mut active = orchestrator.active.lock();
                        let matches = active
                            .get(&terminated.session_key)
                            .map(|h| h.run_id == terminated.run_id)
                            .unwrap_or(false);
                        if matches {
                            active.remove(&terminated.session_key);
                        }
                    }
                    for request in terminated.resubmissions {
                        match orchestrator.submit(request) {
                            Ok(run_id) => tracing::debug!(%run_id, "resubmission admitted"),
                            Err(err) => tracing::warn!(error = %err, "resubmission rejected"),
                        }
                    }
                }
            });
        }

        orchestrator
    }

    /// Submit a run request. Returns the admitted (or steered/followed-up)
    /// run id.
    pub fn submit(&self, request: RunRequest) -> Result<String> {
        let (run_id, _) = self.admit(request, false)?;
        Ok(run_id)
    }

    /// Submit and subscribe to the run's bus topic atomically, so the
    /// caller cannot miss `run_started`/`run_completed`.
    pub fn submit_subscribed(
        &self,
        request: RunRequest,
    ) -> Result<(String, broadcast::Receiver<RunBusEvent>)> {
        let (run_id, rx) = self.admit(request, true)?;
        Ok((run_id, rx.expect("subscription requested")))
    }

    fn admit(
        &self,
        request: RunRequest,
        subscribe: bool,
    ) -> Result<(String, Option<broadcast::Receiver<RunBusEvent>>)> {
        if request.session_key.is_empty() {
            return Err(Error::InvalidParams("session_key must not be empty".into()));
        }
        if request.prompt.trim().is_empty() {
            return Err(Error::InvalidParams("prompt must not be empty".into()));
        }
        let engine = self.engines.resolve(request.engine_id.as_deref())?;

        let mut active = self.active.lock();
        if let Some(existing) = active.get(&request.session_key) {
            match request.queue_mode {
                QueueMode::Collect => {
                    return Err(Error::Busy(format!(
                        "session {} already has run {}",
                        request.session_key, existing.run_id
                    )));
                }
                QueueMode::Steer => {
                    tracing::info!(run_id = %existing.run_id, "steering active run");
                    existing.steer(&request.prompt);
                    let rx = subscribe.then(|| self.deps.bus.subscribe(&existing.run_id));
                    return Ok((existing.run_id.clone(), rx));
                }
                QueueMode::Followup => {
                    tracing::info!(run_id = %existing.run_id, "queueing follow-up");
                    existing.follow_up(&request.prompt);
                    let rx = subscribe.then(|| self.deps.bus.subscribe(&existing.run_id));
                    return Ok((existing.run_id.clone(), rx));
                }
                QueueMode::Interrupt => {
                    tracing::info!(run_id = %existing.run_id, "interrupting active run");
                    existing.cancel("interrupted");
                    active.remove(&request.session_key);
                }
            }
        }

        let run_id = new_run_id();
        let rx = subscribe.then(|| self.deps.bus.subscribe(&run_id));
        let job = Job::admit(run_id.clone(), request);
        let handle = spawn_run(job, engine, self.deps.clone(), self.done_tx.clone());
        active.insert(handle.session_key.clone(), handle);
        Ok((run_id, rx))
    }

    /// Signal a run to stop. Asynchronous: completion arrives on the bus.
    pub fn cancel_by_run_id(&self, run_id: &str, reason: &str) -> Result<()> {
        let active = self.active.lock();
        let handle = active
            .values()
            .find(|h| h.run_id == run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        handle.cancel(reason);
        Ok(())
    }

    /// Cancel whatever run a session currently owns.
    pub fn cancel_by_session(&self, session_key: &str, reason: &str) -> Result<String> {
        let active = self.active.lock();
        let handle = active
            .get(session_key)
            .ok_or_else(|| Error::NotFound(format!("no active run for {session_key}")))?;
        handle.cancel(reason);
        Ok(handle.run_id.clone())
    }

    pub fn find_active_by_session(&self, session_key: &str) -> Option<String> {
        self.active.lock().get(session_key).map(|h| h.run_id.clone())
    }

    pub fn handle_for_run(&self, run_id: &str) -> Option<RunHandle> {
        self.active
            .lock()
            .values()
            .find(|h| h.run_id == run_id)
            .cloned()
    }

    /// Route a keepalive-prompt answer to its run.
    pub fn keepalive(&self, run_id: &str, keep: bool) -> Result<()> {
        self.handle_for_run(run_id)
            .map(|h| h.keepalive(keep))
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Cancel every active run (process shutdown).
    pub fn shutdown(&self) {
        for handle in self.active.lock().values() {
            handle.cancel("shutdown");
        }
    }

    pub fn bus(&self) -> &RunBus {
        &self.deps.bus
    }
}
