//! Per-run supervision.
//!
//! One actor owns each admitted run end-to-end: it consumes the engine's
//! event stream, translates raw events into the normalized client surface,
//! accumulates streamed text, tracks tool actions, enforces the idle
//! watchdog, reacts to context overflow, performs the zero-answer retry,
//! persists the resume checkpoint, and delivers the final answer to the
//! originating channel.
//!
//! Exactly one normalized `completed` is emitted per run, `started` always
//! precedes it, and the `run_completed` bus event is published only after
//! the final normalized event reached subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use courier_domain::config::Config;
use courier_domain::error::{Error, Result};
use courier_domain::event::{
    extract_last_assistant_text, flatten_blocks, sum_usage, ActionKind, ActionPhase, AgentEvent,
    ResumeToken, RunEvent, Usage,
};
use courier_domain::payload::{OutboundPayload, PeerRef};
use courier_domain::request::{Job, RunRequest};
use courier_sessions::{parse, ParsedSessionKey, PendingCompaction, SessionStore};

use crate::engine::{Engine, EngineContext};

use super::abort::{AbortRegistry, SignalHandle};
use super::bus::{RunBus, RunBusEvent};
use super::compact::{check_near_limit, is_context_overflow};
use super::delivery::ChannelsDelivery;
use super::event_stream::{event_stream, StreamOwner};
use super::retry::{build_retry_request, should_retry};
use super::run_store::{RunStatus, RunStore};
use super::{now_ms, truncate_str};

const EVENTS_CAPACITY: usize = 256;
const RESULT_DISPLAY_LIMIT: usize = 500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared dependencies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Services a run process needs; cheap to clone per run.
#[derive(Clone)]
pub struct RunDeps {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub run_store: Arc<RunStore>,
    pub bus: Arc<RunBus>,
    pub delivery: Arc<ChannelsDelivery>,
    pub aborts: Arc<AbortRegistry>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands and handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub enum RunCommand {
    Cancel { reason: String },
    Steer { text: String },
    FollowUp { text: String },
    Keepalive { keep: bool },
    GetState { reply: oneshot::Sender<RunSnapshot> },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub session_key: String,
    pub started_emitted: bool,
    pub completed_emitted: bool,
    pub delta_seq: u64,
    pub accumulated_chars: usize,
    pub pending_actions: usize,
    pub awaiting_confirmation: bool,
    pub retry_attempt: u32,
}

/// Sent to the orchestrator when the actor terminates. Resubmissions
/// (zero-answer retries, unconsumed follow-ups) ride along so the session
/// is unregistered strictly before they are admitted.
#[derive(Debug)]
pub struct RunTerminated {
    pub session_key: String,
    pub run_id: String,
    pub resubmissions: Vec<RunRequest>,
}

/// Cloneable handle to one live run process.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub session_key: String,
    cmd_tx: mpsc::UnboundedSender<RunCommand>,
    events_tx: broadcast::Sender<RunEvent>,
}

impl RunHandle {
    pub fn cancel(&self, reason: &str) {
        let _ = self.cmd_tx.send(RunCommand::Cancel {
            reason: reason.to_owned(),
        });
    }

    pub fn steer(&self, text: &str) {
        let _ = self.cmd_tx.send(RunCommand::Steer {
            text: text.to_owned(),
        });
    }

    pub fn follow_up(&self, text: &str) {
        let _ = self.cmd_tx.send(RunCommand::FollowUp {
            text: text.to_owned(),
        });
    }

    pub fn keepalive(&self, keep: bool) {
        let _ = self.cmd_tx.send(RunCommand::Keepalive { keep });
    }

    /// Normalized event feed for this run.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events_tx.subscribe()
    }

    pub async fn state(&self) -> Result<RunSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RunCommand::GetState { reply })
            .map_err(|_| Error::NotFound(format!("run {}", self.run_id)))?;
        rx.await
            .map_err(|_| Error::NotFound(format!("run {}", self.run_id)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn the run process for an admitted job. Returns immediately with
/// the command handle; the actor drives the run to exactly one completion.
pub fn spawn_run(
    job: Job,
    engine: Arc<dyn Engine>,
    deps: RunDeps,
    done_tx: mpsc::UnboundedSender<RunTerminated>,
) -> RunHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);
    let handle = RunHandle {
        run_id: job.run_id.clone(),
        session_key: job.request.session_key.clone(),
        cmd_tx,
        events_tx: events_tx.clone(),
    };

    let run_span = tracing::info_span!(
        "run",
        run_id = %job.run_id,
        session_key = %job.request.session_key,
    );
    tokio::spawn(tracing::Instrument::instrument(
        async move {
            let run_id = job.run_id.clone();
            let session_key = job.request.session_key.clone();
            let mut actor = RunActor::new(job, engine, deps, events_tx, cmd_rx);
            actor.run().await;
            let _ = done_tx.send(RunTerminated {
                session_key,
                run_id,
                resubmissions: std::mem::take(&mut actor.resubmissions),
            });
        },
        run_span,
    ));
    handle
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingAction {
    kind: ActionKind,
    title: String,
    detail: Value,
}

struct StagedCompletion {
    answer: String,
    usage: Option<Usage>,
}

struct CompletionInfo {
    ok: bool,
    answer: String,
    error: Option<String>,
    resume: Option<ResumeToken>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    Watchdog,
    Confirm,
    CancelGrace,
    FollowupGrace,
}

enum Wake {
    Event(Option<AgentEvent>),
    Command(Option<RunCommand>),
    Deadline(DeadlineKind),
}

struct RunActor {
    job: Job,
    engine: Arc<dyn Engine>,
    deps: RunDeps,
    events_tx: broadcast::Sender<RunEvent>,
    cmd_rx: mpsc::UnboundedReceiver<RunCommand>,
    cmd_closed: bool,

    owner: Option<StreamOwner>,
    signal: Option<SignalHandle>,
    /// Peer routing when the session is a channel conversation.
    channel_route: Option<(String, String, PeerRef)>,

    resume_at_start: Option<ResumeToken>,
    started_emitted: bool,
    completed_emitted: bool,
    delta_seq: u64,
    accumulated: String,
    pending_actions: HashMap<String, PendingAction>,
    staged: Option<StagedCompletion>,
    followups: VecDeque<String>,
    resubmissions: Vec<RunRequest>,
    cancel_reason: Option<String>,
    awaiting_confirmation: bool,

    watchdog_deadline: Option<Instant>,
    confirm_deadline: Option<Instant>,
    cancel_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,

    done: bool,
}

impl RunActor {
    fn new(
        job: Job,
        engine: Arc<dyn Engine>,
        deps: RunDeps,
        events_tx: broadcast::Sender<RunEvent>,
        cmd_rx: mpsc::UnboundedReceiver<RunCommand>,
    ) -> Self {
        let channel_route = match parse(&job.request.session_key) {
            ParsedSessionKey::ChannelPeer {
                channel_id,
                account_id,
                peer_kind,
                peer_id,
                thread_id,
            } => Some((
                channel_id,
                account_id,
                PeerRef {
                    kind: peer_kind,
                    id: peer_id,
                    thread_id,
                },
            )),
            _ => None,
        };

        Self {
            job,
            engine,
            deps,
            events_tx,
            cmd_rx,
            cmd_closed: false,
            owner: None,
            signal: None,
            channel_route,
            resume_at_start: None,
            started_emitted: false,
            completed_emitted: false,
            delta_seq: 0,
            accumulated: String::new(),
            pending_actions: HashMap::new(),
            staged: None,
            followups: VecDeque::new(),
            resubmissions: Vec::new(),
            cancel_reason: None,
            awaiting_confirmation: false,
            watchdog_deadline: None,
            confirm_deadline: None,
            cancel_deadline: None,
            grace_deadline: None,
            done: false,
        }
    }

    async fn run(&mut self) {
        self.resume_at_start = self.deps.sessions.resume_token(&self.job.request.session_key);
        self.deps
            .run_store
            .insert(super::run_store::RunRecord::from_job(&self.job));
        self.deps.run_store.update(&self.job.run_id, |r| {
            r.status = RunStatus::Running;
        });
        self.deps.bus.publish(RunBusEvent::RunStarted {
            run_id: self.job.run_id.clone(),
            session_key: self.job.request.session_key.clone(),
            job: self.job.clone(),
        });

        let (stream, owner) = event_stream(&self.deps.config.stream);
        self.owner = Some(owner);
        let signal = self.deps.aborts.create();
        self.signal = Some(signal);

        let started = self
            .engine
            .start(EngineContext {
                job: self.job.clone(),
                stream,
                resume: self.resume_at_start.clone(),
                signal,
                aborts: self.deps.aborts.clone(),
            })
            .await;
        if let Err(err) = started {
            tracing::warn!(error = %err, "engine failed to start");
            self.finalize(CompletionInfo {
                ok: false,
                answer: String::new(),
                error: Some(format!("assistant_error: engine start failed: {err}")),
                resume: None,
                usage: None,
            })
            .await;
        }

        while !self.done {
            let deadline = self.next_deadline();
            let cmd_open = !self.cmd_closed;

            let wake = {
                let owner = self.owner.as_mut().expect("stream owner present");
                let cmd_rx = &mut self.cmd_rx;
                tokio::select! {
                    biased;
                    event = owner.next() => Wake::Event(event),
                    cmd = cmd_rx.recv(), if cmd_open => Wake::Command(cmd),
                    _ = sleep_until_opt(deadline.map(|(_, at)| at)), if deadline.is_some() => {
                        Wake::Deadline(deadline.map(|(kind, _)| kind).expect("deadline kind"))
                    }
                }
            };

            match wake {
                Wake::Event(Some(event)) => self.handle_event(event).await,
                Wake::Event(None) => self.handle_stream_end().await,
                Wake::Command(Some(cmd)) => self.handle_command(cmd).await,
                Wake::Command(None) => self.cmd_closed = true,
                Wake::Deadline(kind) => self.handle_deadline(kind).await,
            }
        }

        if let Some(signal) = self.signal {
            self.deps.aborts.clear(signal);
        }
        self.deps.bus.cleanup(&self.job.run_id);
    }

    fn next_deadline(&self) -> Option<(DeadlineKind, Instant)> {
        [
            (DeadlineKind::Watchdog, self.watchdog_deadline),
            (DeadlineKind::Confirm, self.confirm_deadline),
            (DeadlineKind::CancelGrace, self.cancel_deadline),
            (DeadlineKind::FollowupGrace, self.grace_deadline),
        ]
        .into_iter()
        .filter_map(|(kind, at)| at.map(|at| (kind, at)))
        .min_by_key(|(_, at)| *at)
    }

    // ── Event translation ────────────────────────────────────────────

    async fn handle_event(&mut self, event: AgentEvent) {
        self.touch_watchdog();

        match event {
            AgentEvent::AgentStart => {
                self.emit_started();
            }
            AgentEvent::TurnStart
            | AgentEvent::MessageStart { .. }
            | AgentEvent::MessageEnd { .. }
            | AgentEvent::TurnEnd { .. } => {}
            AgentEvent::MessageUpdate { delta, .. } => {
                if let Value::String(text) = delta {
                    if !text.is_empty() {
                        self.delta_seq += 1;
                        self.accumulated.push_str(&text);
                        self.emit(RunEvent::Delta {
                            seq: self.delta_seq,
                            ts_ms: now_ms(),
                            text,
                        });
                    }
                }
            }
            AgentEvent::ToolExecutionStart { id, name, args } => {
                let action_id = format!("tool_{id}");
                let kind = classify_tool(&name);
                let title = preview_tool(&name, &args);
                let detail = json!({ "name": name, "args": args });
                self.pending_actions.insert(
                    action_id.clone(),
                    PendingAction {
                        kind,
                        title: title.clone(),
                        detail: detail.clone(),
                    },
                );
                self.emit(RunEvent::Action {
                    id: action_id,
                    kind,
                    title,
                    phase: ActionPhase::Started,
                    ok: None,
                    detail,
                });
            }
            AgentEvent::ToolExecutionUpdate { id, partial, .. } => {
                let action_id = format!("tool_{id}");
                if let Some(action) = self.pending_actions.get_mut(&action_id) {
                    merge_detail(&mut action.detail, "partial", partial);
                    let kind = action.kind;
                    let title = action.title.clone();
                    let detail = action.detail.clone();
                    self.emit(RunEvent::Action {
                        id: action_id,
                        kind,
                        title,
                        phase: ActionPhase::Updated,
                        ok: None,
                        detail,
                    });
                }
            }
            AgentEvent::ToolExecutionEnd {
                id,
                name,
                result,
                is_error,
            } => {
                let action_id = format!("tool_{id}");
                let (kind, title, mut detail) = match self.pending_actions.remove(&action_id) {
                    Some(action) => (action.kind, action.title, action.detail),
                    // Engine reported an end we never saw start; surface a
                    // standalone completed action.
                    None => (
                        classify_tool(&name),
                        preview_tool(&name, &Value::Null),
                        json!({ "name": name }),
                    ),
                };
                let full = flatten_blocks(&result);
                merge_detail(
                    &mut detail,
                    "result",
                    Value::String(truncate_str(&full, RESULT_DISPLAY_LIMIT)),
                );
                merge_detail(&mut detail, "result_full", Value::String(full));
                self.emit(RunEvent::Action {
                    id: action_id,
                    kind,
                    title,
                    phase: ActionPhase::Completed,
                    ok: Some(!is_error),
                    detail,
                });
            }
            AgentEvent::AgentEnd { new_messages } => {
                let answer = extract_last_assistant_text(&new_messages)
                    .unwrap_or_else(|| self.accumulated.clone());
                let usage = sum_usage(&new_messages);
                self.staged = Some(StagedCompletion { answer, usage });

                if let Some(text) = self.followups.pop_front() {
                    if !self.try_reprime(&text).await {
                        self.followups.push_front(text);
                        self.arm_followup_grace();
                    }
                } else {
                    self.arm_followup_grace();
                }
            }
            AgentEvent::Completed {
                ok,
                answer,
                resume,
                usage,
                error,
            } => {
                let staged = self.staged.take();
                let answer = answer
                    .filter(|a| !a.is_empty())
                    .or_else(|| staged.as_ref().map(|s| s.answer.clone()))
                    .unwrap_or_else(|| self.accumulated.clone());
                let usage = usage.or_else(|| staged.and_then(|s| s.usage));
                self.finalize(CompletionInfo {
                    ok,
                    answer,
                    error,
                    resume,
                    usage,
                })
                .await;
            }
            AgentEvent::Error { reason, .. } => {
                self.finalize(CompletionInfo {
                    ok: false,
                    answer: self.accumulated.clone(),
                    error: Some(reason),
                    resume: None,
                    usage: None,
                })
                .await;
            }
            AgentEvent::Canceled { reason } => {
                self.finalize(CompletionInfo {
                    ok: false,
                    answer: self.accumulated.clone(),
                    error: Some(format!("canceled: {reason}")),
                    resume: None,
                    usage: None,
                })
                .await;
            }
        }
    }

    async fn handle_stream_end(&mut self) {
        if self.done {
            return;
        }
        // Stream ended without a pushed terminal we acted on.
        let info = match (self.staged.take(), self.owner.as_ref()) {
            (Some(staged), _) => CompletionInfo {
                ok: true,
                answer: staged.answer,
                error: None,
                resume: None,
                usage: staged.usage,
            },
            (None, owner) => {
                let reason = owner
                    .and_then(|o| o.stream().terminal())
                    .map(|t| match t {
                        super::event_stream::StreamTerminal::Done(msgs) => {
                            return_info_from_messages(&msgs, &self.accumulated)
                        }
                        super::event_stream::StreamTerminal::Canceled(reason) => CompletionInfo {
                            ok: false,
                            answer: self.accumulated.clone(),
                            error: Some(format!("canceled: {reason}")),
                            resume: None,
                            usage: None,
                        },
                    });
                reason.unwrap_or(CompletionInfo {
                    ok: false,
                    answer: self.accumulated.clone(),
                    error: Some("process_crashed:stream_closed".into()),
                    resume: None,
                    usage: None,
                })
            }
        };
        self.finalize(info).await;
    }

    // ── Commands ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: RunCommand) {
        match command {
            RunCommand::Cancel { reason } => {
                if self.cancel_reason.is_some() {
                    return;
                }
                tracing::info!(reason = %reason, "cancel requested");
                self.cancel_reason = Some(reason.clone());
                if let Some(signal) = self.signal {
                    self.deps.aborts.abort(signal);
                }
                if let Err(err) = self.engine.stop(&self.job.run_id, &reason).await {
                    tracing::debug!(error = %err, "engine stop failed");
                }
                self.cancel_deadline = Some(
                    Instant::now() + Duration::from_millis(self.deps.config.runs.cancel_grace_ms),
                );
            }
            RunCommand::Steer { text } => {
                if let Err(err) = self.engine.steer(&self.job.run_id, &text).await {
                    tracing::warn!(error = %err, "steer rejected by engine");
                }
            }
            RunCommand::FollowUp { text } => {
                if self.staged.is_some() {
                    // Engine has wound down; the grace window is open.
                    if self.try_reprime(&text).await {
                        return;
                    }
                }
                self.followups.push_back(text);
            }
            RunCommand::Keepalive { keep } => {
                if !self.awaiting_confirmation {
                    return;
                }
                if keep {
                    tracing::info!("keepalive confirmed, watchdog re-armed");
                    self.awaiting_confirmation = false;
                    self.confirm_deadline = None;
                    self.arm_watchdog();
                } else {
                    self.watchdog_failure().await;
                }
            }
            RunCommand::GetState { reply } => {
                let _ = reply.send(RunSnapshot {
                    run_id: self.job.run_id.clone(),
                    session_key: self.job.request.session_key.clone(),
                    started_emitted: self.started_emitted,
                    completed_emitted: self.completed_emitted,
                    delta_seq: self.delta_seq,
                    accumulated_chars: self.accumulated.chars().count(),
                    pending_actions: self.pending_actions.len(),
                    awaiting_confirmation: self.awaiting_confirmation,
                    retry_attempt: self.job.request.meta.zero_answer_retry_attempt,
                });
            }
        }
    }

    async fn handle_deadline(&mut self, kind: DeadlineKind) {
        match kind {
            DeadlineKind::CancelGrace => {
                self.cancel_deadline = None;
                let reason = self
                    .cancel_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".into());
                self.finalize(CompletionInfo {
                    ok: false,
                    answer: self.accumulated.clone(),
                    error: Some(format!("canceled: {reason}")),
                    resume: None,
                    usage: None,
                })
                .await;
            }
            DeadlineKind::FollowupGrace => {
                self.grace_deadline = None;
                if let Some(staged) = self.staged.take() {
                    self.finalize(CompletionInfo {
                        ok: true,
                        answer: staged.answer,
                        error: None,
                        resume: None,
                        usage: staged.usage,
                    })
                    .await;
                }
            }
            DeadlineKind::Confirm => {
                self.confirm_deadline = None;
                self.watchdog_failure().await;
            }
            DeadlineKind::Watchdog => {
                self.watchdog_deadline = None;
                self.watchdog_fired().await;
            }
        }
    }

    // ── Watchdog ─────────────────────────────────────────────────────

    fn arm_watchdog(&mut self) {
        let idle = self.deps.config.runs.idle_timeout_ms;
        if idle > 0 {
            self.watchdog_deadline = Some(Instant::now() + Duration::from_millis(idle));
        }
    }

    /// Every engine event counts as activity: re-arm the idle timer and
    /// drop any pending keepalive question.
    fn touch_watchdog(&mut self) {
        if self.watchdog_deadline.is_some() || self.awaiting_confirmation {
            self.awaiting_confirmation = false;
            self.confirm_deadline = None;
            self.arm_watchdog();
        }
    }

    async fn watchdog_fired(&mut self) {
        let can_prompt = self
            .channel_route
            .as_ref()
            .and_then(|(channel, _, _)| self.deps.delivery.adapters().get(channel))
            .map(|a| a.meta().capabilities.inline_buttons)
            .unwrap_or(false);

        if !can_prompt {
            self.watchdog_failure().await;
            return;
        }

        let (channel, account, peer) = self.channel_route.clone().expect("channel route");
        let run_id = &self.job.run_id;
        let mut payload = OutboundPayload::text(
            &channel,
            &account,
            peer,
            "Still working on your request. Keep waiting?",
        );
        payload.meta = json!({
            "buttons": [
                { "text": "Keep Waiting", "callback_data": format!("run_keepalive:{run_id}:keep") },
                { "text": "Stop Run",     "callback_data": format!("run_keepalive:{run_id}:stop") },
            ]
        });
        if let Err(err) = self.deps.delivery.enqueue(payload, None) {
            tracing::warn!(error = %err, "keepalive prompt delivery failed");
            self.watchdog_failure().await;
            return;
        }

        tracing::info!("idle watchdog fired, keepalive prompt sent");
        self.awaiting_confirmation = true;
        self.confirm_deadline = Some(
            Instant::now() + Duration::from_millis(self.deps.config.runs.confirm_timeout_ms),
        );
    }

    async fn watchdog_failure(&mut self) {
        if let Some(signal) = self.signal {
            self.deps.aborts.abort(signal);
        }
        let _ = self
            .engine
            .stop(&self.job.run_id, "run_idle_watchdog_timeout")
            .await;
        self.finalize(CompletionInfo {
            ok: false,
            answer: self.accumulated.clone(),
            error: Some("run_idle_watchdog_timeout".into()),
            resume: None,
            usage: None,
        })
        .await;
    }

    // ── Follow-up re-priming ─────────────────────────────────────────

    async fn try_reprime(&mut self, text: &str) -> bool {
        match self.engine.follow_up(&self.job.run_id, text).await {
            Ok(true) => {
                tracing::info!("follow-up re-primed the engine");
                self.staged = None;
                self.grace_deadline = None;
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::debug!(error = %err, "follow-up rejected");
                false
            }
        }
    }

    fn arm_followup_grace(&mut self) {
        let grace = self.deps.config.runs.followup_grace_ms;
        self.grace_deadline = Some(Instant::now() + Duration::from_millis(grace));
    }

    // ── Emission & finalization ──────────────────────────────────────

    fn emit(&self, event: RunEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_started(&mut self) {
        if self.started_emitted {
            return;
        }
        self.started_emitted = true;
        self.emit(RunEvent::Started {
            resume: self.resume_at_start.clone(),
        });
        self.arm_watchdog();
    }

    async fn finalize(&mut self, info: CompletionInfo) {
        if self.done {
            return;
        }
        self.done = true;
        self.watchdog_deadline = None;
        self.confirm_deadline = None;
        self.cancel_deadline = None;
        self.grace_deadline = None;

        // A run that dies before agent_start still reports started first.
        self.emit_started();

        let error = info.error.clone();
        if !self.completed_emitted {
            self.completed_emitted = true;
            self.emit(RunEvent::Completed {
                ok: info.ok,
                answer: info.answer.clone(),
                error: error.clone(),
                usage: info.usage.clone(),
                resume: info.resume.clone(),
            });
        }

        let session_key = &self.job.request.session_key;

        // Resume checkpoint: only a successful completion may overwrite,
        // and a context overflow resets it outright.
        if info.ok {
            if let Some(token) = &info.resume {
                self.deps.sessions.set_resume(session_key, token.clone());
            }
            let engine_window = self.engine.context_window();
            let window = self
                .deps
                .config
                .context_window_for(self.engine.id(), engine_window);
            if let Some(marker) = check_near_limit(
                &self.deps.config.compaction,
                window,
                info.usage.as_ref(),
                &self.job.request.prompt,
            ) {
                self.deps.sessions.set_pending_compaction(session_key, marker);
            }
        } else if let Some(error_text) = &error {
            if is_context_overflow(error_text) {
                tracing::warn!("context overflow detected, resetting resume state");
                self.deps.sessions.clear_resume(session_key);
                self.deps
                    .sessions
                    .set_pending_compaction(session_key, PendingCompaction::overflow());
            } else if should_retry(
                &self.job,
                &info.answer,
                error_text,
                self.deps.config.runs.zero_answer_max_retries,
            ) {
                let retry = build_retry_request(&self.job, error_text);
                tracing::info!(
                    attempt = retry.meta.zero_answer_retry_attempt,
                    "zero-answer retry queued"
                );
                self.resubmissions.push(retry);
            }
        }

        // Queued follow-ups the engine never consumed become fresh
        // submissions processed after this run.
        let followups: Vec<String> = self.followups.drain(..).collect();
        for text in followups {
            let mut request = self.job.request.clone();
            request.prompt = text;
            request.queue_mode = courier_domain::request::QueueMode::Collect;
            self.resubmissions.push(request);
        }

        self.deliver_final(&info, error.as_deref());

        // Run record + session bookkeeping.
        let status = completion_status(&info, error.as_deref());
        let usage_clone = info.usage.clone();
        self.deps.run_store.update(&self.job.run_id, |r| {
            r.answer_preview = Some(truncate_str(&info.answer, 200));
            r.error = error.clone();
            r.usage = usage_clone.clone();
            r.finish(status);
        });
        if let Some(record) = self.deps.run_store.get(&self.job.run_id) {
            self.deps.run_store.persist(&record);
        }
        let (in_tokens, out_tokens) = info
            .usage
            .as_ref()
            .map(|u| (u.effective_input_tokens(), u.output_tokens))
            .unwrap_or((0, 0));
        self.deps
            .sessions
            .record_completion(session_key, &self.job.run_id, in_tokens, out_tokens);
        if let Err(err) = self.deps.sessions.flush() {
            tracing::warn!(error = %err, "session flush failed");
        }

        // Published only after the final normalized event went out.
        let duration_ms = (now_ms() - self.job.started_at_ms).max(0) as u64;
        self.deps.bus.publish(RunBusEvent::RunCompleted {
            run_id: self.job.run_id.clone(),
            ok: info.ok,
            answer: info.answer,
            error,
            resume: info.resume,
            usage: info.usage,
            duration_ms,
        });
    }

    /// Push the run's outcome back to the originating channel.
    fn deliver_final(&self, info: &CompletionInfo, error: Option<&str>) {
        let Some((channel, account, peer)) = self.channel_route.clone() else {
            return;
        };
        let text = if info.ok {
            info.answer.clone()
        } else {
            let error = error.unwrap_or("unknown error");
            if info.answer.trim().is_empty() {
                format!("⚠️ {error}")
            } else {
                format!("{}\n\n⚠️ {error}", info.answer)
            }
        };
        if text.trim().is_empty() {
            return;
        }

        let mut payload = OutboundPayload::text(&channel, &account, peer, &text);
        payload.idempotency_key = Some(format!("run:{}:final", self.job.run_id));
        payload.reply_to = self.job.request.meta.reply_to_message_id.clone();
        if let Err(err) = self.deps.delivery.enqueue(payload, None) {
            tracing::warn!(error = %err, "final answer delivery failed");
        }
    }
}

fn completion_status(info: &CompletionInfo, error: Option<&str>) -> RunStatus {
    if info.ok {
        RunStatus::Completed
    } else if error.map(|e| e.starts_with("canceled:")).unwrap_or(false) {
        RunStatus::Stopped
    } else {
        RunStatus::Failed
    }
}

fn return_info_from_messages(messages: &[Value], accumulated: &str) -> CompletionInfo {
    CompletionInfo {
        ok: true,
        answer: extract_last_assistant_text(messages).unwrap_or_else(|| accumulated.to_owned()),
        error: None,
        resume: None,
        usage: sum_usage(messages),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map a tool name to the action category clients render.
pub fn classify_tool(name: &str) -> ActionKind {
    match name {
        "Bash" => ActionKind::Command,
        "Write" | "Edit" => ActionKind::FileChange,
        "WebSearch" | "WebFetch" => ActionKind::WebSearch,
        "Task" => ActionKind::Subagent,
        _ => ActionKind::Tool,
    }
}

/// Short human title for a tool invocation.
pub fn preview_tool(name: &str, args: &Value) -> String {
    let str_arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or("");
    match name {
        "Bash" => {
            let command = str_arg("command");
            let first_line = command.lines().next().unwrap_or("");
            format!("$ {}", truncate_str(first_line, 60))
        }
        "Read" | "Write" | "Edit" => {
            format!("{name} {}", basename(str_arg("file_path")))
        }
        "Glob" | "Grep" => format!("{name} {}", str_arg("pattern")),
        "WebSearch" => format!("Search: {}", truncate_str(str_arg("query"), 60)),
        "WebFetch" => format!("Fetch {}", truncate_str(str_arg("url"), 60)),
        "Task" => {
            let what = if str_arg("description").is_empty() {
                str_arg("prompt")
            } else {
                str_arg("description")
            };
            format!("Subagent: {}", truncate_str(what, 60))
        }
        _ => name.to_owned(),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn merge_detail(detail: &mut Value, key: &str, value: Value) {
    match detail {
        Value::Object(map) => {
            map.insert(key.to_owned(), value);
        }
        other => {
            *other = json!({ key: value });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_tools() {
        assert_eq!(classify_tool("Bash"), ActionKind::Command);
        assert_eq!(classify_tool("Read"), ActionKind::Tool);
        assert_eq!(classify_tool("Write"), ActionKind::FileChange);
        assert_eq!(classify_tool("Edit"), ActionKind::FileChange);
        assert_eq!(classify_tool("Glob"), ActionKind::Tool);
        assert_eq!(classify_tool("Grep"), ActionKind::Tool);
        assert_eq!(classify_tool("WebSearch"), ActionKind::WebSearch);
        assert_eq!(classify_tool("WebFetch"), ActionKind::WebSearch);
        assert_eq!(classify_tool("Task"), ActionKind::Subagent);
        assert_eq!(classify_tool("SomethingElse"), ActionKind::Tool);
    }

    #[test]
    fn preview_bash_first_line_capped() {
        let args = json!({ "command": "echo hello\nrm -rf /tmp/x" });
        assert_eq!(preview_tool("Bash", &args), "$ echo hello");

        let long = json!({ "command": "x".repeat(100) });
        let preview = preview_tool("Bash", &long);
        assert!(preview.starts_with("$ "));
        assert!(preview.len() <= 2 + 60 + 3);
    }

    #[test]
    fn preview_file_tools_use_basename() {
        let args = json!({ "file_path": "/a/b/c/main.rs" });
        assert_eq!(preview_tool("Read", &args), "Read main.rs");
        assert_eq!(preview_tool("Edit", &args), "Edit main.rs");
    }

    #[test]
    fn preview_search_tools() {
        assert_eq!(
            preview_tool("Grep", &json!({ "pattern": "fn main" })),
            "Grep fn main"
        );
        assert_eq!(
            preview_tool("WebSearch", &json!({ "query": "rust" })),
            "Search: rust"
        );
    }

    #[test]
    fn preview_unknown_tool_is_name() {
        assert_eq!(preview_tool("mcp__weather", &Value::Null), "mcp__weather");
    }

    #[test]
    fn merge_detail_into_object_and_scalar() {
        let mut detail = json!({ "a": 1 });
        merge_detail(&mut detail, "b", json!(2));
        assert_eq!(detail, json!({ "a": 1, "b": 2 }));

        let mut scalar = Value::Null;
        merge_detail(&mut scalar, "x", json!("y"));
        assert_eq!(scalar, json!({ "x": "y" }));
    }

    #[test]
    fn completion_status_mapping() {
        let ok = CompletionInfo {
            ok: true,
            answer: "a".into(),
            error: None,
            resume: None,
            usage: None,
        };
        assert_eq!(completion_status(&ok, None), RunStatus::Completed);

        let stopped = CompletionInfo {
            ok: false,
            answer: String::new(),
            error: Some("canceled: interrupted".into()),
            resume: None,
            usage: None,
        };
        assert_eq!(
            completion_status(&stopped, Some("canceled: interrupted")),
            RunStatus::Stopped
        );

        let failed = CompletionInfo {
            ok: false,
            answer: String::new(),
            error: Some("assistant_error: tls".into()),
            resume: None,
            usage: None,
        };
        assert_eq!(
            completion_status(&failed, Some("assistant_error: tls")),
            RunStatus::Failed
        );
    }
}
