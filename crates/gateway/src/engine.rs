//! Engine contract.
//!
//! An engine is the external process that actually runs the model and its
//! tools. The gateway only consumes its event stream: `start` must return
//! quickly after spawning a producer that pushes [`AgentEvent`]s into the
//! run's stream and ends it with a terminal event (or `complete`).
//!
//! Two in-process engines ship with the gateway: [`EchoEngine`] backs the
//! `loopback` channel for local smoke runs, and [`ScriptedEngine`] drives
//! the pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use courier_domain::error::{Error, Result};
use courier_domain::event::{AgentEvent, ResumeToken, Usage};
use courier_domain::request::Job;

use crate::runtime::abort::{AbortRegistry, SignalHandle};
use crate::runtime::event_stream::EventStream;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything an engine needs to produce one run's events.
#[derive(Clone)]
pub struct EngineContext {
    pub job: Job,
    pub stream: EventStream,
    pub resume: Option<ResumeToken>,
    pub signal: SignalHandle,
    pub aborts: Arc<AbortRegistry>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Stable engine id (`"loopback"`, `"claude"`, `"codex"`).
    fn id(&self) -> &str;

    /// Context window in tokens, when the engine knows it.
    fn context_window(&self) -> Option<u64> {
        None
    }

    /// Begin producing events for one run. Must return promptly; the
    /// event work happens in a task the engine owns.
    async fn start(&self, ctx: EngineContext) -> Result<()>;

    /// Inject a mid-run directive the engine may act on immediately.
    async fn steer(&self, run_id: &str, text: &str) -> Result<()>;

    /// Queue a post-completion directive. Returns `true` when the engine
    /// accepted it and will keep the run alive, `false` when the run has
    /// already closed.
    async fn follow_up(&self, run_id: &str, text: &str) -> Result<bool>;

    /// Ask the engine to stop the run. Cooperative: the engine should end
    /// its stream with a `canceled` terminal.
    async fn stop(&self, run_id: &str, reason: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn Engine>>>,
    default_id: String,
}

impl EngineRegistry {
    pub fn new(default_id: &str) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            default_id: default_id.to_owned(),
        }
    }

    pub fn register(&self, engine: Arc<dyn Engine>) {
        let id = engine.id().to_owned();
        self.engines.write().insert(id.clone(), engine);
        tracing::info!(engine = %id, "engine registered");
    }

    /// Resolve an engine by id, or the default when `None`.
    pub fn resolve(&self, engine_id: Option<&str>) -> Result<Arc<dyn Engine>> {
        let id = engine_id.unwrap_or(&self.default_id);
        self.engines
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("engine {id}")))
    }

    pub fn contains(&self, engine_id: &str) -> bool {
        self.engines.read().contains_key(engine_id)
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Echo engine (loopback)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Echoes the prompt back as the answer. Useful for wiring checks without
/// a model behind the gateway.
#[derive(Default)]
pub struct EchoEngine {
    active: Mutex<HashMap<String, EventStream>>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Engine for EchoEngine {
    fn id(&self) -> &str {
        "loopback"
    }

    fn context_window(&self) -> Option<u64> {
        Some(128_000)
    }

    async fn start(&self, ctx: EngineContext) -> Result<()> {
        let run_id = ctx.job.run_id.clone();
        self.active.lock().insert(run_id.clone(), ctx.stream.clone());

        let prompt = ctx.job.request.prompt.clone();
        let stream = ctx.stream;
        tokio::spawn(async move {
            let usage = Usage {
                input_tokens: (prompt.len() as u64) / 4,
                output_tokens: (prompt.len() as u64) / 4,
                ..Default::default()
            };
            let message = json!({
                "role": "assistant",
                "content": prompt,
                "usage": usage,
            });
            stream.push_lossy(AgentEvent::AgentStart);
            stream.push_lossy(AgentEvent::TurnStart);
            stream.push_lossy(AgentEvent::MessageUpdate {
                msg: Value::Null,
                delta: Value::String(prompt.clone()),
            });
            stream.push_lossy(AgentEvent::MessageEnd {
                msg: message.clone(),
            });
            stream.push_lossy(AgentEvent::AgentEnd {
                new_messages: vec![message],
            });
            stream.push_lossy(AgentEvent::Completed {
                ok: true,
                answer: Some(prompt),
                resume: Some(ResumeToken {
                    engine: "loopback".into(),
                    value: run_id,
                }),
                usage: Some(usage),
                error: None,
            });
        });
        Ok(())
    }

    async fn steer(&self, run_id: &str, text: &str) -> Result<()> {
        if let Some(stream) = self.active.lock().get(run_id).cloned() {
            stream.push_lossy(AgentEvent::MessageUpdate {
                msg: Value::Null,
                delta: Value::String(format!("\n[steered: {text}]")),
            });
        }
        Ok(())
    }

    async fn follow_up(&self, _run_id: &str, _text: &str) -> Result<bool> {
        Ok(false)
    }

    async fn stop(&self, run_id: &str, reason: &str) -> Result<()> {
        if let Some(stream) = self.active.lock().remove(run_id) {
            stream.push_lossy(AgentEvent::Canceled {
                reason: reason.to_owned(),
            });
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(AgentEvent),
    /// End the stream normally with final messages.
    Complete(Vec<Value>),
    SleepMs(u64),
}

/// Plays back a fixed event script per started run; used by tests and
/// fault drills. Consecutive `start`s consume scripts in order; the last
/// script repeats when the list runs dry.
pub struct ScriptedEngine {
    id: String,
    window: Option<u64>,
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    followup_script: Mutex<Option<Vec<ScriptStep>>>,
    active: Mutex<HashMap<String, EventStream>>,
    steered: Mutex<Vec<(String, String)>>,
    followups: Mutex<Vec<(String, String)>>,
}

impl ScriptedEngine {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            window: None,
            scripts: Mutex::new(VecDeque::new()),
            followup_script: Mutex::new(None),
            active: Mutex::new(HashMap::new()),
            steered: Mutex::new(Vec::new()),
            followups: Mutex::new(Vec::new()),
        }
    }

    pub fn with_window(mut self, window: u64) -> Self {
        self.window = Some(window);
        self
    }

    pub fn push_script(&self, script: Vec<ScriptStep>) {
        self.scripts.lock().push_back(script);
    }

    pub fn set_followup_script(&self, script: Vec<ScriptStep>) {
        *self.followup_script.lock() = Some(script);
    }

    pub fn steered(&self) -> Vec<(String, String)> {
        self.steered.lock().clone()
    }

    pub fn followups(&self) -> Vec<(String, String)> {
        self.followups.lock().clone()
    }

    fn next_script(&self) -> Vec<ScriptStep> {
        let mut scripts = self.scripts.lock();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap_or_default()
        } else {
            scripts.front().cloned().unwrap_or_default()
        }
    }

    fn play(stream: EventStream, script: Vec<ScriptStep>) {
        tokio::spawn(async move {
            for step in script {
                match step {
                    ScriptStep::Emit(event) => {
                        if stream.push(event).is_err() {
                            return;
                        }
                    }
                    ScriptStep::Complete(messages) => {
                        stream.complete(messages);
                        return;
                    }
                    ScriptStep::SleepMs(ms) => {
                        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn context_window(&self) -> Option<u64> {
        self.window
    }

    async fn start(&self, ctx: EngineContext) -> Result<()> {
        self.active
            .lock()
            .insert(ctx.job.run_id.clone(), ctx.stream.clone());
        Self::play(ctx.stream, self.next_script());
        Ok(())
    }

    async fn steer(&self, run_id: &str, text: &str) -> Result<()> {
        self.steered.lock().push((run_id.to_owned(), text.to_owned()));
        Ok(())
    }

    async fn follow_up(&self, run_id: &str, text: &str) -> Result<bool> {
        self.followups
            .lock()
            .push((run_id.to_owned(), text.to_owned()));
        let script = self.followup_script.lock().take();
        match script {
            Some(script) => {
                let stream = self
                    .active
                    .lock()
                    .get(run_id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
                if stream.is_terminated() {
                    return Ok(false);
                }
                Self::play(stream, script);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stop(&self, run_id: &str, reason: &str) -> Result<()> {
        if let Some(stream) = self.active.lock().remove(run_id) {
            stream.push_lossy(AgentEvent::Canceled {
                reason: reason.to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_domain::config::StreamConfig;
    use courier_domain::request::{new_run_id, RunRequest};

    use crate::runtime::event_stream::event_stream;

    fn ctx(stream: EventStream) -> EngineContext {
        let aborts = Arc::new(AbortRegistry::new());
        let signal = aborts.create();
        EngineContext {
            job: Job::admit(
                new_run_id(),
                RunRequest::new("agent_main:default", "default", "echo hi"),
            ),
            stream,
            resume: None,
            signal,
            aborts,
        }
    }

    #[tokio::test]
    async fn registry_resolution() {
        let registry = EngineRegistry::new("loopback");
        registry.register(Arc::new(EchoEngine::new()));

        assert!(registry.resolve(None).is_ok());
        assert!(registry.resolve(Some("loopback")).is_ok());
        assert!(registry.contains("loopback"));
        match registry.resolve(Some("codex")) {
            Err(Error::NotFound(what)) => assert!(what.contains("codex")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("unexpected success"),
        }
    }

    #[tokio::test]
    async fn echo_engine_produces_full_run() {
        let (stream, mut owner) = event_stream(&StreamConfig::default());
        let engine = EchoEngine::new();
        engine.start(ctx(stream)).await.unwrap();

        let mut kinds = Vec::new();
        while let Some(event) = owner.next().await {
            kinds.push(match event {
                AgentEvent::AgentStart => "start",
                AgentEvent::TurnStart => "turn",
                AgentEvent::MessageUpdate { .. } => "delta",
                AgentEvent::MessageEnd { .. } => "msg_end",
                AgentEvent::AgentEnd { .. } => "agent_end",
                AgentEvent::Completed { ok: true, .. } => "completed_ok",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["start", "turn", "delta", "msg_end", "agent_end", "completed_ok"]
        );
    }

    #[tokio::test]
    async fn scripted_engine_plays_script() {
        let (stream, mut owner) = event_stream(&StreamConfig::default());
        let engine = ScriptedEngine::new("test");
        engine.push_script(vec![
            ScriptStep::Emit(AgentEvent::AgentStart),
            ScriptStep::Emit(AgentEvent::Error {
                reason: "boom".into(),
                partial_state: None,
            }),
        ]);
        engine.start(ctx(stream)).await.unwrap();

        assert!(matches!(owner.next().await, Some(AgentEvent::AgentStart)));
        assert!(matches!(owner.next().await, Some(AgentEvent::Error { .. })));
        assert!(owner.next().await.is_none());
    }

    #[tokio::test]
    async fn scripted_stop_cancels_stream() {
        let (stream, mut owner) = event_stream(&StreamConfig::default());
        let engine = ScriptedEngine::new("test");
        engine.push_script(vec![
            ScriptStep::Emit(AgentEvent::AgentStart),
            ScriptStep::SleepMs(60_000),
        ]);
        let context = ctx(stream);
        let run_id = context.job.run_id.clone();
        engine.start(context).await.unwrap();

        assert!(matches!(owner.next().await, Some(AgentEvent::AgentStart)));
        engine.stop(&run_id, "interrupted").await.unwrap();
        match owner.next().await {
            Some(AgentEvent::Canceled { reason }) => assert_eq!(reason, "interrupted"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
