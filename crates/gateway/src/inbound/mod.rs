//! Inbound routing.
//!
//! Connectors post normalized channel messages here. The router dedupes
//! webhook replays, resolves the target agent / queue mode / engine from
//! the binding table and any command prefixes, builds the canonical
//! session key, and submits the run. Keepalive button callbacks are
//! routed back to their run.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use courier_domain::config::{BindingConfig, Config};
use courier_domain::error::{Error, Result};
use courier_domain::payload::PeerRef;
use courier_domain::request::{QueueMode, RunOrigin, RunRequest};
use courier_sessions::make_channel_peer;

use crate::engine::EngineRegistry;
use crate::runtime::orchestrator::Orchestrator;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalized inbound message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct SenderInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub timestamp_ms: i64,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

/// The shape every channel adapter normalizes its raw updates into.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub channel_id: String,
    #[serde(default = "d_account")]
    pub account_id: String,
    pub peer: PeerRef,
    #[serde(default)]
    pub sender: Option<SenderInfo>,
    pub message: MessageInfo,
    #[serde(default)]
    pub raw: Value,
    #[serde(default)]
    pub meta: Value,
}

fn d_account() -> String {
    "default".into()
}

/// What handling an inbound message led to.
#[derive(Debug)]
pub enum InboundOutcome {
    /// Seen before within the dedupe TTL; nothing submitted.
    Duplicate,
    /// Empty or unroutable content; nothing submitted.
    Ignored,
    Submitted {
        run_id: String,
        session_key: String,
    },
    /// Session already busy under `collect` mode.
    Busy {
        session_key: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replay guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type MessageKey = (String, String);

struct GuardState {
    /// `(peer_id, message_id)` → when the sighting stops counting.
    live: HashMap<MessageKey, Instant>,
    /// Insertion-ordered expiry queue; the front entry expires first, so
    /// eviction never has to walk the whole map.
    expiry: VecDeque<(Instant, MessageKey)>,
}

/// Replay guard for inbound messages.
///
/// Webhook retries, reconnects, and long-poll replays deliver the same
/// `(peer, message)` pair more than once; a sighting is remembered for
/// the configured TTL. Each call first drains whatever has expired off
/// the front of the queue, keeping both tables bounded without periodic
/// sweeps.
pub struct InboundDedupe {
    ttl: Duration,
    state: Mutex<GuardState>,
}

impl InboundDedupe {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(GuardState {
                live: HashMap::new(),
                expiry: VecDeque::new(),
            }),
        }
    }

    /// Record a sighting of `(peer_id, message_id)`.
    ///
    /// Returns `true` when the pair is new and `false` for a replay
    /// within the TTL. A replay does not extend the original window.
    pub fn first_sighting(&self, peer_id: &str, message_id: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        while state
            .expiry
            .front()
            .map(|(deadline, _)| *deadline <= now)
            .unwrap_or(false)
        {
            if let Some((_, key)) = state.expiry.pop_front() {
                // A key re-registered after expiring leaves a stale queue
                // entry behind; only drop the map record if it matches.
                let stale = state.live.get(&key).map(|d| *d <= now).unwrap_or(false);
                if stale {
                    state.live.remove(&key);
                }
            }
        }

        let key = (peer_id.to_owned(), message_id.to_owned());
        if let Some(deadline) = state.live.get(&key) {
            if *deadline > now {
                return false;
            }
        }
        let deadline = now + self.ttl;
        state.live.insert(key.clone(), deadline);
        state.expiry.push_back((deadline, key));
        true
    }

    /// Live (non-expired, non-evicted) sightings currently tracked.
    pub fn tracked(&self) -> usize {
        self.state.lock().live.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Binding table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Clone)]
pub struct ResolvedBinding {
    pub agent_id: Option<String>,
    pub queue_mode: Option<QueueMode>,
    pub engine_id: Option<String>,
}

/// Routing bindings scoped to `{channel, chat_id, thread_id?}`. A binding
/// with a thread id only matches that thread and wins over the chat-wide
/// one.
pub struct BindingTable {
    bindings: Vec<BindingConfig>,
}

impl BindingTable {
    pub fn new(bindings: Vec<BindingConfig>) -> Self {
        Self { bindings }
    }

    pub fn resolve(
        &self,
        channel: &str,
        chat_id: &str,
        thread_id: Option<&str>,
    ) -> ResolvedBinding {
        let pick = |want_thread: Option<&str>| {
            self.bindings.iter().find(|b| {
                b.channel == channel
                    && b.chat_id == chat_id
                    && b.thread_id.as_deref() == want_thread
            })
        };
        let binding = thread_id
            .and_then(|t| pick(Some(t)))
            .or_else(|| pick(None));

        match binding {
            Some(b) => ResolvedBinding {
                agent_id: b.agent_id.clone(),
                queue_mode: b.queue_mode.as_deref().and_then(QueueMode::parse),
                engine_id: b.engine_id.clone(),
            },
            None => ResolvedBinding::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command prefixes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCommands {
    pub queue_mode: Option<QueueMode>,
    pub engine_id: Option<String>,
    pub rest: String,
}

/// Strip leading `/steer` / `/followup` / `/interrupt` mode overrides and
/// `/claude`-style engine directives off the message text.
pub fn parse_command_prefixes(
    text: &str,
    engines: &EngineRegistry,
    allow_mode_override: bool,
) -> ParsedCommands {
    static TOKEN_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let token_re =
        TOKEN_RE.get_or_init(|| Regex::new(r"^/([A-Za-z0-9_-]+)\s*").expect("valid pattern"));
    let mut parsed = ParsedCommands::default();
    let mut rest = text.trim_start();

    loop {
        let Some(caps) = token_re.captures(rest) else {
            break;
        };
        let token = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let consumed = caps.get(0).map(|m| m.end()).unwrap_or(0);

        if let Some(mode) = QueueMode::parse(token) {
            if allow_mode_override && parsed.queue_mode.is_none() {
                parsed.queue_mode = Some(mode);
                rest = &rest[consumed..];
                continue;
            }
            break;
        }
        if engines.contains(token) && parsed.engine_id.is_none() {
            parsed.engine_id = Some(token.to_owned());
            rest = &rest[consumed..];
            continue;
        }
        break;
    }

    parsed.rest = rest.to_owned();
    parsed
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct InboundRouter {
    config: Arc<Config>,
    dedupe: InboundDedupe,
    bindings: BindingTable,
    orchestrator: Arc<Orchestrator>,
    engines: Arc<EngineRegistry>,
}

impl InboundRouter {
    pub fn new(
        config: Arc<Config>,
        orchestrator: Arc<Orchestrator>,
        engines: Arc<EngineRegistry>,
    ) -> Self {
        let dedupe = InboundDedupe::new(Duration::from_secs(config.inbound.dedupe_ttl_secs));
        let bindings = BindingTable::new(config.inbound.bindings.clone());
        Self {
            config,
            dedupe,
            bindings,
            orchestrator,
            engines,
        }
    }

    /// Route one normalized inbound message to a run.
    pub fn handle_inbound(&self, message: InboundMessage) -> Result<InboundOutcome> {
        if message.channel_id.is_empty() || message.peer.id.is_empty() {
            return Err(Error::InvalidParams(
                "channel_id and peer.id are required".into(),
            ));
        }
        if !self
            .dedupe
            .first_sighting(&message.peer.id, &message.message.id)
        {
            tracing::debug!(
                peer = %message.peer.id,
                message_id = %message.message.id,
                "duplicate inbound dropped"
            );
            return Ok(InboundOutcome::Duplicate);
        }

        // Keepalive button callbacks ride the same inbound path.
        if let Some(outcome) = self.try_handle_callback(&message) {
            return outcome;
        }

        let binding = self.bindings.resolve(
            &message.channel_id,
            &message.peer.id,
            message.peer.thread_id.as_deref(),
        );
        let commands = parse_command_prefixes(
            &message.message.text,
            &self.engines,
            self.config.inbound.allow_mode_override,
        );
        if commands.rest.trim().is_empty() {
            return Ok(InboundOutcome::Ignored);
        }

        let session_key = make_channel_peer(
            &message.channel_id,
            &message.account_id,
            message.peer.kind,
            &message.peer.id,
            message.peer.thread_id.as_deref(),
        );
        let agent_id = binding.agent_id.unwrap_or_else(|| "default".into());
        let queue_mode = commands
            .queue_mode
            .or(binding.queue_mode)
            .unwrap_or_default();
        let engine_id = commands.engine_id.or(binding.engine_id);

        let mut request = RunRequest::new(&session_key, &agent_id, &commands.rest);
        request.origin = RunOrigin::Channel;
        request.queue_mode = queue_mode;
        request.engine_id = engine_id;
        request.meta.reply_to_message_id = Some(message.message.id.clone());

        match self.orchestrator.submit(request) {
            Ok(run_id) => {
                tracing::info!(%run_id, session_key = %session_key, "inbound admitted");
                Ok(InboundOutcome::Submitted {
                    run_id,
                    session_key,
                })
            }
            Err(Error::Busy(_)) => Ok(InboundOutcome::Busy { session_key }),
            Err(err) => Err(err),
        }
    }

    /// `run_keepalive:<run_id>:keep|stop` callbacks answer the watchdog
    /// prompt.
    fn try_handle_callback(&self, message: &InboundMessage) -> Option<Result<InboundOutcome>> {
        let data = message
            .raw
            .get("callback_data")
            .and_then(Value::as_str)
            .unwrap_or(&message.message.text);
        let rest = data.strip_prefix("run_keepalive:")?;
        let (run_id, verb) = rest.rsplit_once(':')?;

        let keep = match verb {
            "keep" => true,
            "stop" => false,
            _ => return Some(Ok(InboundOutcome::Ignored)),
        };
        Some(match self.orchestrator.keepalive(run_id, keep) {
            Ok(()) => Ok(InboundOutcome::Ignored),
            Err(err) => Err(err),
        })
    }
}
