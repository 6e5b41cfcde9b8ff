//! Gateway configuration, deserialized from TOML once at boot and passed
//! into each subsystem as an `Arc<Config>`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub inbound: InboundConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root directory for persisted gateway state (sessions, runs).
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
    /// Interval between periodic session-store flushes.
    #[serde(default = "d_flush_secs")]
    pub flush_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: d_state_path(),
            flush_interval_secs: d_flush_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Idle watchdog: a run with no engine activity for this long gets a
    /// keepalive prompt (or fails on channels without one).
    #[serde(default = "d_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// How long a keepalive prompt waits for an answer before the run is
    /// failed.
    #[serde(default = "d_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    /// After asking the engine to stop, how long to wait for a natural
    /// completion before synthesizing a canceled one.
    #[serde(default = "d_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Grace window after engine end during which a queued follow-up may
    /// re-prime the engine instead of closing the run.
    #[serde(default = "d_followup_grace_ms")]
    pub followup_grace_ms: u64,
    /// Maximum zero-answer auto-retries per original submission.
    #[serde(default = "d_one")]
    pub zero_answer_max_retries: u32,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: d_idle_timeout_ms(),
            confirm_timeout_ms: d_confirm_timeout_ms(),
            cancel_grace_ms: d_cancel_grace_ms(),
            followup_grace_ms: d_followup_grace_ms(),
            zero_answer_max_retries: d_one(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What to do when an event stream's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DropStrategy {
    /// Reject the push with an overflow error.
    #[default]
    Error,
    /// Evict the oldest queued event and accept the new one.
    DropOldest,
    /// Drop the incoming event.
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "d_max_queue")]
    pub max_queue: usize,
    #[serde(default)]
    pub drop_strategy: DropStrategy,
    /// Total wall-clock budget for one stream; 0 disables the limit.
    #[serde(default = "d_stream_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_queue: d_max_queue(),
            drop_strategy: DropStrategy::Error,
            timeout_ms: d_stream_timeout_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Minimum spacing between deliveries to one peer; 0 disables
    /// throttling.
    #[serde(default = "d_throttle_ms")]
    pub throttle_ms: u64,
    /// Retention window for the idempotency store.
    #[serde(default = "d_dedupe_retention_secs")]
    pub dedupe_retention_secs: u64,
    #[serde(default = "d_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "d_max_transient_retries")]
    pub max_transient_retries: u32,
    /// Base for transient backoff: `base * 2^attempt`.
    #[serde(default = "d_transient_backoff_base_ms")]
    pub transient_backoff_base_ms: u64,
    /// Floor applied to provider retry-after hints.
    #[serde(default = "d_min_rate_limit_delay_ms")]
    pub min_rate_limit_delay_ms: u64,
    /// Maximum images per media-group request.
    #[serde(default = "d_media_batch_max")]
    pub media_batch_max: usize,
    /// Delay between individual sends when a batch falls back to
    /// one-by-one delivery.
    #[serde(default = "d_media_send_delay_ms")]
    pub media_send_delay_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            throttle_ms: d_throttle_ms(),
            dedupe_retention_secs: d_dedupe_retention_secs(),
            max_rate_limit_retries: d_max_rate_limit_retries(),
            max_transient_retries: d_max_transient_retries(),
            transient_backoff_base_ms: d_transient_backoff_base_ms(),
            min_rate_limit_delay_ms: d_min_rate_limit_delay_ms(),
            media_batch_max: d_media_batch_max(),
            media_send_delay_ms: d_media_send_delay_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction thresholds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Tokens held back from the window before the near-limit trigger.
    #[serde(default = "d_reserve_tokens")]
    pub reserve_tokens: u64,
    /// Fraction of the window that triggers near-limit compaction.
    #[serde(default = "d_trigger_ratio")]
    pub trigger_ratio: f64,
    /// Window used when neither config nor the engine knows better.
    #[serde(default = "d_default_context_window")]
    pub default_context_window: u64,
    /// Per-engine window overrides (key = engine id).
    #[serde(default)]
    pub context_windows: HashMap<String, u64>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            reserve_tokens: d_reserve_tokens(),
            trigger_ratio: d_trigger_ratio(),
            default_context_window: d_default_context_window(),
            context_windows: HashMap::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routing binding scoped to `{channel, chat_id, thread_id?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub channel: String,
    pub chat_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub queue_mode: Option<String>,
    #[serde(default)]
    pub engine_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// TTL for `(peer_id, message_id)` deduplication.
    #[serde(default = "d_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,
    /// Whether `/steer`, `/followup`, `/interrupt` prefixes may override
    /// the bound queue mode.
    #[serde(default = "d_true")]
    pub allow_mode_override: bool,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            dedupe_ttl_secs: d_dedupe_ttl_secs(),
            allow_mode_override: true,
            bindings: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engines
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesConfig {
    #[serde(default = "d_default_engine")]
    pub default_engine: String,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            default_engine: d_default_engine(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let error = |field: &str, message: String| ConfigIssue {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message,
        };
        let warn = |field: &str, message: String| ConfigIssue {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message,
        };

        if self.server.port == 0 {
            issues.push(error("server.port", "port must be greater than 0".into()));
        }
        if self.server.host.is_empty() {
            issues.push(error("server.host", "host must not be empty".into()));
        }
        if self.stream.max_queue == 0 {
            issues.push(error(
                "stream.max_queue",
                "event stream capacity must be at least 1".into(),
            ));
        }
        if !(self.compaction.trigger_ratio > 0.0 && self.compaction.trigger_ratio <= 1.0) {
            issues.push(error(
                "compaction.trigger_ratio",
                format!(
                    "trigger_ratio must be in (0, 1] (got {})",
                    self.compaction.trigger_ratio
                ),
            ));
        }
        if self.compaction.reserve_tokens >= self.compaction.default_context_window {
            issues.push(error(
                "compaction.reserve_tokens",
                "reserve_tokens must be smaller than the context window".into(),
            ));
        }
        if self.outbox.throttle_ms > 10_000 {
            issues.push(warn(
                "outbox.throttle_ms",
                format!(
                    "throttle of {}ms will make conversations feel unresponsive",
                    self.outbox.throttle_ms
                ),
            ));
        }
        if self.outbox.media_batch_max == 0 || self.outbox.media_batch_max > 10 {
            issues.push(error(
                "outbox.media_batch_max",
                "media batches must contain between 1 and 10 items".into(),
            ));
        }
        for (i, b) in self.inbound.bindings.iter().enumerate() {
            if b.channel.is_empty() {
                issues.push(error(
                    &format!("inbound.bindings[{i}].channel"),
                    "binding channel must not be empty".into(),
                ));
            }
            if let Some(mode) = &b.queue_mode {
                if crate::request::QueueMode::parse(mode).is_none() {
                    issues.push(error(
                        &format!("inbound.bindings[{i}].queue_mode"),
                        format!("unknown queue mode \"{mode}\""),
                    ));
                }
            }
        }
        issues
    }

    /// Resolve the context window for an engine: explicit override, then
    /// the engine's own report, then the configured default.
    pub fn context_window_for(&self, engine_id: &str, engine_window: Option<u64>) -> u64 {
        self.compaction
            .context_windows
            .get(engine_id)
            .copied()
            .or(engine_window)
            .unwrap_or(self.compaction.default_context_window)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3720
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_flush_secs() -> u64 {
    30
}
fn d_idle_timeout_ms() -> u64 {
    7_200_000
}
fn d_confirm_timeout_ms() -> u64 {
    300_000
}
fn d_cancel_grace_ms() -> u64 {
    1_000
}
fn d_followup_grace_ms() -> u64 {
    50
}
fn d_one() -> u32 {
    1
}
fn d_max_queue() -> usize {
    1_024
}
fn d_reserve_tokens() -> u64 {
    16_384
}
fn d_trigger_ratio() -> f64 {
    0.9
}
fn d_default_context_window() -> u64 {
    400_000
}
fn d_stream_timeout_ms() -> u64 {
    3_600_000
}
fn d_throttle_ms() -> u64 {
    400
}
fn d_dedupe_retention_secs() -> u64 {
    3_600
}
fn d_max_rate_limit_retries() -> u32 {
    5
}
fn d_max_transient_retries() -> u32 {
    3
}
fn d_transient_backoff_base_ms() -> u64 {
    500
}
fn d_min_rate_limit_delay_ms() -> u64 {
    1_000
}
fn d_media_batch_max() -> usize {
    10
}
fn d_media_send_delay_ms() -> u64 {
    1_000
}
fn d_dedupe_ttl_secs() -> u64 {
    600
}
fn d_true() -> bool {
    true
}
fn d_default_engine() -> String {
    "loopback".into()
}
