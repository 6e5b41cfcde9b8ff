//! Run submissions — the immutable [`RunRequest`] a caller hands to the
//! orchestrator and the admitted [`Job`] a run process owns.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What to do when the target session already has an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Reject with busy; the caller may persist a post-run follow-up.
    #[default]
    Collect,
    /// Forward the prompt as a mid-run steering message.
    Steer,
    /// Enqueue as a follow-up processed after the current run ends.
    Followup,
    /// Abort the current run and admit the new one.
    Interrupt,
}

impl QueueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collect" => Some(Self::Collect),
            "steer" => Some(Self::Steer),
            "followup" => Some(Self::Followup),
            "interrupt" => Some(Self::Interrupt),
            _ => None,
        }
    }
}

/// Where a submission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunOrigin {
    #[default]
    Channel,
    Control,
    Cron,
    Retry,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque submission metadata: retry counters, tags, reply-to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMeta {
    #[serde(default)]
    pub zero_answer_retry_attempt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

/// Immutable submission record accepted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub origin: RunOrigin,
    pub session_key: String,
    pub agent_id: String,
    pub prompt: String,
    #[serde(default)]
    pub queue_mode: QueueMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_policy: Option<Value>,
    #[serde(default)]
    pub meta: RunMeta,
}

impl RunRequest {
    pub fn new(session_key: &str, agent_id: &str, prompt: &str) -> Self {
        Self {
            origin: RunOrigin::default(),
            session_key: session_key.to_owned(),
            agent_id: agent_id.to_owned(),
            prompt: prompt.to_owned(),
            queue_mode: QueueMode::default(),
            engine_id: None,
            cwd: None,
            tool_policy: None,
            meta: RunMeta::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A run request after admission: carries the assigned run id and the
/// admission timestamp. Owned by exactly one run process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub run_id: String,
    pub started_at_ms: i64,
    pub request: RunRequest,
}

impl Job {
    pub fn admit(run_id: String, request: RunRequest) -> Self {
        Self {
            run_id,
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            request,
        }
    }
}

/// Generate a globally unique, lexicographically sortable run id:
/// zero-padded hex microsecond timestamp plus a random suffix.
pub fn new_run_id() -> String {
    let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("r{micros:016x}{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_mode_parse() {
        assert_eq!(QueueMode::parse("steer"), Some(QueueMode::Steer));
        assert_eq!(QueueMode::parse("interrupt"), Some(QueueMode::Interrupt));
        assert_eq!(QueueMode::parse("bogus"), None);
        assert_eq!(QueueMode::default(), QueueMode::Collect);
    }

    #[test]
    fn run_ids_sort_by_creation_time() {
        let a = new_run_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_run_id();
        assert!(a < b, "{a} should sort before {b}");
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn run_ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..100).map(|_| new_run_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn request_defaults() {
        let req = RunRequest::new("agent_main:default", "default", "hello");
        assert_eq!(req.queue_mode, QueueMode::Collect);
        assert_eq!(req.meta.zero_answer_retry_attempt, 0);
        assert!(req.engine_id.is_none());
    }

    #[test]
    fn job_admission_stamps_time() {
        let req = RunRequest::new("agent_main:default", "default", "hello");
        let job = Job::admit(new_run_id(), req);
        assert!(job.started_at_ms > 0);
    }

    #[test]
    fn request_round_trips_json() {
        let mut req = RunRequest::new("channel_peer:tg:acc:dm:42", "default", "hi");
        req.queue_mode = QueueMode::Followup;
        req.meta.zero_answer_retry_attempt = 1;
        let s = serde_json::to_string(&req).unwrap();
        let back: RunRequest = serde_json::from_str(&s).unwrap();
        assert_eq!(back.queue_mode, QueueMode::Followup);
        assert_eq!(back.meta.zero_answer_retry_attempt, 1);
    }
}
