//! Gateway-owned session store.
//!
//! Persists durable per-session state under `<state>/sessions/`:
//! `sessions.json` holds resume tokens and last-run metadata keyed by
//! session key; `pending_compaction.json` holds compaction markers a
//! separate compactor consumes. Streams are ephemeral; only this
//! completed-run state survives a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use courier_domain::error::{Error, Result};
use courier_domain::event::ResumeToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single session tracked by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_key: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    /// Last known good checkpoint for the engine to resume from.
    #[serde(default)]
    pub resume_token: Option<ResumeToken>,
    #[serde(default)]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub last_completed_at_ms: Option<i64>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl SessionEntry {
    fn new(session_key: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            session_key: session_key.to_owned(),
            created_at_ms: now,
            updated_at_ms: now,
            resume_token: None,
            last_run_id: None,
            last_completed_at_ms: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending compaction markers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    /// The run failed on a context-overflow error; resume was reset.
    Overflow,
    /// A successful run reported usage close to the window.
    NearLimit,
    /// Requested explicitly via the control plane.
    Manual,
}

/// Marker consumed by the external compactor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCompaction {
    pub reason: CompactionReason,
    pub set_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u64>,
}

impl PendingCompaction {
    pub fn overflow() -> Self {
        Self {
            reason: CompactionReason::Overflow,
            set_at_ms: Utc::now().timestamp_millis(),
            input_tokens: None,
            threshold_tokens: None,
            context_window_tokens: None,
        }
    }

    pub fn near_limit(input_tokens: u64, threshold_tokens: u64, context_window_tokens: u64) -> Self {
        Self {
            reason: CompactionReason::NearLimit,
            set_at_ms: Utc::now().timestamp_millis(),
            input_tokens: Some(input_tokens),
            threshold_tokens: Some(threshold_tokens),
            context_window_tokens: Some(context_window_tokens),
        }
    }

    pub fn manual() -> Self {
        Self {
            reason: CompactionReason::Manual,
            set_at_ms: Utc::now().timestamp_millis(),
            input_tokens: None,
            threshold_tokens: None,
            context_window_tokens: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable session state backed by JSON files.
pub struct SessionStore {
    sessions_path: PathBuf,
    compaction_path: PathBuf,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    pending_compaction: RwLock<HashMap<String, PendingCompaction>>,
}

impl SessionStore {
    /// Load or create the store under `state_path/sessions/`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let sessions_path = dir.join("sessions.json");
        let compaction_path = dir.join("pending_compaction.json");

        let sessions: HashMap<String, SessionEntry> = load_json(&sessions_path)?;
        let pending_compaction: HashMap<String, PendingCompaction> = load_json(&compaction_path)?;

        tracing::info!(
            sessions = sessions.len(),
            pending_compaction = pending_compaction.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            compaction_path,
            sessions: RwLock::new(sessions),
            pending_compaction: RwLock::new(pending_compaction),
        })
    }

    /// Look up a session by its key.
    pub fn get(&self, session_key: &str) -> Option<SessionEntry> {
        self.sessions.read().get(session_key).cloned()
    }

    /// The stored resume token for a session, if any.
    pub fn resume_token(&self, session_key: &str) -> Option<ResumeToken> {
        self.sessions
            .read()
            .get(session_key)
            .and_then(|e| e.resume_token.clone())
    }

    /// Store a new resume checkpoint, creating the session entry if needed.
    pub fn set_resume(&self, session_key: &str, token: ResumeToken) {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_key.to_owned())
            .or_insert_with(|| SessionEntry::new(session_key));
        entry.resume_token = Some(token);
        entry.updated_at_ms = Utc::now().timestamp_millis();
    }

    /// Drop the resume checkpoint so the next run starts fresh.
    /// Returns true when a token was present.
    pub fn clear_resume(&self, session_key: &str) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_key) {
            Some(entry) => {
                let had = entry.resume_token.take().is_some();
                entry.updated_at_ms = Utc::now().timestamp_millis();
                had
            }
            None => false,
        }
    }

    /// Record the outcome of a run against its session.
    pub fn record_completion(
        &self,
        session_key: &str,
        run_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_key.to_owned())
            .or_insert_with(|| SessionEntry::new(session_key));
        let now = Utc::now().timestamp_millis();
        entry.last_run_id = Some(run_id.to_owned());
        entry.last_completed_at_ms = Some(now);
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.updated_at_ms = now;
    }

    // ── Pending compaction ───────────────────────────────────────────

    pub fn set_pending_compaction(&self, session_key: &str, marker: PendingCompaction) {
        tracing::info!(
            session_key,
            reason = ?marker.reason,
            "pending compaction marker set"
        );
        self.pending_compaction
            .write()
            .insert(session_key.to_owned(), marker);
    }

    pub fn pending_compaction(&self, session_key: &str) -> Option<PendingCompaction> {
        self.pending_compaction.read().get(session_key).cloned()
    }

    /// Remove and return a marker (the compactor's consume step).
    pub fn take_pending_compaction(&self, session_key: &str) -> Option<PendingCompaction> {
        self.pending_compaction.write().remove(session_key)
    }

    /// List all session entries.
    pub fn list(&self) -> Vec<SessionEntry> {
        self.sessions.read().values().cloned().collect()
    }

    /// Persist the current state to disk.
    pub fn flush(&self) -> Result<()> {
        write_json(&self.sessions_path, &*self.sessions.read())?;
        write_json(&self.compaction_path, &*self.pending_compaction.read())?;
        Ok(())
    }
}

fn load_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(Error::Json)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(Error::Io)?;
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}
