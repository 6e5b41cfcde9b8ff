//! Run records — durable execution history for every admitted run.
//!
//! Each admitted run gets a `RunRecord` tracked in a bounded in-memory
//! ring with an O(1) id index, appended to a JSONL file on completion.
//! This is the only run state that survives a restart; in-flight event
//! streams are ephemeral.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use courier_domain::event::Usage;
use courier_domain::request::Job;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub session_key: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_id: Option<String>,
    pub status: RunStatus,
    pub started_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// First ~200 chars of the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_preview: Option<String>,
    /// First ~200 chars of the final answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Which zero-answer retry this run is (0 = original submission).
    #[serde(default)]
    pub retry_attempt: u32,
}

impl RunRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            run_id: job.run_id.clone(),
            session_key: job.request.session_key.clone(),
            agent_id: job.request.agent_id.clone(),
            engine_id: job.request.engine_id.clone(),
            status: RunStatus::Queued,
            started_at_ms: job.started_at_ms,
            ended_at_ms: None,
            duration_ms: None,
            prompt_preview: Some(super::truncate_str(&job.request.prompt, 200)),
            answer_preview: None,
            error: None,
            usage: None,
            retry_attempt: job.request.meta.zero_answer_retry_attempt,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now().timestamp_millis();
        self.status = status;
        self.ended_at_ms = Some(now);
        self.duration_ms = Some((now - self.started_at_ms).max(0) as u64);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_RUNS_IN_MEMORY: usize = 2000;

pub struct RunStore {
    inner: RwLock<RunStoreInner>,
    log_path: PathBuf,
}

/// Ring of recent runs plus an id → logical-sequence index. `base_seq`
/// tracks how many entries were popped from the front so index values
/// never need bulk adjustment.
struct RunStoreInner {
    runs: VecDeque<RunRecord>,
    index: HashMap<String, usize>,
    base_seq: usize,
}

impl RunStoreInner {
    fn new(runs: VecDeque<RunRecord>) -> Self {
        let mut index = HashMap::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            index.insert(run.run_id.clone(), i);
        }
        Self {
            runs,
            index,
            base_seq: 0,
        }
    }

    fn get(&self, run_id: &str) -> Option<&RunRecord> {
        let seq = *self.index.get(run_id)?;
        self.runs.get(seq - self.base_seq)
    }

    fn get_mut(&mut self, run_id: &str) -> Option<&mut RunRecord> {
        let seq = *self.index.get(run_id)?;
        let idx = seq - self.base_seq;
        self.runs.get_mut(idx)
    }

    fn push_back(&mut self, run: RunRecord) {
        let seq = self.base_seq + self.runs.len();
        self.index.insert(run.run_id.clone(), seq);
        self.runs.push_back(run);
    }

    fn pop_front(&mut self) {
        if let Some(run) = self.runs.pop_front() {
            self.index.remove(&run.run_id);
            self.base_seq += 1;
        }
    }
}

impl RunStore {
    /// Create a store, loading recent runs from `<state>/runs/runs.jsonl`.
    pub fn new(state_path: &Path) -> Self {
        let dir = state_path.join("runs");
        std::fs::create_dir_all(&dir).ok();

        let log_path = dir.join("runs.jsonl");
        let (runs, total_on_disk) = Self::load_recent(&log_path);

        if total_on_disk > runs.len() {
            tracing::info!(
                kept = runs.len(),
                pruned = total_on_disk - runs.len(),
                "pruning runs JSONL on disk"
            );
            Self::rewrite_jsonl(&log_path, &runs);
        }

        Self {
            inner: RwLock::new(RunStoreInner::new(runs)),
            log_path,
        }
    }

    fn load_recent(path: &Path) -> (VecDeque<RunRecord>, usize) {
        let mut runs = VecDeque::new();
        let mut total = 0;
        if let Ok(content) = std::fs::read_to_string(path) {
            let lines: Vec<&str> = content.lines().collect();
            total = lines.len();
            for line in lines.iter().rev().take(MAX_RUNS_IN_MEMORY) {
                if let Ok(run) = serde_json::from_str::<RunRecord>(line) {
                    runs.push_front(run);
                }
            }
        }
        (runs, total)
    }

    fn rewrite_jsonl(path: &Path, runs: &VecDeque<RunRecord>) {
        let tmp = path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for run in runs {
                if let Ok(json) = serde_json::to_string(run) {
                    if writeln!(f, "{json}").is_err() {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }

    pub fn insert(&self, run: RunRecord) {
        let mut inner = self.inner.write();
        inner.push_back(run);
        if inner.runs.len() > MAX_RUNS_IN_MEMORY {
            inner.pop_front();
        }
    }

    /// Update a run in place (O(1) via the index). Returns true if found.
    pub fn update<F>(&self, run_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut inner = self.inner.write();
        if let Some(run) = inner.get_mut(run_id) {
            f(run);
            return true;
        }
        false
    }

    /// Append a run to the JSONL log.
    pub fn persist(&self, run: &RunRecord) {
        if let Ok(json) = serde_json::to_string(run) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                let _ = writeln!(file, "{json}");
            }
        }
    }

    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.inner.read().get(run_id).cloned()
    }

    /// List runs newest-first with optional filters and pagination.
    /// Returns `(page, total_matching)`.
    pub fn list(
        &self,
        status: Option<RunStatus>,
        session_key: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> (Vec<RunRecord>, usize) {
        let inner = self.inner.read();
        let matches = |r: &&RunRecord| -> bool {
            if let Some(s) = status {
                if r.status != s {
                    return false;
                }
            }
            if let Some(sk) = session_key {
                if r.session_key != sk {
                    return false;
                }
            }
            true
        };

        let total = inner.runs.iter().rev().filter(matches).count();
        let page: Vec<RunRecord> = inner
            .runs
            .iter()
            .rev()
            .filter(matches)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    pub fn status_counts(&self) -> HashMap<&'static str, usize> {
        let inner = self.inner.read();
        let mut counts = HashMap::new();
        for run in inner.runs.iter() {
            *counts.entry(run.status.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_domain::request::{new_run_id, RunRequest};

    fn job(session_key: &str, prompt: &str) -> Job {
        Job::admit(new_run_id(), RunRequest::new(session_key, "default", prompt))
    }

    #[test]
    fn record_lifecycle() {
        let mut record = RunRecord::from_job(&job("sk", "hello world"));
        assert_eq!(record.status, RunStatus::Queued);
        assert_eq!(record.prompt_preview.as_deref(), Some("hello world"));

        record.status = RunStatus::Running;
        record.finish(RunStatus::Completed);
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.ended_at_ms.is_some());
        assert!(record.duration_ms.is_some());
    }

    #[test]
    fn insert_get_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        let record = RunRecord::from_job(&job("sk1", "msg"));
        let run_id = record.run_id.clone();
        store.insert(record);

        assert!(store.get(&run_id).is_some());
        assert!(store.update(&run_id, |r| r.status = RunStatus::Running));
        assert_eq!(store.get(&run_id).unwrap().status, RunStatus::Running);

        assert!(!store.update("r-missing", |_| {}));
        assert!(store.get("r-missing").is_none());
    }

    #[test]
    fn list_filters_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        for i in 0..5 {
            let mut record = RunRecord::from_job(&job(
                if i % 2 == 0 { "alpha" } else { "beta" },
                &format!("msg{i}"),
            ));
            if i == 4 {
                record.status = RunStatus::Failed;
            }
            store.insert(record);
        }

        let (alpha, total) = store.list(None, Some("alpha"), 10, 0);
        assert_eq!(total, 3);
        assert!(alpha.iter().all(|r| r.session_key == "alpha"));

        let (failed, _) = store.list(Some(RunStatus::Failed), None, 10, 0);
        assert_eq!(failed.len(), 1);

        let (page1, total) = store.list(None, None, 2, 0);
        let (page2, _) = store.list(None, None, 2, 2);
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_ne!(page1[0].run_id, page2[0].run_id);
    }

    #[test]
    fn persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let run_id;
        {
            let store = RunStore::new(dir.path());
            let mut record = RunRecord::from_job(&job("sk", "msg"));
            record.finish(RunStatus::Completed);
            run_id = record.run_id.clone();
            store.insert(record.clone());
            store.persist(&record);
        }

        let store = RunStore::new(dir.path());
        let loaded = store.get(&run_id).unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.session_key, "sk");
    }

    #[test]
    fn ring_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        for i in 0..(MAX_RUNS_IN_MEMORY + 25) {
            store.insert(RunRecord::from_job(&job("sk", &format!("m{i}"))));
        }
        let (_, total) = store.list(None, None, 1, 0);
        assert_eq!(total, MAX_RUNS_IN_MEMORY);
    }

    #[test]
    fn index_survives_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        let mut last_id = String::new();
        for i in 0..(MAX_RUNS_IN_MEMORY + 5) {
            let record = RunRecord::from_job(&job("sk", &format!("m{i}")));
            last_id = record.run_id.clone();
            store.insert(record);
        }
        // Most recent record still reachable through the index after the
        // front of the ring was evicted.
        assert!(store.get(&last_id).is_some());
        assert!(store.update(&last_id, |r| r.status = RunStatus::Running));
    }

    #[test]
    fn status_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        let mut a = RunRecord::from_job(&job("sk", "a"));
        a.status = RunStatus::Completed;
        store.insert(a);
        let mut b = RunRecord::from_job(&job("sk", "b"));
        b.status = RunStatus::Completed;
        store.insert(b);
        let mut c = RunRecord::from_job(&job("sk", "c"));
        c.status = RunStatus::Failed;
        store.insert(c);

        let counts = store.status_counts();
        assert_eq!(counts.get("completed"), Some(&2));
        assert_eq!(counts.get("failed"), Some(&1));
    }
}
