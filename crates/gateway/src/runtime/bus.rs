//! Run lifecycle pub-sub.
//!
//! Topic `run:<run_id>` carries `run_started` and `run_completed` so
//! callers can observe runs without owning the run process. Subscriber
//! mailboxes are bounded; a lagged receiver observes the gap instead of
//! blocking the publisher.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use courier_domain::event::{ResumeToken, Usage};
use courier_domain::request::Job;

const TOPIC_CAPACITY: usize = 128;

/// Lifecycle events published per run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunBusEvent {
    RunStarted {
        run_id: String,
        session_key: String,
        job: Job,
    },
    RunCompleted {
        run_id: String,
        ok: bool,
        answer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume: Option<ResumeToken>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        duration_ms: u64,
    },
}

impl RunBusEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. } | Self::RunCompleted { run_id, .. } => run_id,
        }
    }
}

/// Topic map with fan-out write. One broadcast channel per active run.
#[derive(Default)]
pub struct RunBus {
    topics: RwLock<HashMap<String, broadcast::Sender<RunBusEvent>>>,
}

impl RunBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `run:<run_id>`, creating the topic if needed.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunBusEvent> {
        let mut topics = self.topics.write();
        topics
            .entry(run_id.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publish to the event's topic. Events published with no topic (no
    /// subscriber ever asked) are dropped.
    pub fn publish(&self, event: RunBusEvent) {
        let topics = self.topics.read();
        if let Some(tx) = topics.get(event.run_id()) {
            let _ = tx.send(event);
        }
    }

    /// Drop the topic after the run has fully terminated.
    pub fn cleanup(&self, run_id: &str) {
        self.topics.write().remove(run_id);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_domain::request::{new_run_id, RunRequest};

    fn started(run_id: &str) -> RunBusEvent {
        RunBusEvent::RunStarted {
            run_id: run_id.to_owned(),
            session_key: "agent_main:default".into(),
            job: Job::admit(
                run_id.to_owned(),
                RunRequest::new("agent_main:default", "default", "hi"),
            ),
        }
    }

    #[tokio::test]
    async fn subscribe_then_publish() {
        let bus = RunBus::new();
        let run_id = new_run_id();
        let mut rx = bus.subscribe(&run_id);

        bus.publish(started(&run_id));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), run_id);
    }

    #[tokio::test]
    async fn publish_without_topic_is_dropped() {
        let bus = RunBus::new();
        bus.publish(started("r-nobody"));
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = RunBus::new();
        let run_id = new_run_id();
        let mut rx1 = bus.subscribe(&run_id);
        let mut rx2 = bus.subscribe(&run_id);

        bus.publish(started(&run_id));
        assert_eq!(rx1.recv().await.unwrap().run_id(), run_id);
        assert_eq!(rx2.recv().await.unwrap().run_id(), run_id);
    }

    #[tokio::test]
    async fn cleanup_removes_topic() {
        let bus = RunBus::new();
        let run_id = new_run_id();
        let _rx = bus.subscribe(&run_id);
        assert_eq!(bus.topic_count(), 1);
        bus.cleanup(&run_id);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn lagged_subscriber_observes_gap() {
        let bus = RunBus::new();
        let run_id = new_run_id();
        let mut rx = bus.subscribe(&run_id);

        for _ in 0..(TOPIC_CAPACITY + 10) {
            bus.publish(started(&run_id));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
