//! Bounded, owner-linked event streams.
//!
//! One stream carries the finite sequence of [`AgentEvent`]s for a single
//! run from its engine producer to the owning run process, plus any number
//! of tap subscribers. The queue is bounded with a configurable overflow
//! policy; overflow is reported to the caller, never silently absorbed
//! unless a drop policy was requested. The stream terminates when the
//! producer pushes a terminal event, calls [`EventStream::complete`], the
//! overall timeout expires, or the owner is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify};

use courier_domain::config::{DropStrategy, StreamConfig};
use courier_domain::event::AgentEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public result types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// Queue full under the `error` policy.
    Overflow,
    /// The stream already terminated.
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamResultError {
    Timeout,
    Canceled(String),
}

/// How the stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTerminal {
    /// Normal end; carries the producer's final messages.
    Done(Vec<Value>),
    Canceled(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub queue_size: usize,
    pub max_queue: usize,
    pub dropped: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Internals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StreamState {
    queue: VecDeque<AgentEvent>,
    dropped: u64,
    terminal: Option<StreamTerminal>,
    /// Whether the owner has already been handed the terminal (either a
    /// pushed terminal event or a synthesized `canceled`).
    terminal_delivered: bool,
}

struct Inner {
    max_queue: usize,
    drop_strategy: DropStrategy,
    state: Mutex<StreamState>,
    owner_notify: Notify,
    terminal_tx: watch::Sender<bool>,
    tap_tx: broadcast::Sender<AgentEvent>,
}

impl Inner {
    /// Transition to canceled unless already terminal. Used by the timeout
    /// guard and the owner-drop path.
    fn cancel(&self, reason: &str) {
        let mut st = self.state.lock();
        if st.terminal.is_some() {
            return;
        }
        st.terminal = Some(StreamTerminal::Canceled(reason.to_owned()));
        drop(st);
        let _ = self.terminal_tx.send(true);
        self.owner_notify.notify_one();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Producer / observer handle. Cheap to clone.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<Inner>,
}

/// The single consuming owner. Dropping it cancels the stream.
pub struct StreamOwner {
    inner: Arc<Inner>,
}

/// Create a stream. Must be called within a tokio runtime when
/// `config.timeout_ms > 0` (the overall-timeout guard is a spawned task).
pub fn event_stream(config: &StreamConfig) -> (EventStream, StreamOwner) {
    let (terminal_tx, _) = watch::channel(false);
    let (tap_tx, _) = broadcast::channel(config.max_queue.max(1));
    let inner = Arc::new(Inner {
        max_queue: config.max_queue.max(1),
        drop_strategy: config.drop_strategy,
        state: Mutex::new(StreamState {
            queue: VecDeque::new(),
            dropped: 0,
            terminal: None,
            terminal_delivered: false,
        }),
        owner_notify: Notify::new(),
        terminal_tx,
        tap_tx,
    });

    if config.timeout_ms > 0 {
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let timeout = Duration::from_millis(config.timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.cancel("timeout");
            }
        });
    }

    (
        EventStream {
            inner: inner.clone(),
        },
        StreamOwner { inner },
    )
}

impl EventStream {
    /// Enqueue an event. On overflow, applies the configured policy. Any
    /// push after the terminal returns `Canceled`.
    pub fn push(&self, event: AgentEvent) -> Result<(), PushError> {
        let terminal = event.is_terminal().then(|| match &event {
            AgentEvent::Completed { .. } => StreamTerminal::Done(Vec::new()),
            AgentEvent::Error { reason, .. } => StreamTerminal::Canceled(reason.clone()),
            AgentEvent::Canceled { reason } => StreamTerminal::Canceled(reason.clone()),
            _ => unreachable!(),
        });

        let mut st = self.inner.state.lock();
        if st.terminal.is_some() {
            return Err(PushError::Canceled);
        }

        if st.queue.len() >= self.inner.max_queue {
            match self.inner.drop_strategy {
                DropStrategy::Error => return Err(PushError::Overflow),
                DropStrategy::DropOldest => {
                    st.queue.pop_front();
                    st.dropped += 1;
                }
                DropStrategy::DropNewest => {
                    st.dropped += 1;
                    return Ok(());
                }
            }
        }

        let _ = self.inner.tap_tx.send(event.clone());
        st.queue.push_back(event);
        if let Some(t) = terminal {
            st.terminal = Some(t);
            st.terminal_delivered = true; // the pushed event itself is the delivery
        }
        let is_terminal = st.terminal.is_some();
        drop(st);

        if is_terminal {
            let _ = self.inner.terminal_tx.send(true);
        }
        self.inner.owner_notify.notify_one();
        Ok(())
    }

    /// Fire-and-forget push: same policy, result discarded (logged).
    pub fn push_lossy(&self, event: AgentEvent) {
        if let Err(err) = self.push(event) {
            tracing::debug!(?err, "lossy push discarded");
        }
    }

    /// Signal normal end with the producer's final messages. Subsequent
    /// pushes return `Canceled`.
    pub fn complete(&self, final_messages: Vec<Value>) {
        let mut st = self.inner.state.lock();
        if st.terminal.is_some() {
            return;
        }
        st.terminal = Some(StreamTerminal::Done(final_messages));
        st.terminal_delivered = true;
        drop(st);
        let _ = self.inner.terminal_tx.send(true);
        self.inner.owner_notify.notify_one();
    }

    /// Tap the stream: yields every event from now on, until terminal.
    pub fn subscribe(&self) -> StreamSubscription {
        StreamSubscription {
            rx: self.inner.tap_tx.subscribe(),
            terminal_rx: self.inner.terminal_tx.subscribe(),
        }
    }

    /// Await the terminal, returning the final messages of a normal end.
    pub async fn result(&self, timeout: Duration) -> Result<Vec<Value>, StreamResultError> {
        let mut terminal_rx = self.inner.terminal_tx.subscribe();
        let wait = async {
            while !*terminal_rx.borrow() {
                if terminal_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            return Err(StreamResultError::Timeout);
        }
        match self.inner.state.lock().terminal.clone() {
            Some(StreamTerminal::Done(msgs)) => Ok(msgs),
            Some(StreamTerminal::Canceled(reason)) => Err(StreamResultError::Canceled(reason)),
            None => Err(StreamResultError::Canceled("stream vanished".into())),
        }
    }

    pub fn stats(&self) -> StreamStats {
        let st = self.inner.state.lock();
        StreamStats {
            queue_size: st.queue.len(),
            max_queue: self.inner.max_queue,
            dropped: st.dropped,
        }
    }

    pub fn terminal(&self) -> Option<StreamTerminal> {
        self.inner.state.lock().terminal.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminal().is_some()
    }
}

impl StreamOwner {
    /// Pop the next event, waiting if none is queued.
    ///
    /// Returns `None` once the stream is drained and terminal. A stream
    /// canceled without a pushed terminal event yields one synthesized
    /// `canceled` event first.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        loop {
            {
                let mut guard = self.inner.state.lock();
                let st = &mut *guard;
                if let Some(event) = st.queue.pop_front() {
                    return Some(event);
                }
                if let Some(terminal) = &st.terminal {
                    if !st.terminal_delivered {
                        st.terminal_delivered = true;
                        if let StreamTerminal::Canceled(reason) = terminal {
                            return Some(AgentEvent::Canceled {
                                reason: reason.clone(),
                            });
                        }
                    }
                    return None;
                }
            }
            self.inner.owner_notify.notified().await;
        }
    }

    pub fn stream(&self) -> EventStream {
        EventStream {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for StreamOwner {
    fn drop(&mut self) {
        self.inner.cancel("owner_dropped");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tap on the stream. Each subscription receives every event pushed
/// after it was created.
pub struct StreamSubscription {
    rx: broadcast::Receiver<AgentEvent>,
    terminal_rx: watch::Receiver<bool>,
}

impl StreamSubscription {
    /// Next event, or `None` once the stream has terminated and the tap
    /// is drained.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "stream subscriber lagged");
                    continue;
                }
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
            if *self.terminal_rx.borrow() {
                // Drain anything that raced in, then stop.
                match self.rx.try_recv() {
                    Ok(event) => return Some(event),
                    _ => return None,
                }
            }
            tokio::select! {
                recv = self.rx.recv() => match recv {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "stream subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = self.terminal_rx.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_queue: usize, strategy: DropStrategy) -> StreamConfig {
        StreamConfig {
            max_queue,
            drop_strategy: strategy,
            timeout_ms: 0,
        }
    }

    fn delta(text: &str) -> AgentEvent {
        AgentEvent::MessageUpdate {
            msg: Value::Null,
            delta: Value::String(text.into()),
        }
    }

    #[tokio::test]
    async fn push_and_drain_in_order() {
        let (stream, mut owner) = event_stream(&config(8, DropStrategy::Error));
        stream.push(AgentEvent::AgentStart).unwrap();
        stream.push(delta("a")).unwrap();
        stream.complete(vec![]);

        assert!(matches!(owner.next().await, Some(AgentEvent::AgentStart)));
        assert!(matches!(
            owner.next().await,
            Some(AgentEvent::MessageUpdate { .. })
        ));
        assert!(owner.next().await.is_none());
    }

    #[tokio::test]
    async fn push_after_terminal_rejected() {
        let (stream, _owner) = event_stream(&config(8, DropStrategy::Error));
        stream.complete(vec![]);
        assert_eq!(
            stream.push(AgentEvent::AgentStart),
            Err(PushError::Canceled)
        );
    }

    #[tokio::test]
    async fn overflow_error_policy_rejects() {
        let (stream, _owner) = event_stream(&config(2, DropStrategy::Error));
        stream.push(delta("1")).unwrap();
        stream.push(delta("2")).unwrap();
        assert_eq!(stream.push(delta("3")), Err(PushError::Overflow));
        assert_eq!(stream.stats().dropped, 0);
    }

    #[tokio::test]
    async fn overflow_drop_oldest_evicts_head() {
        let (stream, mut owner) = event_stream(&config(2, DropStrategy::DropOldest));
        stream.push(delta("1")).unwrap();
        stream.push(delta("2")).unwrap();
        assert_eq!(stream.push(delta("3")), Ok(()));

        let stats = stream.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.queue_size, 2);

        // Head "1" is gone.
        match owner.next().await {
            Some(AgentEvent::MessageUpdate { delta, .. }) => {
                assert_eq!(delta.as_str(), Some("2"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_drop_newest_drops_incoming() {
        let (stream, mut owner) = event_stream(&config(1, DropStrategy::DropNewest));
        stream.push(delta("keep")).unwrap();
        assert_eq!(stream.push(delta("lost")), Ok(()));
        assert_eq!(stream.stats().dropped, 1);

        match owner.next().await {
            Some(AgentEvent::MessageUpdate { delta, .. }) => {
                assert_eq!(delta.as_str(), Some("keep"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_event_ends_stream() {
        let (stream, mut owner) = event_stream(&config(8, DropStrategy::Error));
        stream
            .push(AgentEvent::Canceled {
                reason: "user_requested".into(),
            })
            .unwrap();

        // The pushed terminal is delivered once, then None.
        assert!(matches!(
            owner.next().await,
            Some(AgentEvent::Canceled { .. })
        ));
        assert!(owner.next().await.is_none());
        assert_eq!(
            stream.terminal(),
            Some(StreamTerminal::Canceled("user_requested".into()))
        );
    }

    #[tokio::test]
    async fn owner_drop_cancels() {
        let (stream, owner) = event_stream(&config(8, DropStrategy::Error));
        drop(owner);
        assert_eq!(
            stream.terminal(),
            Some(StreamTerminal::Canceled("owner_dropped".into()))
        );
        assert_eq!(stream.push(delta("x")), Err(PushError::Canceled));
    }

    #[tokio::test]
    async fn result_returns_final_messages() {
        let (stream, _owner) = event_stream(&config(8, DropStrategy::Error));
        let waiter = stream.clone();
        let join = tokio::spawn(async move { waiter.result(Duration::from_secs(1)).await });

        stream.complete(vec![serde_json::json!({"role": "assistant", "content": "hi"})]);
        let msgs = join.await.unwrap().unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn result_times_out() {
        let (stream, _owner) = event_stream(&config(8, DropStrategy::Error));
        let err = stream.result(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, StreamResultError::Timeout);
    }

    #[tokio::test]
    async fn result_reports_cancellation() {
        let (stream, owner) = event_stream(&config(8, DropStrategy::Error));
        drop(owner);
        let err = stream.result(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, StreamResultError::Canceled("owner_dropped".into()));
    }

    #[tokio::test]
    async fn overall_timeout_cancels() {
        let cfg = StreamConfig {
            max_queue: 8,
            drop_strategy: DropStrategy::Error,
            timeout_ms: 30,
        };
        let (stream, mut owner) = event_stream(&cfg);
        // Owner sees a synthesized canceled{timeout} event, then None.
        match owner.next().await {
            Some(AgentEvent::Canceled { reason }) => assert_eq!(reason, "timeout"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(owner.next().await.is_none());
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn subscribers_each_see_every_event() {
        let (stream, _owner) = event_stream(&config(8, DropStrategy::Error));
        let mut sub1 = stream.subscribe();
        let mut sub2 = stream.subscribe();

        stream.push(AgentEvent::AgentStart).unwrap();
        stream.push(delta("x")).unwrap();
        stream.complete(vec![]);

        for sub in [&mut sub1, &mut sub2] {
            assert!(matches!(sub.next().await, Some(AgentEvent::AgentStart)));
            assert!(matches!(
                sub.next().await,
                Some(AgentEvent::MessageUpdate { .. })
            ));
            assert!(sub.next().await.is_none());
        }
    }

    #[tokio::test]
    async fn stats_shape() {
        let (stream, _owner) = event_stream(&config(4, DropStrategy::Error));
        stream.push(delta("a")).unwrap();
        let stats = stream.stats();
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.max_queue, 4);
        assert_eq!(stats.dropped, 0);
    }
}
