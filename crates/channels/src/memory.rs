//! In-memory channel adapter.
//!
//! Records every delivered payload and can be scripted to fail upcoming
//! deliveries, which is how the outbox retry paths are exercised. Also
//! serves as the `loopback` channel for local runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use courier_domain::payload::OutboundPayload;

use crate::{AdapterMeta, Capabilities, ChannelAdapter, DeliverError, ProviderResult};

pub struct MemoryAdapter {
    id: String,
    capabilities: Capabilities,
    sent: Mutex<Vec<OutboundPayload>>,
    scripted_failures: Mutex<VecDeque<DeliverError>>,
    next_message_id: AtomicU64,
}

impl MemoryAdapter {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            capabilities: Capabilities {
                edit_support: true,
                chunk_limit: 4_000,
                media_groups: true,
                inline_buttons: true,
            },
            sent: Mutex::new(Vec::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Script the next delivery attempt to fail with `err`. Calls queue up:
    /// each failure consumes one attempt.
    pub fn fail_next(&self, err: DeliverError) {
        self.scripted_failures.lock().push_back(err);
    }

    /// Everything successfully delivered so far, in order.
    pub fn sent(&self) -> Vec<OutboundPayload> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl ChannelAdapter for MemoryAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> AdapterMeta {
        AdapterMeta {
            name: format!("memory:{}", self.id),
            capabilities: self.capabilities,
        }
    }

    async fn deliver(&self, payload: &OutboundPayload) -> Result<ProviderResult, DeliverError> {
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }

        self.sent.lock().push(payload.clone());
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        Ok(ProviderResult::with_message_id(&id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_domain::payload::{OutboundContent, PeerKind, PeerRef};

    fn payload(text: &str) -> OutboundPayload {
        OutboundPayload::text(
            "loopback",
            "acc",
            PeerRef {
                kind: PeerKind::Dm,
                id: "42".into(),
                thread_id: None,
            },
            text,
        )
    }

    #[tokio::test]
    async fn records_deliveries_in_order() {
        let adapter = MemoryAdapter::new("loopback");
        adapter.deliver(&payload("one")).await.unwrap();
        adapter.deliver(&payload("two")).await.unwrap();

        let sent = adapter.sent();
        assert_eq!(sent.len(), 2);
        match &sent[0].content {
            OutboundContent::Text { text } => assert_eq!(text, "one"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn assigns_increasing_message_ids() {
        let adapter = MemoryAdapter::new("loopback");
        let a = adapter.deliver(&payload("a")).await.unwrap();
        let b = adapter.deliver(&payload("b")).await.unwrap();
        assert_eq!(a.message_id.as_deref(), Some("1"));
        assert_eq!(b.message_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn scripted_failures_consume_in_order() {
        let adapter = MemoryAdapter::new("loopback");
        adapter.fail_next(DeliverError::rate_limited(2_000));
        adapter.fail_next(DeliverError::http(500, "boom"));

        let first = adapter.deliver(&payload("x")).await.unwrap_err();
        assert_eq!(first.status, Some(429));
        assert_eq!(first.retry_after_ms, Some(2_000));

        let second = adapter.deliver(&payload("x")).await.unwrap_err();
        assert_eq!(second.status, Some(500));

        // Third attempt succeeds and is recorded.
        adapter.deliver(&payload("x")).await.unwrap();
        assert_eq!(adapter.sent().len(), 1);
    }
}
