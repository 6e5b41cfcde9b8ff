//! Per-peer outbound delivery queues.
//!
//! One worker task exists per `(channel, peer)`; workers are independent
//! and drain concurrently, one in-flight provider call each. Within a
//! worker, operations drain in priority order (delete, then edit, then
//! send), FIFO within a band, at most one op per throttle window.
//!
//! Coalescing: an enqueue whose key is already queued replaces the queued
//! payload in place; a delete drops any queued edit for the same message.
//! Retries: 429 honors the provider hint (floored), 5xx/timeouts back off
//! exponentially, other 4xx drop immediately. A payload carrying an
//! idempotency key is delivered at most once per retention window.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use courier_channels::{AdapterRegistry, ChannelAdapter, DeliverError, FailureClass, ProviderResult};
use courier_domain::config::OutboxConfig;
use courier_domain::error::{Error, Result};
use courier_domain::payload::{OutboundContent, OutboundPayload, PeerQueueKey, Priority};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Notifications
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal-resolution notice sent to the enqueuer, when requested.
#[derive(Debug, Clone)]
pub struct OutboxNotice {
    pub tag: String,
    pub reference: u64,
    pub result: std::result::Result<ProviderResult, String>,
}

/// Where to send the terminal notice for an enqueued op.
#[derive(Debug, Clone)]
pub struct OutboxNotify {
    pub tag: String,
    pub reference: u64,
    pub tx: mpsc::UnboundedSender<OutboxNotice>,
}

impl OutboxNotify {
    fn dispatch(&self, result: std::result::Result<ProviderResult, String>) {
        let _ = self.tx.send(OutboxNotice {
            tag: self.tag.clone(),
            reference: self.reference,
            result,
        });
    }
}

/// Result of an enqueue call.
#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued { reference: u64 },
    /// The idempotency key was already seen within the retention window.
    Duplicate { original_reference: u64 },
}

impl EnqueueOutcome {
    pub fn reference(&self) -> u64 {
        match self {
            Self::Queued { reference } => *reference,
            Self::Duplicate {
                original_reference,
            } => *original_reference,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Idempotency store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct IdemEntry {
    reference: u64,
    inserted_at: Instant,
}

/// Dedupe table keyed by a digest of `(channel, account, peer, idem_key)`.
/// A record is created on first enqueue, retained on terminal success for
/// the retention window, and released on terminal failure so the caller
/// may retry.
pub struct IdempotencyStore {
    retention: Duration,
    entries: Mutex<HashMap<String, IdemEntry>>,
}

impl IdempotencyStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a new key. Returns the prior reference when the key is
    /// already live within the retention window.
    pub fn begin(&self, digest: &str, reference: u64) -> Option<u64> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        // Lazy cleanup once the map grows large.
        if entries.len() > 10_000 {
            let retention = self.retention;
            entries.retain(|_, e| now.duration_since(e.inserted_at) < retention);
        }

        if let Some(entry) = entries.get(digest) {
            if now.duration_since(entry.inserted_at) < self.retention {
                return Some(entry.reference);
            }
        }
        entries.insert(
            digest.to_owned(),
            IdemEntry {
                reference,
                inserted_at: now,
            },
        );
        None
    }

    /// Terminal failure: forget the key so a caller retry can go through.
    pub fn release(&self, digest: &str) {
        self.entries.lock().remove(digest);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Op keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Coalescing key for edits of one message.
pub fn edit_key(peer_id: &str, message_id: &str) -> String {
    format!("edit:{peer_id}:{message_id}")
}

/// Coalescing key for a message delete.
pub fn delete_key(peer_id: &str, message_id: &str) -> String {
    format!("delete:{peer_id}:{message_id}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Entry {
    id: u64,
    key: String,
    priority: Priority,
    payload: OutboundPayload,
    notifies: Vec<OutboxNotify>,
    idem_digest: Option<String>,
}

enum PeerCommand {
    Enqueue(Box<Entry>),
}

/// Indexed priority bands: `order` holds entry ids (possibly stale after
/// supersession), `entries` the live ops, `by_key` the O(1) coalescing
/// index. Popping skips tombstoned ids.
#[derive(Default)]
struct QueueState {
    entries: HashMap<u64, Entry>,
    order: [VecDeque<u64>; 3],
    by_key: HashMap<String, u64>,
}

impl QueueState {
    fn apply(&mut self, command: PeerCommand) {
        let PeerCommand::Enqueue(entry) = command;
        let mut entry = *entry;

        // A delete supersedes any queued edit of the same message.
        if let OutboundContent::Delete { message_id } = &entry.payload.content {
            let edit = edit_key(&entry.payload.peer.id, message_id);
            if let Some(id) = self.by_key.remove(&edit) {
                if let Some(dropped) = self.entries.remove(&id) {
                    for notify in &dropped.notifies {
                        notify.dispatch(Err("superseded_by_delete".into()));
                    }
                }
            }
        }

        // Same key already queued and not yet sent: replace in place.
        if let Some(&existing) = self.by_key.get(&entry.key) {
            if let Some(queued) = self.entries.get_mut(&existing) {
                queued.payload = entry.payload;
                queued.notifies.append(&mut entry.notifies);
                return;
            }
        }

        let id = entry.id;
        self.order[entry.priority.index()].push_back(id);
        self.by_key.insert(entry.key.clone(), id);
        self.entries.insert(id, entry);
    }

    fn pop_head(&mut self) -> Option<Entry> {
        for band in self.order.iter_mut() {
            while let Some(id) = band.pop_front() {
                if let Some(entry) = self.entries.remove(&id) {
                    self.by_key.remove(&entry.key);
                    return Some(entry);
                }
                // Tombstone left by supersession; skip.
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Outbox {
    adapters: Arc<AdapterRegistry>,
    idempotency: Arc<IdempotencyStore>,
    config: OutboxConfig,
    peers: Mutex<HashMap<PeerQueueKey, mpsc::UnboundedSender<PeerCommand>>>,
    next_reference: AtomicU64,
    shutdown: CancellationToken,
}

impl Outbox {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        config: OutboxConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let idempotency = Arc::new(IdempotencyStore::new(Duration::from_secs(
            config.dedupe_retention_secs,
        )));
        Self {
            adapters,
            idempotency,
            config,
            peers: Mutex::new(HashMap::new()),
            next_reference: AtomicU64::new(1),
            shutdown,
        }
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Enqueue one op for its peer queue.
    ///
    /// `key` controls coalescing; `None` means the op never coalesces.
    /// `idem_digest` is the hashed dedupe key; a live hit short-circuits
    /// with `Duplicate` and no adapter call.
    pub fn enqueue(
        &self,
        key: Option<String>,
        payload: OutboundPayload,
        idem_digest: Option<String>,
        notify: Option<OutboxNotify>,
    ) -> Result<EnqueueOutcome> {
        let adapter = self
            .adapters
            .get(&payload.channel_id)
            .ok_or_else(|| Error::UnknownChannel(payload.channel_id.clone()))?;

        let reference = self.next_reference.fetch_add(1, Ordering::Relaxed);
        if let Some(digest) = &idem_digest {
            if let Some(original_reference) = self.idempotency.begin(digest, reference) {
                tracing::debug!(
                    channel = %payload.channel_id,
                    peer = %payload.peer.id,
                    "duplicate outbound enqueue suppressed"
                );
                return Ok(EnqueueOutcome::Duplicate { original_reference });
            }
        }

        let entry = Entry {
            id: reference,
            key: key.unwrap_or_else(|| format!("send:{reference}")),
            priority: payload.content.priority(),
            payload,
            notifies: notify.into_iter().collect(),
            idem_digest,
        };

        self.send_to_peer(adapter, PeerCommand::Enqueue(Box::new(entry)));
        Ok(EnqueueOutcome::Queued { reference })
    }

    fn send_to_peer(&self, adapter: Arc<dyn ChannelAdapter>, command: PeerCommand) {
        let PeerCommand::Enqueue(ref entry) = command;
        let peer_key = entry.payload.peer_queue_key();

        let mut peers = self.peers.lock();
        let tx = peers
            .entry(peer_key.clone())
            .or_insert_with(|| self.spawn_peer_worker(peer_key.clone(), adapter.clone()))
            .clone();
        if let Err(mpsc::error::SendError(command)) = tx.send(command) {
            // Worker exited (shutdown race); respawn once and requeue.
            let tx = self.spawn_peer_worker(peer_key.clone(), adapter);
            let _ = tx.send(command);
            peers.insert(peer_key, tx);
        }
    }

    fn spawn_peer_worker(
        &self,
        peer_key: PeerQueueKey,
        adapter: Arc<dyn ChannelAdapter>,
    ) -> mpsc::UnboundedSender<PeerCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let idempotency = self.idempotency.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_peer_worker(peer_key, rx, adapter, idempotency, config, shutdown).await;
        });
        tx
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_peer_worker(
    peer_key: PeerQueueKey,
    mut rx: mpsc::UnboundedReceiver<PeerCommand>,
    adapter: Arc<dyn ChannelAdapter>,
    idempotency: Arc<IdempotencyStore>,
    config: OutboxConfig,
    shutdown: CancellationToken,
) {
    tracing::debug!(peer = %peer_key, "outbox worker started");
    let mut state = QueueState::default();
    let mut next_allowed = Instant::now();

    loop {
        // Absorb everything already enqueued before deciding what to do.
        while let Ok(command) = rx.try_recv() {
            state.apply(command);
        }

        if state.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(c) => {
                        state.apply(c);
                        continue;
                    }
                    None => break,
                },
            }
        }

        // Throttle: keep absorbing commands while we wait so late edits
        // still coalesce.
        let now = Instant::now();
        if next_allowed > now {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next_allowed) => {}
                command = rx.recv() => {
                    if let Some(c) = command {
                        state.apply(c);
                    }
                }
            }
            continue;
        }

        let Some(entry) = state.pop_head() else {
            continue;
        };

        let outcome = deliver_with_retries(adapter.as_ref(), &entry.payload, &config).await;
        match outcome {
            Ok(result) => {
                for notify in &entry.notifies {
                    notify.dispatch(Ok(result.clone()));
                }
            }
            Err(reason) => {
                tracing::warn!(peer = %peer_key, %reason, "outbound op dropped");
                if let Some(digest) = &entry.idem_digest {
                    idempotency.release(digest);
                }
                for notify in &entry.notifies {
                    notify.dispatch(Err(reason.clone()));
                }
            }
        }

        if config.throttle_ms > 0 {
            next_allowed = Instant::now() + Duration::from_millis(config.throttle_ms);
        }
    }
    tracing::debug!(peer = %peer_key, "outbox worker stopped");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery + retry classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum RetryClass {
    RateLimited,
    Transient,
    Permanent,
}

fn classify(err: &DeliverError) -> RetryClass {
    match err.class {
        FailureClass::Timeout | FailureClass::ConnectionReset | FailureClass::ConnectionClosed => {
            RetryClass::Transient
        }
        FailureClass::Schema => RetryClass::Permanent,
        FailureClass::Http => match err.status {
            Some(429) => RetryClass::RateLimited,
            Some(s) if s >= 500 => RetryClass::Transient,
            _ => RetryClass::Permanent,
        },
    }
}

/// A failed delete for a message the provider no longer knows is as good
/// as a successful delete.
fn is_idempotent_delete_ok(payload: &OutboundPayload, err: &DeliverError) -> bool {
    matches!(payload.content, OutboundContent::Delete { .. })
        && err.status == Some(400)
        && err
            .description
            .to_lowercase()
            .contains("message to delete not found")
}

async fn deliver_with_retries(
    adapter: &dyn ChannelAdapter,
    payload: &OutboundPayload,
    config: &OutboxConfig,
) -> std::result::Result<ProviderResult, String> {
    let mut rate_limit_attempts: u32 = 0;
    let mut transient_attempts: u32 = 0;

    loop {
        match deliver_once(adapter, payload, config).await {
            Ok(result) => return Ok(result),
            Err(err) if is_idempotent_delete_ok(payload, &err) => {
                return Ok(ProviderResult::default());
            }
            Err(err) => match classify(&err) {
                RetryClass::RateLimited => {
                    rate_limit_attempts += 1;
                    if rate_limit_attempts > config.max_rate_limit_retries {
                        return Err(format!("rate_limited after {rate_limit_attempts} attempts: {err}"));
                    }
                    let delay = err
                        .retry_after_ms
                        .unwrap_or(0)
                        .max(config.min_rate_limit_delay_ms);
                    tracing::debug!(%err, delay_ms = delay, "rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                RetryClass::Transient => {
                    transient_attempts += 1;
                    if transient_attempts > config.max_transient_retries {
                        return Err(format!("transient failure persisted: {err}"));
                    }
                    let delay =
                        config.transient_backoff_base_ms << (transient_attempts - 1).min(16);
                    tracing::debug!(%err, delay_ms = delay, "transient error, backing off");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                RetryClass::Permanent => return Err(format!("permanent failure: {err}")),
            },
        }
    }
}

/// One delivery attempt. Multi-file payloads are batched into media
/// groups when the adapter supports them; a failed batch falls back to
/// per-file sends with an inter-send delay.
async fn deliver_once(
    adapter: &dyn ChannelAdapter,
    payload: &OutboundPayload,
    config: &OutboxConfig,
) -> std::result::Result<ProviderResult, DeliverError> {
    let files = match &payload.content {
        OutboundContent::File { files } if files.len() > 1 => files.clone(),
        _ => return adapter.deliver(payload).await,
    };

    let supports_groups = adapter.meta().capabilities.media_groups;
    let mut last = ProviderResult::default();

    if supports_groups {
        let mut batch_failed = false;
        for chunk in files.chunks(config.media_batch_max.max(1)) {
            let batched = with_files(payload, chunk.to_vec());
            match adapter.deliver(&batched).await {
                Ok(result) => last = result,
                Err(err) => {
                    tracing::warn!(%err, "media group send failed, falling back to singles");
                    batch_failed = true;
                    break;
                }
            }
        }
        if !batch_failed {
            return Ok(last);
        }
    }

    // Per-file fallback (or no media-group support at all).
    for (i, file) in files.iter().enumerate() {
        if i > 0 && config.media_send_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.media_send_delay_ms)).await;
        }
        last = adapter.deliver(&with_files(payload, vec![file.clone()])).await?;
    }
    Ok(last)
}

fn with_files(
    payload: &OutboundPayload,
    files: Vec<courier_domain::payload::FileAttachment>,
) -> OutboundPayload {
    let mut out = payload.clone();
    out.content = OutboundContent::File { files };
    out
}
