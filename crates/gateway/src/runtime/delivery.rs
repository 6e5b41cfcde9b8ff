//! Channel delivery façade.
//!
//! The single entry point for pushing output to a channel: resolves the
//! adapter, applies its capability defaults (text chunking, edit
//! truncation), derives coalescing keys and the hashed dedupe key, and
//! hands the ops to the per-peer outbox.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use courier_channels::AdapterRegistry;
use courier_domain::error::{Error, Result};
use courier_domain::payload::{OutboundContent, OutboundPayload};

use super::outbox::{delete_key, edit_key, EnqueueOutcome, Outbox, OutboxNotify};

pub struct ChannelsDelivery {
    adapters: Arc<AdapterRegistry>,
    outbox: Arc<Outbox>,
}

impl ChannelsDelivery {
    pub fn new(adapters: Arc<AdapterRegistry>, outbox: Arc<Outbox>) -> Self {
        Self { adapters, outbox }
    }

    /// Enqueue one payload toward its channel.
    ///
    /// Oversized text is split into chunks under the adapter's limit; the
    /// final chunk carries the notify so the caller hears exactly one
    /// terminal resolution. Returns the reference of the last enqueued op.
    pub fn enqueue(
        &self,
        payload: OutboundPayload,
        notify: Option<OutboxNotify>,
    ) -> Result<EnqueueOutcome> {
        let adapter = self
            .adapters
            .get(&payload.channel_id)
            .ok_or_else(|| Error::UnknownChannel(payload.channel_id.clone()))?;
        let capabilities = adapter.meta().capabilities;
        let digest = dedupe_digest(&payload);

        match payload.content.clone() {
            OutboundContent::Text { text } if text.chars().count() > capabilities.chunk_limit => {
                let chunks = split_text(&text, capabilities.chunk_limit);
                let last = chunks.len() - 1;
                let mut outcome = EnqueueOutcome::Queued { reference: 0 };
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let mut part = payload.clone();
                    part.content = OutboundContent::Text { text: chunk };
                    // Only the first chunk consults the dedupe store: a
                    // duplicate hit suppresses the whole message.
                    let part_digest = (i == 0).then(|| digest.clone()).flatten();
                    let part_notify = if i == last { notify.clone() } else { None };
                    outcome = self.outbox.enqueue(None, part, part_digest, part_notify)?;
                    if outcome.is_duplicate() {
                        return Ok(outcome);
                    }
                }
                Ok(outcome)
            }
            OutboundContent::Edit { message_id, text } => {
                let mut payload = payload;
                if text.chars().count() > capabilities.chunk_limit {
                    // Edits cannot split; cut at the provider limit.
                    payload.content = OutboundContent::Edit {
                        message_id: message_id.clone(),
                        text: text.chars().take(capabilities.chunk_limit).collect(),
                    };
                }
                let key = edit_key(&payload.peer.id, &message_id);
                self.outbox.enqueue(Some(key), payload, digest, notify)
            }
            OutboundContent::Delete { message_id } => {
                let key = delete_key(&payload.peer.id, &message_id);
                self.outbox.enqueue(Some(key), payload, digest, notify)
            }
            _ => self.outbox.enqueue(None, payload, digest, notify),
        }
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }
}

/// Digest of `(channel, account, peer, idempotency_key)` used as the
/// outbox dedupe key. `None` when the payload carries no idempotency key.
pub fn dedupe_digest(payload: &OutboundPayload) -> Option<String> {
    let idem = payload.idempotency_key.as_deref()?;
    let mut hasher = Sha256::new();
    for part in [
        payload.channel_id.as_str(),
        payload.account_id.as_str(),
        payload.peer.id.as_str(),
        idem,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    Some(hex::encode(hasher.finalize()))
}

/// Split text into chunks of at most `limit` chars, preferring newline
/// then space boundaries.
fn split_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest: Vec<char> = text.chars().collect();

    while rest.len() > limit {
        let window = &rest[..limit];
        let break_at = window
            .iter()
            .rposition(|c| *c == '\n')
            .or_else(|| window.iter().rposition(|c| *c == ' '))
            .map(|p| p + 1)
            .unwrap_or(limit);
        chunks.push(rest[..break_at].iter().collect::<String>().trim_end().to_owned());
        rest.drain(..break_at);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.into_iter().collect());
    }
    chunks
}
