//! Outbound payload shapes — the normalized form handed to channel
//! adapters through the per-peer outbox.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Peer identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chat container kind on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Dm,
    Group,
    Channel,
}

impl PeerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Group => "group",
            Self::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dm" => Some(Self::Dm),
            "group" => Some(Self::Group),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }
}

/// The logical recipient identity on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub kind: PeerKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Text,
    Edit,
    Delete,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Operation content. `Edit`/`Delete` address a previously sent message by
/// its provider message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutboundContent {
    Text { text: String },
    Edit { message_id: String, text: String },
    Delete { message_id: String },
    File { files: Vec<FileAttachment> },
}

impl OutboundContent {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Text { .. } => PayloadKind::Text,
            Self::Edit { .. } => PayloadKind::Edit,
            Self::Delete { .. } => PayloadKind::Delete,
            Self::File { .. } => PayloadKind::File,
        }
    }

    /// Delivery priority: deletes drain before edits, edits before sends.
    pub fn priority(&self) -> Priority {
        match self {
            Self::Delete { .. } => Priority::Delete,
            Self::Edit { .. } => Priority::Edit,
            Self::Text { .. } | Self::File { .. } => Priority::Send,
        }
    }
}

/// Priority bands for the per-peer outbox. Lower drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Delete,
    Edit,
    Send,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Delete, Priority::Edit, Priority::Send];

    pub fn index(self) -> usize {
        match self {
            Self::Delete => 0,
            Self::Edit => 1,
            Self::Send => 2,
        }
    }
}

/// A normalized outbound operation addressed to one peer on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub channel_id: String,
    pub account_id: String,
    pub peer: PeerRef,
    pub content: OutboundContent,
    /// Caller-supplied token ensuring at-most-once effect for retried
    /// enqueues within the retention window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Provider message id to reply to / quote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

impl OutboundPayload {
    pub fn text(channel_id: &str, account_id: &str, peer: PeerRef, text: &str) -> Self {
        Self {
            channel_id: channel_id.to_owned(),
            account_id: account_id.to_owned(),
            peer,
            content: OutboundContent::Text {
                text: text.to_owned(),
            },
            idempotency_key: None,
            reply_to: None,
            meta: Value::Null,
        }
    }

    /// Key identifying the peer queue this payload drains through.
    pub fn peer_queue_key(&self) -> PeerQueueKey {
        PeerQueueKey {
            channel_id: self.channel_id.clone(),
            peer_id: self.peer.id.clone(),
        }
    }
}

/// One outbox queue exists per `(channel, peer)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerQueueKey {
    pub channel_id: String,
    pub peer_id: String,
}

impl std::fmt::Display for PeerQueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerRef {
        PeerRef {
            kind: PeerKind::Dm,
            id: "42".into(),
            thread_id: None,
        }
    }

    #[test]
    fn priority_order() {
        assert!(Priority::Delete < Priority::Edit);
        assert!(Priority::Edit < Priority::Send);
        assert_eq!(Priority::Delete.index(), 0);
        assert_eq!(Priority::Send.index(), 2);
    }

    #[test]
    fn content_priority_mapping() {
        let del = OutboundContent::Delete {
            message_id: "9".into(),
        };
        let edit = OutboundContent::Edit {
            message_id: "9".into(),
            text: "x".into(),
        };
        let text = OutboundContent::Text { text: "x".into() };
        assert_eq!(del.priority(), Priority::Delete);
        assert_eq!(edit.priority(), Priority::Edit);
        assert_eq!(text.priority(), Priority::Send);
        assert_eq!(del.kind(), PayloadKind::Delete);
    }

    #[test]
    fn peer_kind_round_trip() {
        for kind in [PeerKind::Dm, PeerKind::Group, PeerKind::Channel] {
            assert_eq!(PeerKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PeerKind::parse("topic"), None);
    }

    #[test]
    fn payload_serializes_tagged_content() {
        let p = OutboundPayload::text("tg", "acc", peer(), "hello");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["content"]["kind"], "text");
        assert_eq!(v["content"]["text"], "hello");
        assert!(v.get("idempotency_key").is_none());
    }

    #[test]
    fn peer_queue_key_groups_by_channel_and_peer() {
        let a = OutboundPayload::text("tg", "acc1", peer(), "x");
        let b = OutboundPayload::text("tg", "acc2", peer(), "y");
        assert_eq!(a.peer_queue_key(), b.peer_queue_key());
        let c = OutboundPayload::text("sms", "acc1", peer(), "z");
        assert_ne!(a.peer_queue_key(), c.peer_queue_key());
    }
}
