//! Channel adapter contract.
//!
//! Each chat transport (Telegram, SMS, ...) registers an adapter exposing
//! its identity, its capabilities, and a `deliver` call that pushes one
//! normalized [`OutboundPayload`] to the provider. The outbox classifies
//! delivery errors into retry classes; adapters only describe what the
//! provider said.

pub mod memory;
pub mod registry;

pub use memory::MemoryAdapter;
pub use registry::AdapterRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_domain::payload::OutboundPayload;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the provider can edit a previously sent message.
    pub edit_support: bool,
    /// Maximum characters per outbound text message.
    pub chunk_limit: usize,
    /// Whether the provider accepts media-group (batched image) sends.
    pub media_groups: bool,
    /// Whether the provider renders inline callback buttons.
    pub inline_buttons: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            edit_support: false,
            chunk_limit: 4_000,
            media_groups: false,
            inline_buttons: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterMeta {
    pub name: String,
    pub capabilities: Capabilities,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider acknowledgement of a successful delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResult {
    /// Provider message id, when the operation created or targeted one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub raw: Value,
}

impl ProviderResult {
    pub fn with_message_id(id: &str) -> Self {
        Self {
            message_id: Some(id.to_owned()),
            raw: Value::Null,
        }
    }
}

/// Transport-level failure category, as observed by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// An HTTP status was received; `status` carries it.
    Http,
    Timeout,
    ConnectionReset,
    ConnectionClosed,
    /// The payload could not be encoded for this provider.
    Schema,
}

/// A failed delivery attempt. The outbox decides whether to retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverError {
    pub class: FailureClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub description: String,
    /// Provider retry-after hint, when present (HTTP 429).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl DeliverError {
    pub fn http(status: u16, description: &str) -> Self {
        Self {
            class: FailureClass::Http,
            status: Some(status),
            description: description.to_owned(),
            retry_after_ms: None,
        }
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            class: FailureClass::Http,
            status: Some(429),
            description: "too many requests".into(),
            retry_after_ms: Some(retry_after_ms),
        }
    }

    pub fn timeout(description: &str) -> Self {
        Self {
            class: FailureClass::Timeout,
            status: None,
            description: description.to_owned(),
            retry_after_ms: None,
        }
    }

    pub fn schema(description: &str) -> Self {
        Self {
            class: FailureClass::Schema,
            status: None,
            description: description.to_owned(),
            retry_after_ms: None,
        }
    }
}

impl std::fmt::Display for DeliverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} {status}: {}", self.class, self.description),
            None => write!(f, "{:?}: {}", self.class, self.description),
        }
    }
}

impl std::error::Error for DeliverError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One registered chat transport.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable channel id (`"telegram"`, `"sms"`, `"loopback"`).
    fn id(&self) -> &str;

    fn meta(&self) -> AdapterMeta;

    /// Push one payload to the provider. One call is in flight per peer
    /// at a time; the outbox serializes.
    async fn deliver(&self, payload: &OutboundPayload) -> Result<ProviderResult, DeliverError>;
}
