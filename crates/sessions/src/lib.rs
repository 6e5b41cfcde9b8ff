//! Session management for Courier.
//!
//! A session is the durable conversation identified by a session key. This
//! crate owns the canonical key grammar (parse/build, never-failing parse
//! with an opaque fallback) and the gateway-owned durable state per session:
//! resume tokens, pending-compaction markers, and last-run metadata.

pub mod session_key;
pub mod store;

pub use session_key::{agent_id_of, is_valid, make_channel_peer, parse, ParsedSessionKey};
pub use store::{CompactionReason, PendingCompaction, SessionEntry, SessionStore};
