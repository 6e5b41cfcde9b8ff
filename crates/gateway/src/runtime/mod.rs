//! Core runtime — run supervision, event translation, and outbound
//! delivery.
//!
//! One [`run_process`] actor owns each admitted run end-to-end; the
//! [`orchestrator`] admits submissions and enforces per-session queue
//! modes; the [`outbox`] drains per-peer delivery queues behind the
//! [`delivery`] façade.

pub mod abort;
pub mod bus;
pub mod compact;
pub mod delivery;
pub mod event_stream;
pub mod orchestrator;
pub mod outbox;
pub mod retry;
pub mod run_process;
pub mod run_store;

/// Truncate on a char boundary, appending `...` when anything was cut.
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
