//! Session endpoints — manual compaction requests.

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use courier_sessions::PendingCompaction;

use crate::state::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CompactRequest {
    pub session_key: String,
}

/// `POST /v1/sessions/compact` — write a manual `pending_compaction`
/// marker for the compactor to pick up.
pub async fn compact(
    State(state): State<AppState>,
    Json(body): Json<CompactRequest>,
) -> ApiResult<Json<Value>> {
    if body.session_key.is_empty() {
        return Err(ApiError::invalid("session_key required"));
    }
    let marker = PendingCompaction::manual();
    state
        .sessions
        .set_pending_compaction(&body.session_key, marker.clone());
    if let Err(err) = state.sessions.flush() {
        tracing::warn!(error = %err, "session flush failed after compact request");
    }
    Ok(Json(json!({
        "ok": true,
        "session_key": body.session_key,
        "pending_compaction": marker,
    })))
}
