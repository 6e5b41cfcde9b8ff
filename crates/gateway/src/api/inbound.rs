//! Inbound envelope endpoint — `POST /v1/inbound`.
//!
//! The single entry point channel connectors post normalized messages to.

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::inbound::{InboundMessage, InboundOutcome};
use crate::state::AppState;

use super::ApiResult;

pub async fn inbound(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> ApiResult<Json<Value>> {
    let outcome = state.router.handle_inbound(message)?;
    let body = match outcome {
        InboundOutcome::Duplicate => json!({ "accepted": false, "deduped": true }),
        InboundOutcome::Ignored => json!({ "accepted": false, "ignored": true }),
        InboundOutcome::Busy { session_key } => json!({
            "accepted": false,
            "busy": true,
            "session_key": session_key,
        }),
        InboundOutcome::Submitted {
            run_id,
            session_key,
        } => json!({
            "accepted": true,
            "run_id": run_id,
            "session_key": session_key,
        }),
    };
    Ok(Json(body))
}
