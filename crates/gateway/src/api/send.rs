//! Direct outbound send — `POST /v1/send` enqueues a text payload toward
//! a channel peer through the throttled outbox.

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use courier_domain::payload::{OutboundPayload, PeerRef};

use crate::state::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub channel_id: String,
    #[serde(default = "d_account")]
    pub account_id: String,
    pub peer: PeerRef,
    pub text: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

fn d_account() -> String {
    "default".into()
}

pub async fn send(
    State(state): State<AppState>,
    Json(body): Json<SendRequest>,
) -> ApiResult<Json<Value>> {
    if body.text.is_empty() {
        return Err(ApiError::invalid("text must not be empty"));
    }

    let mut payload = OutboundPayload::text(
        &body.channel_id,
        &body.account_id,
        body.peer,
        &body.text,
    );
    payload.idempotency_key = body.idempotency_key;
    payload.reply_to = body.reply_to;

    let outcome = state.delivery.enqueue(payload, None)?;
    Ok(Json(json!({
        "ok": true,
        "ref": outcome.reference(),
        "duplicate": outcome.is_duplicate(),
    })))
}
