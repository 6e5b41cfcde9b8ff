//! Agent endpoints — submit, blocking wait, and abort.
//!
//! - `POST /v1/agent`      — submit a prompt, returns `{run_id}`
//! - `POST /v1/agent/wait` — submit and block until the run completes
//! - `POST /v1/chat/abort` — cancel by run id or session key

use std::time::Duration;

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use courier_domain::error::ErrorCode;
use courier_domain::request::{QueueMode, RunOrigin, RunRequest};

use crate::runtime::bus::RunBusEvent;
use crate::state::AppState;

use super::{ApiError, ApiResult};

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Deserialize)]
pub struct AgentRequest {
    /// Target session. Defaults to the agent's standalone session.
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub queue_mode: Option<QueueMode>,
    #[serde(default)]
    pub engine_id: Option<String>,
    /// Only meaningful for `/v1/agent/wait`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl AgentRequest {
    fn into_run_request(self) -> RunRequest {
        let agent_id = self.agent_id.unwrap_or_else(|| "default".into());
        let session_key = self
            .session_key
            .unwrap_or_else(|| format!("agent_main:{agent_id}"));
        let mut request = RunRequest::new(&session_key, &agent_id, &self.prompt);
        request.origin = RunOrigin::Control;
        request.queue_mode = self.queue_mode.unwrap_or_default();
        request.engine_id = self.engine_id;
        request
    }
}

pub async fn submit(
    State(state): State<AppState>,
    Json(body): Json<AgentRequest>,
) -> ApiResult<Json<Value>> {
    let request = body.into_run_request();
    let session_key = request.session_key.clone();
    let run_id = state.orchestrator.submit(request)?;
    Ok(Json(json!({
        "run_id": run_id,
        "session_key": session_key,
    })))
}

pub async fn wait(
    State(state): State<AppState>,
    Json(body): Json<AgentRequest>,
) -> ApiResult<Json<Value>> {
    let timeout = Duration::from_millis(body.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS));
    let request = body.into_run_request();
    let session_key = request.session_key.clone();
    let (run_id, mut rx) = state.orchestrator.submit_subscribed(request)?;

    let completed = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(RunBusEvent::RunCompleted {
                    ok,
                    answer,
                    error,
                    usage,
                    duration_ms,
                    ..
                }) => {
                    return Some(json!({
                        "run_id": run_id,
                        "session_key": session_key,
                        "ok": ok,
                        "answer": answer,
                        "error": error,
                        "usage": usage,
                        "duration_ms": duration_ms,
                    }));
                }
                Ok(RunBusEvent::RunStarted { .. }) => {}
                Err(_) => return None,
            }
        }
    })
    .await;

    match completed {
        Ok(Some(body)) => Ok(Json(body)),
        Ok(None) => Err(ApiError::new(
            ErrorCode::InternalError,
            "run bus closed before completion",
        )),
        Err(_) => Err(ApiError::new(
            ErrorCode::Timeout,
            format!("run did not complete within {}ms", timeout.as_millis()),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn abort(
    State(state): State<AppState>,
    Json(body): Json<AbortRequest>,
) -> ApiResult<Json<Value>> {
    let reason = body.reason.as_deref().unwrap_or("user_requested");
    let run_id = match (&body.run_id, &body.session_key) {
        (Some(run_id), _) => {
            state.orchestrator.cancel_by_run_id(run_id, reason)?;
            run_id.clone()
        }
        (None, Some(session_key)) => state.orchestrator.cancel_by_session(session_key, reason)?,
        (None, None) => {
            return Err(ApiError::invalid("run_id or session_key required"));
        }
    };
    Ok(Json(json!({ "ok": true, "run_id": run_id })))
}
