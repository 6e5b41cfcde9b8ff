//! Run queries — `GET /v1/runs` and `GET /v1/runs/:run_id`.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use courier_domain::error::{Error, ErrorCode};

use crate::runtime::run_store::RunStatus;
use crate::state::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default = "d_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn d_limit() -> usize {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(parse_status(s).ok_or_else(|| {
            ApiError::new(ErrorCode::InvalidParams, format!("unknown status \"{s}\""))
        })?),
    };

    let (runs, total) = state.run_store.list(
        status,
        query.session_key.as_deref(),
        query.limit.min(500),
        query.offset,
    );
    Ok(Json(json!({
        "runs": runs,
        "total": total,
        "counts": state.run_store.status_counts(),
    })))
}

pub async fn get(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state
        .run_store
        .get(&run_id)
        .ok_or_else(|| ApiError::from(Error::NotFound(format!("run {run_id}"))))?;
    Ok(Json(json!({ "run": record })))
}

fn parse_status(s: &str) -> Option<RunStatus> {
    match s {
        "queued" => Some(RunStatus::Queued),
        "running" => Some(RunStatus::Running),
        "completed" => Some(RunStatus::Completed),
        "failed" => Some(RunStatus::Failed),
        "stopped" => Some(RunStatus::Stopped),
        _ => None,
    }
}
