//! Control-plane HTTP surface.
//!
//! Thin axum handlers over the orchestrator, delivery façade, and stores.
//! Every failure renders as `{"error": {code, message, details?}}` with a
//! structured code (`NOT_FOUND`, `INVALID_PARAMS`, `CONFLICT`,
//! `RATE_LIMITED`, `TIMEOUT`, `INTERNAL_ERROR`, `UNAVAILABLE`).

pub mod agent;
pub mod inbound;
pub mod runs;
pub mod send;
pub mod sessions;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use courier_domain::error::{Error, ErrorCode};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/agent", post(agent::submit))
        .route("/v1/agent/wait", post(agent::wait))
        .route("/v1/chat/abort", post(agent::abort))
        .route("/v1/sessions/compact", post(sessions::compact))
        .route("/v1/send", post(send::send))
        .route("/v1/inbound", post(inbound::inbound))
        .route("/v1/runs", get(runs::list))
        .route("/v1/runs/:run_id", get(runs::get))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structured API error rendered as the JSON envelope.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidParams => StatusCode::BAD_REQUEST,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(ref details) = self.details {
            error["details"] = details.clone();
        }
        (self.status(), Json(json!({ "error": error }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_shape() {
        let err = ApiError::from(Error::Busy("session x".into()));
        assert_eq!(err.code, ErrorCode::Conflict);
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::from(Error::NotFound("run".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::invalid("bad").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(Error::Timeout("wait".into())).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from(Error::UnknownChannel("x".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
