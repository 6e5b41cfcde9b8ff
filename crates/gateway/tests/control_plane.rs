//! Control-plane endpoint behavior against a fully booted state: submit,
//! blocking wait, abort, manual compaction, direct send, and run queries.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use tokio_util::sync::CancellationToken;

use courier_domain::config::Config;
use courier_domain::error::ErrorCode;
use courier_sessions::CompactionReason;

use courier_gateway::api::agent::{self, AbortRequest, AgentRequest};
use courier_gateway::api::runs;
use courier_gateway::api::send::{self, SendRequest};
use courier_gateway::api::sessions::{self, CompactRequest};
use courier_gateway::bootstrap::build_app_state;
use courier_gateway::state::AppState;

async fn boot() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.state.path = dir.path().to_path_buf();
    config.outbox.throttle_ms = 0;
    let state = build_app_state(Arc::new(config), CancellationToken::new())
        .await
        .unwrap();
    (state, dir)
}

fn agent_request(prompt: &str) -> AgentRequest {
    AgentRequest {
        session_key: None,
        agent_id: None,
        prompt: prompt.into(),
        queue_mode: None,
        engine_id: None,
        timeout_ms: Some(5_000),
    }
}

#[tokio::test]
async fn submit_returns_run_id() {
    let (state, _dir) = boot().await;
    let Json(body) = agent::submit(State(state), Json(agent_request("hello")))
        .await
        .unwrap();
    assert!(body["run_id"].as_str().unwrap().starts_with('r'));
    assert_eq!(body["session_key"], "agent_main:default");
}

#[tokio::test]
async fn wait_blocks_for_completion() {
    let (state, _dir) = boot().await;
    let Json(body) = agent::wait(State(state), Json(agent_request("echo me")))
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    // The loopback engine answers with the prompt itself.
    assert_eq!(body["answer"], "echo me");
    assert!(body["duration_ms"].is_u64());
}

#[tokio::test]
async fn abort_unknown_run_is_not_found() {
    let (state, _dir) = boot().await;
    let err = agent::abort(
        State(state),
        Json(AbortRequest {
            run_id: Some("r-missing".into()),
            session_key: None,
            reason: None,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn abort_requires_a_target() {
    let (state, _dir) = boot().await;
    let err = agent::abort(
        State(state),
        Json(AbortRequest {
            run_id: None,
            session_key: None,
            reason: None,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);
}

#[tokio::test]
async fn compact_writes_manual_marker() {
    let (state, _dir) = boot().await;
    let Json(body) = sessions::compact(
        State(state.clone()),
        Json(CompactRequest {
            session_key: "agent_main:default".into(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(body["ok"], true);

    let marker = state
        .sessions
        .pending_compaction("agent_main:default")
        .unwrap();
    assert_eq!(marker.reason, CompactionReason::Manual);
}

#[tokio::test]
async fn send_enqueues_toward_loopback() {
    let (state, _dir) = boot().await;
    let Json(body) = send::send(
        State(state),
        Json(SendRequest {
            channel_id: "loopback".into(),
            account_id: "default".into(),
            peer: courier_domain::payload::PeerRef {
                kind: courier_domain::payload::PeerKind::Dm,
                id: "me".into(),
                thread_id: None,
            },
            text: "ping".into(),
            idempotency_key: None,
            reply_to: None,
        }),
    )
    .await
    .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["duplicate"], false);
}

#[tokio::test]
async fn send_to_unknown_channel_is_unavailable() {
    let (state, _dir) = boot().await;
    let err = send::send(
        State(state),
        Json(SendRequest {
            channel_id: "nowhere".into(),
            account_id: "default".into(),
            peer: courier_domain::payload::PeerRef {
                kind: courier_domain::payload::PeerKind::Dm,
                id: "me".into(),
                thread_id: None,
            },
            text: "ping".into(),
            idempotency_key: None,
            reply_to: None,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unavailable);
}

#[tokio::test]
async fn runs_listing_and_lookup() {
    let (state, _dir) = boot().await;
    let Json(done) = agent::wait(State(state.clone()), Json(agent_request("track me")))
        .await
        .unwrap();
    let run_id = done["run_id"].as_str().unwrap().to_owned();

    let Json(listing) = runs::list(
        State(state.clone()),
        Query(runs::ListQuery {
            status: Some("completed".into()),
            session_key: None,
            limit: 10,
            offset: 0,
        }),
    )
    .await
    .unwrap();
    assert_eq!(listing["total"], 1);

    let Json(single) = runs::get(State(state.clone()), Path(run_id))
        .await
        .unwrap();
    assert_eq!(single["run"]["status"], "completed");

    let err = runs::get(State(state), Path("r-none".into()))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn runs_listing_rejects_unknown_status() {
    let (state, _dir) = boot().await;
    let err = runs::list(
        State(state),
        Query(runs::ListQuery {
            status: Some("bogus".into()),
            session_key: None,
            limit: 10,
            offset: 0,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);
}
