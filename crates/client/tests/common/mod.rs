#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use jobstream_core::status::JobStatus;
use jobstream_core::types::SequenceId;
use jobstream_events::EventLog;
use serde::Deserialize;
use serde_json::json;

/// Server-side cap on `max-wait`, so a stuck test fails quickly.
const MAX_WAIT_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct EventsQuery {
    since: Option<String>,
    limit: Option<usize>,
    #[serde(rename = "max-wait")]
    max_wait: Option<u64>,
}

/// Build a router that serves the jobs API out of `log`.
pub fn build_test_app(log: Arc<EventLog>) -> Router {
    Router::new()
        .route("/1/jobs", post(create_job))
        .route("/1/jobs/{id}", get(get_job))
        .route("/1/jobs/{id}/events", get(job_events))
        .with_state(log)
}

/// Serve `build_test_app(log)` on an ephemeral loopback port and return
/// its base URL.
pub async fn spawn_server(log: Arc<EventLog>) -> String {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    let app = build_test_app(log);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    format!("http://{addr}")
}

async fn create_job(State(log): State<Arc<EventLog>>) -> Response {
    let id = log.create_job().await;
    (
        StatusCode::CREATED,
        Json(json!({ "id": id, "status": JobStatus::Pending.as_str() })),
    )
        .into_response()
}

async fn get_job(State(log): State<Arc<EventLog>>, Path(id): Path<String>) -> Response {
    match log.status(&id).await {
        Ok(status) => Json(json!({ "id": id, "status": status.as_str() })).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn job_events(
    State(log): State<Arc<EventLog>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let cursor = query.since.map(SequenceId::new);
    let limit = query.limit.unwrap_or(50);
    let max_wait = Duration::from_secs(query.max_wait.unwrap_or(0)).min(MAX_WAIT_CAP);

    match log.wait_since(&id, cursor.as_ref(), limit, max_wait).await {
        Ok(events) if events.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}
