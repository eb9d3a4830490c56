use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;
use velo_common::RunStatus;

use crate::errors::InputError;
use crate::events::{EventSubscription, StreamEvent, with_keepalive};
use crate::orchestrator::{Healer, RunLookup, RunRequest};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub healer: Arc<Healer>,
    pub keepalive: Duration,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub wait: bool,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// The run ended ERRORED; the collaborator fault is the upstream failure.
    Upstream { message: String, run_id: Uuid },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": msg})),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({"error": msg})),
            ApiError::Upstream { message, run_id } => (
                StatusCode::BAD_GATEWAY,
                json!({"error": message, "run_id": run_id}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<InputError> for ApiError {
    fn from(err: InputError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/analyze", post(analyze))
        .route("/api/analyze/stream", post(analyze_stream))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/events", get(run_events))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

type EventStream = BoxStream<'static, Result<Event, axum::Error>>;

fn sse_response(events: BoxStream<'static, StreamEvent>, keepalive: Duration) -> Sse<EventStream> {
    let frames = with_keepalive(events, keepalive)
        .map(|event| Event::default().json_data(&event))
        .boxed();
    Sse::new(frames)
}

fn live_stream(subscription: EventSubscription) -> BoxStream<'static, StreamEvent> {
    subscription.into_stream().boxed()
}

fn not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("Run {} not found", id))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn analyze_stream(
    State(state): State<SharedState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let handle = state.healer.start_run(request)?;
    info!(run_id = %handle.run_id, "streaming run");
    Ok(sse_response(live_stream(handle.events), state.keepalive))
}

async fn analyze(
    State(state): State<SharedState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let report = state.healer.run_and_wait(request).await?;
    if report.run_status == RunStatus::Errored {
        let message = report.error.clone().unwrap_or_else(|| "run errored".to_string());
        warn!(run_id = %report.run_id, error = %message, "run errored");
        return Err(ApiError::Upstream {
            message,
            run_id: report.run_id,
        });
    }
    Ok(Json(report.as_ref().clone()))
}

async fn list_runs(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.healer.list())
}

async fn get_run(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
    Query(query): Query<RunQuery>,
) -> Result<Response, ApiError> {
    let Path(id) = id?;
    if query.wait {
        let report = state.healer.wait(id).await.ok_or_else(|| not_found(id))?;
        return Ok(Json(report.as_ref().clone()).into_response());
    }
    match state.healer.get(id).ok_or_else(|| not_found(id))? {
        RunLookup::Finished(report) => Ok(Json(report.as_ref().clone()).into_response()),
        RunLookup::Running { run_id, status } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"run_id": run_id, "status": status})),
        )
            .into_response()),
    }
}

async fn run_events(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    let events = match state.healer.subscribe(id) {
        Some(subscription) => live_stream(subscription),
        // Finished runs replay only their terminal event.
        None => match state.healer.get(id).ok_or_else(|| not_found(id))? {
            RunLookup::Finished(report) => {
                stream::iter([StreamEvent::terminal(&report)]).boxed()
            }
            RunLookup::Running { .. } => {
                return Err(ApiError::Conflict(format!("Run {} is not streamable", id)));
            }
        },
    };
    Ok(sse_response(events, state.keepalive))
}

async fn cancel_run(
    State(state): State<SharedState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    if state.healer.cancel(id) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({"run_id": id, "cancelled": true})),
        ));
    }
    match state.healer.get(id) {
        Some(_) => Err(ApiError::Conflict(format!("Run {} already finished", id))),
        None => Err(not_found(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SseDecoder;
    use crate::orchestrator::testing::{
        CountingCommitter, ScriptedProposer, ScriptedRunner, collaborators, failure, healer,
        passing_healer, patch,
    };
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use velo_common::{RunReport, TestResult};

    fn app(healer: Healer) -> (Router, Arc<Healer>) {
        let healer = Arc::new(healer);
        let state = Arc::new(AppState {
            healer: Arc::clone(&healer),
            keepalive: Duration::from_secs(15),
        });
        (api_router().with_state(state), healer)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn submission(dir: &std::path::Path) -> serde_json::Value {
        json!({
            "repo_url": dir.to_string_lossy(),
            "team_name": "RIFT",
            "leader_name": "Grace Hopper",
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app(passing_healer());
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_analyze_returns_report() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(passing_healer());
        let resp = app
            .oneshot(post_json("/api/analyze", submission(dir.path())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report: RunReport = serde_json::from_value(body_json(resp).await).unwrap();
        assert_eq!(report.run_status, RunStatus::Passed);
        assert_eq!(report.branch_name, "RIFT_GRACE_HOPPER_AI_Fix");
    }

    #[tokio::test]
    async fn test_analyze_rejects_bad_input() {
        let (app, _) = app(passing_healer());
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/analyze",
                json!({"repo_url": "not a url", "team_name": "A", "leader_name": "B"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("repo_url"));

        let req = Request::builder()
            .method("POST")
            .uri("/api/analyze/stream")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analyze_errored_run_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let healer = healer(collaborators(
            Arc::new(ScriptedRunner::new(
                vec![Err("sandbox exploded".into())],
                TestResult::pass(None),
            )),
            Arc::new(ScriptedProposer::new(vec![], vec![])),
            Arc::new(CountingCommitter::default()),
        ));
        let (app, _) = app(healer);
        let resp = app
            .oneshot(post_json("/api/analyze", submission(dir.path())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("sandbox exploded"));
        assert!(body["run_id"].is_string());
    }

    #[tokio::test]
    async fn test_analyze_stream_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(passing_healer());
        let resp = app
            .oneshot(post_json("/api/analyze/stream", submission(dir.path())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("data: {\"type\":\"log\""));

        let mut decoder = SseDecoder::new();
        let events = decoder.push(&bytes);
        let first = events[0].as_log().unwrap();
        assert_eq!(first.seq, 1);
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    /// A client that drops the stream early can still fetch the full report.
    #[tokio::test]
    async fn test_disconnected_client_can_fetch_report() {
        let dir = tempfile::tempdir().unwrap();
        let healer = healer(collaborators(
            Arc::new(ScriptedRunner::new(
                vec![Ok(TestResult::fail(vec![failure("app.py", 2)]))],
                TestResult::pass(Some(3)),
            )),
            Arc::new(ScriptedProposer::new(vec![vec![patch("app.py", 2)]], vec![])),
            Arc::new(CountingCommitter::default()),
        ));
        let (app, _) = app(healer);

        let resp = app
            .clone()
            .oneshot(post_json("/api/analyze/stream", submission(dir.path())))
            .await
            .unwrap();
        let mut body = resp.into_body();
        let mut decoder = SseDecoder::new();
        let mut testing_started = false;
        while !testing_started {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                testing_started = decoder.push(&data).iter().any(|event| {
                    event
                        .as_log()
                        .is_some_and(|log| log.message.starts_with("Iteration 1"))
                });
            }
        }
        drop(body);

        let resp = app.clone().oneshot(get("/api/runs")).await.unwrap();
        let runs = body_json(resp).await;
        let id = runs[0]["run_id"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(get(&format!("/api/runs/{}?wait=true", id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report: RunReport = serde_json::from_value(body_json(resp).await).unwrap();
        assert_eq!(report.run_status, RunStatus::Passed);
        assert_eq!(report.iterations.len(), 2);
        assert_eq!(report.total_fixes, 1);
    }

    #[tokio::test]
    async fn test_get_run_states() {
        let dir = tempfile::tempdir().unwrap();
        let slow = healer(collaborators(
            Arc::new(ScriptedRunner::slow(Duration::from_secs(30))),
            Arc::new(ScriptedProposer::new(vec![], vec![])),
            Arc::new(CountingCommitter::default()),
        ));
        let (app, healer) = app(slow);
        let handle = healer
            .start_run(serde_json::from_value(submission(dir.path())).unwrap())
            .unwrap();

        let resp = app
            .clone()
            .oneshot(get(&format!("/api/runs/{}", handle.run_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["status"], "RUNNING");

        let resp = app
            .clone()
            .oneshot(post_json(&format!("/api/runs/{}/cancel", handle.run_id), json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = app
            .clone()
            .oneshot(get(&format!("/api/runs/{}?wait=true", handle.run_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["run_status"], "ERRORED");

        let resp = app
            .clone()
            .oneshot(post_json(&format!("/api/runs/{}/cancel", handle.run_id), json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .clone()
            .oneshot(get(&format!("/api/runs/{}/events", handle.run_id)))
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let events = SseDecoder::new().push(&bytes);
        assert!(matches!(&events[..], [StreamEvent::Error { message }] if message == "cancelled"));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_run_ids() {
        let (app, _) = app(passing_healer());
        let resp = app
            .clone()
            .oneshot(get(&format!("/api/runs/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.oneshot(get("/api/runs/not-a-uuid")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
