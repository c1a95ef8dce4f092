//! Control-plane HTTP admin surface: a thin layer around
//! `Platform` where every handler only enqueues, reads, or starts a
//! worker, never touches scheduling/assignment logic directly.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::admin::StartWorkerRequest;
use crate::model::Task;
use crate::platform::PlatformContext;

pub fn router(context: PlatformContext) -> Router {
    Router::new()
        .route("/api/workers/start", post(start_worker))
        .route("/api/workers/stop", post(stop_worker))
        .route("/api/workers", get(list_workers))
        .route("/api/tasks/submit", post(submit_task))
        .route("/api/tasks/status", get(task_status))
        .route("/api/metrics", get(system_metrics))
        .route("/api/system/reset", post(system_reset))
        .layer(middleware::from_fn_with_state(context.clone(), rate_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

/// Per-client-IP sliding-window gate ahead of every admin route. Falls back
/// to an unroutable address when the connection carries no socket info
/// (e.g. a handler invoked directly in tests) rather than rejecting it.
async fn rate_limit(
    State(ctx): State<PlatformContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let client_ip = connect_info.map(|ConnectInfo(addr)| addr.ip()).unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]));
    let path = request.uri().path().to_string();
    if let Err(err) = ctx.check_rate_limit(client_ip, &path) {
        warn!(%client_ip, %path, %err, "request rejected by rate limiter");
        return (StatusCode::TOO_MANY_REQUESTS, Json(ErrorBody { error: err.to_string() })).into_response();
    }
    next.run(request).await
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message.into() })).into_response()
}

fn internal_error(message: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody { error: message.to_string() }),
    )
        .into_response()
}

async fn start_worker(State(ctx): State<PlatformContext>, body: Option<Json<StartWorkerRequest>>) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    if request.pool_size == 0 || request.min_workers > request.max_workers {
        return bad_request("pool_size must be > 0 and min_workers <= max_workers");
    }

    ctx.audit_log("worker.start", "POST /api/workers/start");
    let worker_id = ctx.workers().start(request.clone()).await;
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "status": "started", "id": worker_id, "config": request })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct StopWorkerQuery {
    id: Option<String>,
}

async fn stop_worker(State(ctx): State<PlatformContext>, Query(query): Query<StopWorkerQuery>) -> Response {
    let Some(id) = query.id else {
        return bad_request("missing id");
    };

    ctx.audit_log("worker.stop", &format!("POST /api/workers/stop?id={id}"));
    let stopped = ctx.workers().stop(&id).await;
    if !stopped {
        warn!(worker = %id, "stop requested for a worker this process did not start");
    }
    (StatusCode::OK, Json(serde_json::json!({ "status": "stopped", "id": id }))).into_response()
}

async fn list_workers(State(ctx): State<PlatformContext>) -> Response {
    match ctx.metrics().snapshot().await {
        Ok(snapshot) if !snapshot.worker_metrics.is_empty() => {
            (StatusCode::OK, Json(snapshot.worker_metrics)).into_response()
        }
        Ok(_) => (StatusCode::NOT_FOUND, Json(ErrorBody { error: "no metrics yet".to_string() })).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    #[serde(default = "default_priority")]
    priority: u8,
    deadline: Option<String>,
    #[serde(default)]
    retries: u32,
    task_type: String,
    payload: String,
}

fn default_priority() -> u8 {
    5
}

async fn submit_task(State(ctx): State<PlatformContext>, Json(request): Json<SubmitTaskRequest>) -> Response {
    if !(1..=10).contains(&request.priority) {
        return bad_request("priority must be between 1 and 10");
    }

    let deadline = match request.deadline.as_deref().map(parse_deadline) {
        Some(Err(err)) => return bad_request(err),
        Some(Ok(ts)) => Some(ts),
        None => None,
    };

    let payload = match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &request.payload) {
        Ok(bytes) => bytes,
        Err(_) => request.payload.into_bytes(),
    };

    let mut task = Task::new(request.task_type, payload);
    task.priority = request.priority;
    task.max_retries = request.retries;
    task.deadline = deadline;

    let task_id = task.id.clone();
    if let Err(err) = ctx.scheduler().enqueue(task).await {
        error!(task_id = %task_id, error = %err, "submit failed");
        return internal_error(err);
    }

    ctx.audit_log("task.submit", &format!("task {task_id} queued"));
    (StatusCode::CREATED, Json(serde_json::json!({ "taskId": task_id, "status": "queued" }))).into_response()
}

fn parse_deadline(raw: &str) -> Result<i64, String> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|_| format!("invalid RFC3339 deadline: {raw}"))
}

#[derive(Debug, Deserialize)]
struct TaskStatusQuery {
    id: Option<String>,
}

async fn task_status(State(ctx): State<PlatformContext>, Query(query): Query<TaskStatusQuery>) -> Response {
    let Some(id) = query.id else {
        return bad_request("missing id");
    };

    match ctx.store().results_get(&id).await {
        Ok(Some(result)) => (StatusCode::OK, Json(result)).into_response(),
        Ok(None) => match ctx.store().failed_get(&id).await {
            Ok(Some(result)) => (StatusCode::OK, Json(result)).into_response(),
            Ok(None) => (StatusCode::NOT_FOUND, Json(ErrorBody { error: "not found".to_string() })).into_response(),
            Err(err) => internal_error(err),
        },
        Err(err) => internal_error(err),
    }
}

async fn system_metrics(State(ctx): State<PlatformContext>) -> Response {
    match ctx.metrics().snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn system_reset(State(ctx): State<PlatformContext>) -> Response {
    ctx.audit_log("system.reset", "POST /api/system/reset");
    match ctx.store().clear_all().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "reset" }))).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn serve(context: PlatformContext, port: u16, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    let app = router(context);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "admin HTTP surface listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;
    Ok(())
}
