use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::GraderError;
use crate::scheduler::{BuildRequest, DispatchQueue, GraderService, Job};
use crate::store::Build;

#[derive(Clone)]
pub struct DashboardState {
    pub service: GraderService,
    pub queue: Arc<DispatchQueue>,
}

#[derive(Serialize)]
struct QueueResponse {
    length: usize,
    jobs: Vec<Job>,
}

#[derive(Deserialize)]
struct WorkersQuery {
    #[serde(default)]
    log: bool,
}

#[derive(Serialize)]
struct BuildResponse {
    #[serde(flatten)]
    build: Build,
    status_text: &'static str,
}

#[derive(Serialize)]
struct StopResponse {
    build_name: String,
    stopped: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(GraderError);

impl From<GraderError> for ApiError {
    fn from(err: GraderError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            GraderError::UnknownAssignment(_) | GraderError::InvalidGrade(_) => {
                StatusCode::BAD_REQUEST
            }
            GraderError::BuildNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Dashboard request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/queue", get(queue_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers/:id", get(worker_handler))
        .route("/api/builds", post(submit_build_handler))
        .route("/api/builds/:name", get(build_handler))
        .route("/api/builds/:name/stop", post(stop_build_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn queue_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs = state.queue.snapshot();
    Json(QueueResponse {
        length: jobs.len(),
        jobs,
    })
}

async fn list_workers_handler(
    State(state): State<DashboardState>,
    Query(query): Query<WorkersQuery>,
) -> impl IntoResponse {
    Json(state.queue.probe_workers(query.log))
}

async fn worker_handler(State(state): State<DashboardState>, Path(id): Path<u64>) -> Response {
    match state.queue.probe_worker(id, true) {
        Some(probe) => Json(probe).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Worker not found: {}", id),
            }),
        )
            .into_response(),
    }
}

async fn build_handler(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
) -> Result<Json<BuildResponse>, ApiError> {
    let build = state
        .service
        .build(&name)?
        .ok_or(GraderError::BuildNotFound(name))?;
    Ok(Json(BuildResponse {
        status_text: build.status.describe(),
        build,
    }))
}

async fn submit_build_handler(
    State(state): State<DashboardState>,
    Json(request): Json<BuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state.service.submit(request).await?;
    let status = if submission.admitted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    Ok((status, Json(submission)))
}

async fn stop_build_handler(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let stopped = state.service.stop(&name).await?;
    Ok(Json(StopResponse {
        build_name: name,
        stopped,
    }))
}
