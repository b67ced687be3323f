//! HTTP server implementation using Axum.

use crate::error::RunError;
use crate::profile;
use crate::sandbox::{self, ExecutionRequest, ExecutionResult, Outcome};
use crate::scheduler::SchedulerStats;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Deserialize)]
struct RunRequest {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Serialize)]
struct RunResponse {
    output: String,
}

impl IntoResponse for RunError {
    fn into_response(self) -> Response {
        let status = match self {
            RunError::Validation(_) => StatusCode::BAD_REQUEST,
            RunError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RunError::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
            RunError::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(RunResponse {
                output: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl IntoResponse for ExecutionResult {
    fn into_response(self) -> Response {
        let status = match self.outcome {
            outcome if outcome.program_ran() => StatusCode::OK,
            Outcome::Invalid => StatusCode::BAD_REQUEST,
            Outcome::Rejected => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(RunResponse { output: self.output })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run_code))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server until `shutdown` resolves.
pub async fn run_server<F>(port: u16, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Json<SchedulerStats> {
    Json(state.scheduler.stats())
}

const MISSING_FIELDS: &str = "Code or filename not provided.";

fn rejection_error(rejection: JsonRejection) -> RunError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return RunError::PayloadTooLarge;
    }
    let message = match rejection {
        JsonRejection::JsonSyntaxError(_) => "Request body is not valid JSON.",
        JsonRejection::MissingJsonContentType(_) => "Expected a JSON request body.",
        JsonRejection::BytesRejection(_) => "Request body could not be read.",
        _ => MISSING_FIELDS,
    };
    RunError::Validation(message.to_string())
}

/// Check a request before anything is allocated for it.
fn validate(payload: Result<Json<RunRequest>, JsonRejection>) -> Result<ExecutionRequest, RunError> {
    let missing = || RunError::Validation(MISSING_FIELDS.to_string());

    let Json(req) = payload.map_err(rejection_error)?;
    let code = req.code.filter(|c| !c.is_empty()).ok_or_else(missing)?;
    let filename = req.filename.filter(|f| !f.trim().is_empty()).ok_or_else(missing)?;

    if profile::extension_of(&filename)
        .and_then(profile::resolve)
        .is_none()
    {
        return Err(RunError::Validation(sandbox::unsupported_message(&filename)));
    }
    Ok(ExecutionRequest::new(code, filename))
}

async fn run_code(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let request = match validate(payload) {
        Ok(request) => request,
        Err(e) => {
            info!("POST /run - rejected: {}", e);
            return e.into_response();
        }
    };

    info!(request_id = %request.id, filename = %request.filename, "POST /run");
    let result = state.scheduler.run(request).await;
    result.into_response()
}
