//! HTTP surface
//!
//! `POST /execute` gates on the admission controller, validates the body and
//! hands the request to the pipeline in its own task. The task owns the
//! admission permit, so a client that disconnects mid-run cannot cut teardown
//! short or release the slot early.

pub mod reporter;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, Method};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::config::ServiceConfig;
use crate::core::request::{ExecuteBody, ExecutionRequest, ValidationError};
use crate::engine::Pipeline;
use crate::languages::LanguageRegistry;
use reporter::{outcome_response, ApiError};

/// Shared application state, created once at startup
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub admission: Arc<AdmissionController>,
    pub pipeline: Arc<Pipeline>,
    pub languages: Arc<LanguageRegistry>,
}

impl AppState {
    pub fn new(config: ServiceConfig, pipeline: Pipeline, languages: LanguageRegistry) -> Self {
        Self {
            admission: AdmissionController::new(config.max_concurrent),
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            languages: Arc::new(languages),
        }
    }
}

fn allowed_origins(origins: &[String]) -> AllowOrigin {
    if origins.iter().any(|origin| origin == "*") {
        return AllowOrigin::any();
    }
    let values: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    AllowOrigin::list(values)
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins(&state.config.cors_origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/execute", post(execute_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn execute_handler(
    State(state): State<AppState>,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Response {
    match execute(state, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn execute(
    state: AppState,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|rejection| {
        debug!("Rejected request body: {}", rejection);
        ValidationError::Malformed(rejection.body_text())
    })?;

    let permit = state.admission.try_acquire().ok_or_else(|| {
        info!(
            in_flight = state.admission.in_flight(),
            capacity = state.admission.capacity(),
            "Rejecting execution: at capacity"
        );
        ApiError::Busy
    })?;

    let request = ExecutionRequest::validate(body, &state.config, &state.languages)?;
    info!(
        language = %request.language.name,
        source_bytes = request.source.len(),
        timeout_ms = request.timeout.as_millis() as u64,
        "Execution admitted"
    );

    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move {
        let _permit = permit;
        pipeline.execute(&request).await
    });

    match task.await {
        Ok(Ok(outcome)) => Ok(outcome_response(&outcome)),
        Ok(Err(e)) => {
            error!("Execution failed: {}", e);
            Err(ApiError::Internal)
        }
        Err(e) => {
            error!("Execution task panicked: {}", e);
            Err(ApiError::Internal)
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "backend": state.pipeline.backend_name(),
        "inFlight": state.admission.in_flight(),
        "capacity": state.admission.capacity(),
    }))
}
