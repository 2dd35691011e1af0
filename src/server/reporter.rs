//! Wire mapping for execution outcomes and request failures

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::outcome::ExecutionOutcome;
use crate::core::request::ValidationError;

const NO_OUTPUT: &str = "No output";
const COMPILE_ERROR_PREFIX: &str = "Compilation Error:\n";

/// Failures that never reached an outcome
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Too many concurrent runs. Please try again shortly.")]
    Busy,
    /// Detail is logged where it happens and never sent to the client
    #[error("Internal execution error.")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Validation(e) => (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
            ApiError::Busy => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string() }),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": self.to_string(), "success": false }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Status code and JSON body for a classified outcome.
///
/// Bodies whose output hit the byte cap also carry `"truncated": true`.
pub fn render(outcome: &ExecutionOutcome) -> (StatusCode, Value) {
    let (status, mut body) = render_body(outcome);
    if outcome_truncated(outcome) {
        body["truncated"] = Value::Bool(true);
    }
    (status, body)
}

fn outcome_truncated(outcome: &ExecutionOutcome) -> bool {
    match outcome {
        ExecutionOutcome::Success { truncated, .. }
        | ExecutionOutcome::RuntimeError { truncated, .. }
        | ExecutionOutcome::TimedOut { truncated, .. } => *truncated,
        ExecutionOutcome::CompileError { .. } => false,
    }
}

fn render_body(outcome: &ExecutionOutcome) -> (StatusCode, Value) {
    match outcome {
        ExecutionOutcome::Success {
            stdout,
            stderr,
            exit_code,
            ..
        } => {
            let output = if stdout.is_empty() { NO_OUTPUT } else { stdout.as_str() };
            (
                StatusCode::OK,
                json!({
                    "output": output,
                    "success": true,
                    "stdout": stdout,
                    "stderr": stderr,
                    "exitCode": exit_code,
                }),
            )
        }
        ExecutionOutcome::RuntimeError {
            stdout,
            stderr,
            exit_code,
            ..
        } => {
            let output = if stdout.is_empty() { stderr } else { stdout };
            let error = if stderr.is_empty() {
                format!("Process exited with code {}", exit_code)
            } else {
                stderr.clone()
            };
            (
                StatusCode::OK,
                json!({
                    "output": output,
                    "success": false,
                    "error": error,
                    "stdout": stdout,
                    "stderr": stderr,
                    "exitCode": exit_code,
                }),
            )
        }
        ExecutionOutcome::CompileError { stderr } => (
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Compilation failed",
                "details": stderr,
                "output": format!("{}{}", COMPILE_ERROR_PREFIX, stderr),
                "success": false,
                "stderr": stderr,
            }),
        ),
        ExecutionOutcome::TimedOut {
            partial_output,
            phase,
            ..
        } => (
            StatusCode::REQUEST_TIMEOUT,
            json!({
                "error": "Execution timed out.",
                "output": partial_output,
                "success": false,
                "phase": phase.to_string(),
            }),
        ),
    }
}

pub fn outcome_response(outcome: &ExecutionOutcome) -> Response {
    let (status, body) = render(outcome);
    (status, Json(body)).into_response()
}
