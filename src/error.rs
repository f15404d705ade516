//! Error taxonomy for the core and JSON error responses for the front door

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Failures surfaced by core operations
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The container engine cannot be reached or did not answer in time
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// No such tenant instance (routine, not an infrastructure fault)
    #[error("instance '{0}' cannot be resolved")]
    Unresolvable(String),

    /// Instance creation failed
    #[error("failed to launch image '{image}': {cause}")]
    LaunchFailed { image: String, cause: String },

    /// Stop succeeded but removal did not; the next sweep finishes the job
    #[error("teardown of instance '{id}' incomplete: {cause}")]
    TeardownIncomplete { id: String, cause: String },
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::RuntimeUnavailable(_) => ErrorCode::RuntimeUnavailable,
            CoreError::Unresolvable(_) => ErrorCode::Unresolvable,
            CoreError::LaunchFailed { .. } => ErrorCode::LaunchFailed,
            CoreError::TeardownIncomplete { .. } => ErrorCode::TeardownIncomplete,
        }
    }
}

/// Error codes reported by the front door
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RuntimeUnavailable,
    Unresolvable,
    LaunchFailed,
    TeardownIncomplete,
    /// Missing or wrong admin token
    Unauthorized,
    /// Malformed request (missing host, bad JSON, ...)
    BadRequest,
    /// No such administrative route
    NotFound,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::RuntimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unresolvable => StatusCode::NOT_FOUND,
            ErrorCode::LaunchFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::TeardownIncomplete => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Dockvision-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            ErrorCode::Unresolvable => "UNRESOLVABLE",
            ErrorCode::LaunchFailed => "LAUNCH_FAILED",
            ErrorCode::TeardownIncomplete => "TEARDOWN_INCOMPLETE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Dockvision-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Dockvision-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<&CoreError> for Response<Full<Bytes>> {
    fn from(err: &CoreError) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}
