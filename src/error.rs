//! Error taxonomy and JSON error bodies for fleet operations

use crate::engine::RuntimeError;
use hyper::StatusCode;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by fleet operations
#[derive(Debug, Error)]
pub enum FleetError {
    /// Bad input shape or value; no state was changed
    #[error("{0}")]
    Validation(String),

    #[error("subdomain '{0}' is already used by another server")]
    DuplicateSubdomain(String),

    #[error("server not found: {0}")]
    WorkloadNotFound(String),

    #[error("server {0} is not running")]
    NotRunning(String),

    /// Missing ambient configuration; the deployment config must be fixed
    #[error("cannot generate container definition: {0}")]
    ConfigGeneration(String),

    #[error("storage error at '{}': {message}", path.display())]
    StoreIo { path: PathBuf, message: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("a job is already running for server {0}")]
    Busy(String),

    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl FleetError {
    pub fn store_io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        FleetError::StoreIo {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Machine-readable kind of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            FleetError::Validation(_) => ErrorCode::ValidationError,
            FleetError::DuplicateSubdomain(_) => ErrorCode::DuplicateSubdomain,
            FleetError::WorkloadNotFound(_) => ErrorCode::WorkloadNotFound,
            FleetError::NotRunning(_) => ErrorCode::NotRunning,
            FleetError::ConfigGeneration(_) => ErrorCode::ConfigGenerationError,
            FleetError::StoreIo { .. } => ErrorCode::StoreIoError,
            FleetError::Runtime(e) => match e {
                RuntimeError::Unavailable(_) => ErrorCode::RuntimeUnavailable,
                RuntimeError::NotFound(_) => ErrorCode::RuntimeWorkloadNotFound,
                RuntimeError::TimedOut { .. } => ErrorCode::OperationTimedOut,
                RuntimeError::CommandDelivery(_) => ErrorCode::CommandDeliveryError,
                RuntimeError::Rejected { .. } => ErrorCode::RuntimeError,
            },
            FleetError::Busy(_) => ErrorCode::Busy,
            FleetError::JobNotFound(_) => ErrorCode::JobNotFound,
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Runtime(RuntimeError::Unavailable(_))
                | FleetError::Runtime(RuntimeError::TimedOut { .. })
                | FleetError::Busy(_)
        )
    }
}

pub type FleetResult<T> = Result<T, FleetError>;

/// Error codes exposed to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    DuplicateSubdomain,
    WorkloadNotFound,
    NotRunning,
    ConfigGenerationError,
    StoreIoError,
    /// Container engine unreachable
    RuntimeUnavailable,
    /// Descriptor exists but the container does not
    RuntimeWorkloadNotFound,
    OperationTimedOut,
    CommandDeliveryError,
    /// Engine answered with an unexpected error
    RuntimeError,
    Busy,
    JobNotFound,
    /// Route or method not handled by the API
    NotFound,
    BadRequest,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError | ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::DuplicateSubdomain | ErrorCode::NotRunning | ErrorCode::Busy => {
                StatusCode::CONFLICT
            }
            ErrorCode::WorkloadNotFound
            | ErrorCode::RuntimeWorkloadNotFound
            | ErrorCode::JobNotFound
            | ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::CommandDeliveryError => StatusCode::CONFLICT,
            ErrorCode::RuntimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::OperationTimedOut => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ConfigGenerationError
            | ErrorCode::StoreIoError
            | ErrorCode::RuntimeError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::DuplicateSubdomain => "DUPLICATE_SUBDOMAIN",
            ErrorCode::WorkloadNotFound => "WORKLOAD_NOT_FOUND",
            ErrorCode::NotRunning => "NOT_RUNNING",
            ErrorCode::ConfigGenerationError => "CONFIG_GENERATION_ERROR",
            ErrorCode::StoreIoError => "STORE_IO_ERROR",
            ErrorCode::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            ErrorCode::RuntimeWorkloadNotFound => "RUNTIME_WORKLOAD_NOT_FOUND",
            ErrorCode::OperationTimedOut => "OPERATION_TIMED_OUT",
            ErrorCode::CommandDeliveryError => "COMMAND_DELIVERY_ERROR",
            ErrorCode::RuntimeError => "RUNTIME_ERROR",
            ErrorCode::Busy => "BUSY",
            ErrorCode::JobNotFound => "JOB_NOT_FOUND",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: ErrorCode,
    #[serde(rename = "error")]
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

impl From<&FleetError> for ErrorResponse {
    fn from(err: &FleetError) -> Self {
        ErrorResponse::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_codes_map_to_status() {
        assert_eq!(
            FleetError::Validation("bad".into()).code().status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            FleetError::DuplicateSubdomain("lobby".into()).code().status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            FleetError::WorkloadNotFound("x".into()).code().status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            FleetError::from(RuntimeError::Unavailable("down".into()))
                .code()
                .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_runtime_errors_keep_distinct_kinds() {
        let unavailable: FleetError = RuntimeError::Unavailable("socket".into()).into();
        let missing: FleetError = RuntimeError::NotFound("minecraft-server-1".into()).into();
        let timed_out: FleetError = RuntimeError::TimedOut {
            operation: "stop",
            after: Duration::from_secs(60),
        }
        .into();

        assert_eq!(unavailable.code(), ErrorCode::RuntimeUnavailable);
        assert_eq!(missing.code(), ErrorCode::RuntimeWorkloadNotFound);
        assert_eq!(timed_out.code(), ErrorCode::OperationTimedOut);
        assert!(unavailable.is_retryable());
        assert!(timed_out.is_retryable());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_error_response_json() {
        let err = FleetError::DuplicateSubdomain("survival".into());
        let json = ErrorResponse::from(&err).to_json();

        assert!(json.contains("\"code\":\"DUPLICATE_SUBDOMAIN\""));
        assert!(json.contains("\"status\":409"));
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("survival"));
    }

    #[test]
    fn test_code_strings_match_serde() {
        for code in [
            ErrorCode::ValidationError,
            ErrorCode::StoreIoError,
            ErrorCode::RuntimeWorkloadNotFound,
            ErrorCode::OperationTimedOut,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
