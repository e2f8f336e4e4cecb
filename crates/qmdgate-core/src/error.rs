//! Error types for qmdgate.

use thiserror::Error;

/// Main error type for qmdgate operations.
///
/// Variants correspond to the wire-level error categories; [`Error::code`]
/// yields the stable machine-readable code for a variant.
#[derive(Error, Debug)]
pub enum Error {
    /// Request was malformed before any backend work happened
    #[error("{0}")]
    InvalidArgument(String),

    /// A referenced collection or document does not exist
    #[error("{0}")]
    NotFound(String),

    /// Collection is gated and the request lacked `confirm=true`
    #[error("{0}")]
    FailedPrecondition(String),

    /// Semaphore wait cancelled, critical-overload shed, or backend OOM
    #[error("{0}")]
    ResourceExhausted(String),

    /// Required capability or sidecar is missing
    #[error("{0}")]
    Unavailable(String),

    /// Deadline elapsed before the operation completed
    #[error("QMD_TIMEOUT: {0}")]
    DeadlineExceeded(String),

    /// Backend subprocess or RPC call failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Backend output was malformed beyond recovery
    #[error("parse error: {0}")]
    Parse(String),

    /// Configuration problem
    #[error("config error: {0}")]
    Config(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable wire code for this error, shared by both transports.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            _ => "INTERNAL",
        }
    }

    /// Classify a backend error message the way the wire mapping requires:
    /// OOM markers become resource exhaustion, "not found" becomes NOT_FOUND,
    /// everything else stays a backend error.
    pub fn from_backend_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_lowercase();
        if lower.contains("outofmemory") || lower.contains("resource exhausted") {
            Error::ResourceExhausted(msg)
        } else if lower.contains("not found") {
            Error::NotFound(msg)
        } else if lower.contains("unavailable") {
            Error::Unavailable(msg)
        } else {
            Error::Backend(msg)
        }
    }
}

/// Result type alias for qmdgate operations.
pub type Result<T> = std::result::Result<T, Error>;
