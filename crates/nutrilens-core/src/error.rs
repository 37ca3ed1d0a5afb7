use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of failure kinds the pipeline surfaces to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    Unauthorized,
    ServerError,
    MalformedResponse,
    CaptureUnavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unreachable => "unreachable",
            Self::Unauthorized => "unauthorized",
            Self::ServerError => "server error",
            Self::MalformedResponse => "malformed response",
            Self::CaptureUnavailable => "capture unavailable",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum NutriLensError {
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("A user with this username or email already exists")]
    UserAlreadyExists,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

impl NutriLensError {
    /// Project this error onto the pipeline's error taxonomy. Returns `None`
    /// for local failures (config, disk, misuse) that never reach the pipeline.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Unreachable(_) => Some(ErrorKind::Unreachable),
            Self::Unauthorized(_) => Some(ErrorKind::Unauthorized),
            Self::Server { .. } => Some(ErrorKind::ServerError),
            Self::MalformedResponse(_) => Some(ErrorKind::MalformedResponse),
            Self::CaptureUnavailable(_) => Some(ErrorKind::CaptureUnavailable),
            Self::UserAlreadyExists
            | Self::Config(_)
            | Self::Storage(_)
            | Self::InvalidTransition(_) => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Map a non-2xx HTTP status to the shared taxonomy.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Unauthorized(format!("{status}: {body}")),
            code => Self::Server { status: code, body },
        }
    }
}

impl From<reqwest::Error> for NutriLensError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status, e.to_string())
        } else {
            // timeouts, refused connections, DNS and TLS failures
            Self::Unreachable(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, NutriLensError>;
