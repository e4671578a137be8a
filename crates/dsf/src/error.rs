use std::time::Duration;
use thiserror::Error;

/// Code used for errors reported by the debugger back end.
pub const REQUEST_FAILED: i32 = 10004;
/// Code used for failures inside the framework itself.
pub const INTERNAL_ERROR: i32 = 10005;

/// Terminal failure of a request.
///
/// Every monitor that does not complete successfully carries one of these. The type is
/// `Clone` so the same failure can be fanned out to every subscriber of a coalesced
/// command and reported as the first failure of a counting monitor.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request was cancelled")]
    Cancelled,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("session is disconnected")]
    Disconnected,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{message}")]
    Failed { code: i32, message: String },
}

impl RequestError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            code: REQUEST_FAILED,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Failed { code, .. } => *code,
            Self::Internal(_) => INTERNAL_ERROR,
            _ => REQUEST_FAILED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<anyhow::Error> for RequestError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(format!("{error:#}"))
    }
}
