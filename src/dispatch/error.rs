use std::time::Duration;

use thiserror::Error;

use crate::metrics::DispatchOutcome;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_SYNTAX: i32 = 1;
pub const EXIT_PERMISSION_DENIED: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 3;
pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_CANCELLED: i32 = 143;

/// Dispatch failures.  Each maps to a stable exit code that Git clients and
/// scripts can branch on; the message goes to the channel's stderr.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Syntax(String),
    #[error("permission denied on {0}")]
    PermissionDenied(String),
    #[error("repository {0} not found")]
    NotFound(String),
    #[error("repository {0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Execution(String),
    #[error("command timed out after {0:?} without progress")]
    Timeout(Duration),
    #[error("command cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Syntax(_) | Self::AlreadyExists(_) | Self::Execution(_) => EXIT_SYNTAX,
            Self::PermissionDenied(_) => EXIT_PERMISSION_DENIED,
            Self::NotFound(_) => EXIT_NOT_FOUND,
            Self::Timeout(_) => EXIT_TIMEOUT,
            Self::Cancelled => EXIT_CANCELLED,
        }
    }

    pub(crate) fn outcome(&self) -> DispatchOutcome {
        match self {
            Self::Syntax(_) | Self::AlreadyExists(_) => DispatchOutcome::SyntaxError,
            Self::PermissionDenied(_) => DispatchOutcome::PermissionDenied,
            Self::NotFound(_) => DispatchOutcome::NotFound,
            Self::Execution(_) => DispatchOutcome::ExecutionFailure,
            Self::Timeout(_) => DispatchOutcome::Timeout,
            Self::Cancelled => DispatchOutcome::Cancelled,
        }
    }
}
