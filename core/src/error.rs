use switchboard_protocol::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced to callers. The `Display` form is wire-stable:
/// `Error [<CODE>]: <message>`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Error [INVALID_ARGUMENT]: {0}")]
    InvalidArgument(String),

    #[error("Error [SESSION_NOT_FOUND]: {0}")]
    SessionNotFound(String),

    #[error("Error [SESSION_BUSY]: {0}")]
    SessionBusy(String),

    #[error("Error [PERMISSION_REQUEST_NOT_FOUND]: {0}")]
    PermissionRequestNotFound(String),

    #[error("Error [PERMISSION_DENIED]: {0}")]
    PermissionDenied(String),

    #[error("Error [TIMEOUT]: {0}")]
    Timeout(String),

    #[error("Error [CANCELLED]: {0}")]
    Cancelled(String),

    #[error("Error [INTERNAL]: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            CoreError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            CoreError::SessionBusy(_) => ErrorCode::SessionBusy,
            CoreError::PermissionRequestNotFound(_) => ErrorCode::PermissionRequestNotFound,
            CoreError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            CoreError::Timeout(_) => ErrorCode::Timeout,
            CoreError::Cancelled(_) => ErrorCode::Cancelled,
            CoreError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// The unknown-session error every operation shares.
    pub fn session_not_found(session_id: &str) -> Self {
        CoreError::SessionNotFound(format!("Session '{session_id}' not found"))
    }
}
