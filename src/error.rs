use std::error::Error;
use std::fmt::{Display, Formatter};

/// Status codes surfaced by the synchronization core.
///
/// The set mirrors the RPC status space the Gridbase backend speaks, so
/// errors decoded from the wire and errors raised locally share one type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncErrorCode {
    Cancelled,
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    Aborted,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl SyncErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::Cancelled => "gridbase/cancelled",
            SyncErrorCode::InvalidArgument => "gridbase/invalid-argument",
            SyncErrorCode::FailedPrecondition => "gridbase/failed-precondition",
            SyncErrorCode::NotFound => "gridbase/not-found",
            SyncErrorCode::PermissionDenied => "gridbase/permission-denied",
            SyncErrorCode::Unauthenticated => "gridbase/unauthenticated",
            SyncErrorCode::ResourceExhausted => "gridbase/resource-exhausted",
            SyncErrorCode::Aborted => "gridbase/aborted",
            SyncErrorCode::Unavailable => "gridbase/unavailable",
            SyncErrorCode::DeadlineExceeded => "gridbase/deadline-exceeded",
            SyncErrorCode::Internal => "gridbase/internal",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncError {
    pub code: SyncErrorCode,
    message: String,
}

impl SyncError {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    /// Whether a write rejected with this error must be dropped and rolled
    /// back rather than retried. Transport-level failures and contention are
    /// retried by the stream machinery; everything else is authoritative.
    pub fn is_permanent_write_rejection(&self) -> bool {
        !matches!(
            self.code,
            SyncErrorCode::Cancelled
                | SyncErrorCode::Unauthenticated
                | SyncErrorCode::ResourceExhausted
                | SyncErrorCode::Aborted
                | SyncErrorCode::Unavailable
                | SyncErrorCode::DeadlineExceeded
                | SyncErrorCode::Internal
        )
    }

    /// Storage contention reported by a persistence hook; the operation may
    /// be retried before the store degrades to memory-only.
    pub fn is_retryable_storage_error(&self) -> bool {
        self.code == SyncErrorCode::Aborted
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

pub fn cancelled(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::InvalidArgument, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::FailedPrecondition, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unauthenticated, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::ResourceExhausted, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Aborted, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DeadlineExceeded, message)
}

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Internal, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_rejection_classification() {
        assert!(permission_denied("no").is_permanent_write_rejection());
        assert!(failed_precondition("stale").is_permanent_write_rejection());
        assert!(!unavailable("down").is_permanent_write_rejection());
        assert!(!resource_exhausted("slow down").is_permanent_write_rejection());
        assert!(!unauthenticated("expired").is_permanent_write_rejection());
    }

    #[test]
    fn renders_code_slug() {
        let err = invalid_argument("bad path");
        assert_eq!(err.code_str(), "gridbase/invalid-argument");
        assert_eq!(err.to_string(), "bad path (gridbase/invalid-argument)");
    }
}
