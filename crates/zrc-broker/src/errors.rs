//! Error types for the ZRC session broker.
//!
//! Each component owns a narrow error enum. `SessionError` is what callers of
//! the broker see, and `ErrorKind` collapses it into a small set of stable
//! categories that an API layer can map onto status codes.

use serde::Serialize;
use thiserror::Error;

use crate::model::SessionStatus;

// ============================================================================
// Error categories
// ============================================================================

/// Stable, caller-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Referenced session, device or credential does not exist.
    NotFound,
    /// Caller is not allowed to perform the operation.
    Unauthorized,
    /// A single-use credential was presented a second time.
    Replayed,
    /// A time-bounded credential is past its expiry.
    Expired,
    /// The backend provider failed, refused or timed out.
    ProviderUnavailable,
    /// The request is malformed or not valid in the current state.
    InvalidRequest,
    /// Storage or randomness failure inside the broker.
    Internal,
}

impl ErrorKind {
    /// Client errors are the caller's fault and are logged at `warn`.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound
                | ErrorKind::Unauthorized
                | ErrorKind::Replayed
                | ErrorKind::Expired
                | ErrorKind::InvalidRequest
        )
    }
}

// ============================================================================
// PIN errors
// ============================================================================

/// Why a presented PIN was not accepted.
///
/// These are expected outcomes, not failures of the broker, and surface as
/// `false` from the boolean validation entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinRejection {
    /// No credential is issued for the session.
    #[error("no pin issued for this session")]
    Missing,

    /// The presented code does not match the issued credential.
    #[error("pin does not match")]
    Mismatch,

    /// The credential exists but is past its expiry.
    #[error("pin expired")]
    Expired,

    /// The credential was already consumed.
    #[error("pin already used")]
    AlreadyUsed,

    /// Too many failed attempts inside the attempt window.
    #[error("too many failed pin attempts")]
    RateLimited,

    /// The credential store could not be read.
    #[error("pin store unavailable")]
    Unavailable,
}

impl PinRejection {
    pub fn kind(self) -> ErrorKind {
        match self {
            PinRejection::Missing => ErrorKind::NotFound,
            PinRejection::Mismatch | PinRejection::RateLimited => ErrorKind::Unauthorized,
            PinRejection::Expired => ErrorKind::Expired,
            PinRejection::AlreadyUsed => ErrorKind::Replayed,
            PinRejection::Unavailable => ErrorKind::Internal,
        }
    }
}

/// Failures while issuing or revoking PIN credentials.
#[derive(Debug, Error, Clone)]
pub enum PinError {
    /// The operating system random source failed.
    #[error("random source failure: {0}")]
    Rng(String),

    /// No code unique among live credentials was found.
    #[error("no unique pin available after {0} attempts")]
    CodeSpaceExhausted(u32),

    /// Requested lifetime is not positive.
    #[error("invalid pin lifetime: {0}")]
    InvalidLifetime(String),

    #[error("pin store error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// Provider errors
// ============================================================================

/// Failures reported by, or about, a backend provider.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    /// The provider could not be reached or is not configured.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// A provider call exceeded the configured deadline.
    #[error("provider call `{operation}` timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// A session operation was attempted before `initialize` succeeded.
    #[error("provider not initialized")]
    NotInitialized,

    /// The provider does not know the given connection.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// The provider answered but refused the request.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// The provider could not be constructed from its configuration.
    #[error("provider construction failed: {0}")]
    Construction(String),
}

// ============================================================================
// Storage errors
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Session errors
// ============================================================================

/// Errors returned by the session broker.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The requested status change is not an edge of the lifecycle graph.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("pin rejected: {0}")]
    Pin(#[from] PinRejection),

    #[error("pin authority error: {0}")]
    PinAuthority(#[from] PinError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::Unauthorized(_) => ErrorKind::Unauthorized,
            SessionError::InvalidRequest(_) | SessionError::InvalidTransition { .. } => {
                ErrorKind::InvalidRequest
            }
            SessionError::Pin(rejection) => rejection.kind(),
            SessionError::PinAuthority(_) | SessionError::Store(_) | SessionError::Internal(_) => {
                ErrorKind::Internal
            }
            SessionError::Provider(_) => ErrorKind::ProviderUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_distinct_kinds() {
        assert_eq!(PinRejection::AlreadyUsed.kind(), ErrorKind::Replayed);
        assert_eq!(PinRejection::Expired.kind(), ErrorKind::Expired);
        assert_eq!(PinRejection::Missing.kind(), ErrorKind::NotFound);
        assert_eq!(PinRejection::Mismatch.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn session_error_kinds() {
        let err = SessionError::InvalidTransition {
            from: SessionStatus::Ended,
            to: SessionStatus::Active,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.kind().is_client_error());

        let err = SessionError::from(ProviderError::Timeout {
            operation: "start_session",
            timeout_ms: 10,
        });
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
        assert!(!err.kind().is_client_error());

        let err = SessionError::from(PinRejection::AlreadyUsed);
        assert_eq!(err.kind(), ErrorKind::Replayed);
    }
}
