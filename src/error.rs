//! Error types for the session registry.

use thiserror::Error;

/// Main error type for session registry operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Credential check failed or the principal is invalid.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Session is logically expired but still registered.
    #[error("session timed out: {0}")]
    SessionTimeout(String),

    /// Session is not (or no longer) registered.
    #[error("session removed: {0}")]
    RemovedSession(String),

    /// Text that is not a well-formed session id.
    #[error("invalid session id: '{0}'")]
    InvalidSessionId(String),

    /// Disallowed mutation of a session.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// A reference counter was decremented below zero.
    #[error("reference counter decremented below zero")]
    CounterUnderflow,

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// Durable store rejected a write.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// No async runtime available for background work.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl SessionError {
    /// Whether the caller should re-authenticate rather than give up.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::SessionTimeout(_))
    }

    /// Whether the session is gone for good.
    pub fn is_removed(&self) -> bool {
        matches!(self, SessionError::RemovedSession(_))
    }
}

/// Convenience Result type for session registry operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_session_display() {
        let err = SessionError::RemovedSession("abc-123".into());
        assert!(err.to_string().contains("abc-123"));
        assert!(err.to_string().contains("removed"));
        assert!(err.is_removed());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_display() {
        let err = SessionError::SessionTimeout("abc-123".into());
        assert!(err.to_string().contains("timed out"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_security_violation_display() {
        let err = SessionError::SecurityViolation("time_to_idle of zero".into());
        assert!(err.to_string().contains("security violation"));
        assert!(err.to_string().contains("time_to_idle"));
    }

    #[test]
    fn test_invalid_session_id_display() {
        let err = SessionError::InvalidSessionId("sess-zz".into());
        assert!(err.to_string().contains("invalid session id"));
        assert!(!err.is_removed());
    }

    #[test]
    fn test_counter_underflow_display() {
        let err = SessionError::CounterUnderflow;
        assert!(err.to_string().contains("below zero"));
    }
}
