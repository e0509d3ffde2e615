//! Error taxonomy shared by the secret client and the store client.
//!
//! Every failure carries a [`ErrorKind`] so callers can decide between retry,
//! re-authentication and giving up without parsing error text.

/// Coarse classification of a [`SecretsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Invalid,
    Conflict,
    PreconditionFailed,
    AlreadyInitialized,
    Unsupported,
    Unreachable,
    Cancelled,
    Backend,
}

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Secret store is already initialized")]
    AlreadyInitialized,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Secret store unreachable: {0}")]
    Unreachable(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("HTTP status {0}: {1}")]
    Backend(u16, String),
}

impl SecretsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretsError::NotFound(_) => ErrorKind::NotFound,
            SecretsError::Unauthorized(_) => ErrorKind::Unauthorized,
            SecretsError::Invalid(_) => ErrorKind::Invalid,
            SecretsError::Conflict(_) => ErrorKind::Conflict,
            SecretsError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            SecretsError::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            SecretsError::Unsupported(_) => ErrorKind::Unsupported,
            SecretsError::Unreachable(_) => ErrorKind::Unreachable,
            SecretsError::Cancelled(_) => ErrorKind::Cancelled,
            SecretsError::Backend(_, _) => ErrorKind::Backend,
        }
    }

    /// True only for transport level failures. Permission and input errors
    /// are terminal.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unreachable
    }

    /// Error for a response body that did not carry the expected field.
    pub(crate) fn malformed(what: impl std::fmt::Display) -> Self {
        SecretsError::Backend(200, format!("unexpected response: {}", what))
    }
}

impl From<reqwest::Error> for SecretsError {
    fn from(err: reqwest::Error) -> Self {
        SecretsError::Unreachable(err.to_string())
    }
}

impl From<serde_json::Error> for SecretsError {
    fn from(err: serde_json::Error) -> Self {
        SecretsError::malformed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(
            SecretsError::NotFound("secret/app".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SecretsError::AlreadyInitialized.kind(),
            ErrorKind::AlreadyInitialized
        );
        assert_eq!(
            SecretsError::Backend(418, "teapot".into()).kind(),
            ErrorKind::Backend
        );
    }

    #[test]
    fn test_only_unreachable_is_retryable() {
        assert!(SecretsError::Unreachable("connection refused".into()).is_retryable());
        assert!(!SecretsError::Unauthorized("permission denied".into()).is_retryable());
        assert!(!SecretsError::Conflict("cas mismatch".into()).is_retryable());
    }

    #[test]
    fn test_json_error_is_backend_kind() {
        let err: SecretsError = serde_json::from_str::<u8>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.to_string().contains("unexpected response"));
    }
}
