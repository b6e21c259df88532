use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Every component defines its own error enum and converts into this one via
/// `#[from]`, mirroring the teacher's `AuditError::CryptoError(#[from] ...)`
/// nesting style. Callers match on the outer kind; the inner detail is for
/// logs, not for branching.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting state: {0}")]
    ConflictState(String),

    #[error("cryptographic operation failed: {0}")]
    CryptoFailure(String),

    #[error("upstream dependency unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream dependency timed out: {0}")]
    UpstreamTimeout(String),

    #[error("internal error ({correlation_id}): {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = message.into();
        tracing::error!(correlation_id = %correlation_id, %message, "internal error");
        VaultError::Internal {
            correlation_id,
            message,
        }
    }
}
