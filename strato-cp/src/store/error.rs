//! Store and controller error taxonomy.

use thiserror::Error;

/// Errors flowing through the store, registry, and controllers.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Referent does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-key collision on create.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Syntactic or semantic validation failed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// AuthZ failure or policy deny.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No capacity, IP pool empty, or quota exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// CAS or state conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Downstream transiently unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The state machine disallows the action right now.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A node acknowledged the attempt and reported failure.
    #[error("operation failed: {message}")]
    OperationFailed { message: String, retryable: bool },

    /// Bug or unclassifiable failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Transient errors are re-enqueued with backoff; terminal errors move
    /// the owning object to ERROR and wait for a spec change or an external
    /// event.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict(_) | StoreError::Unavailable(_) => true,
            StoreError::OperationFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Stable machine-readable reason code for status fields and API bodies.
    pub fn reason(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::AlreadyExists(_) => "already_exists",
            StoreError::InvalidArgument(_) => "invalid_argument",
            StoreError::PermissionDenied(_) => "permission_denied",
            StoreError::ResourceExhausted(_) => "resource_exhausted",
            StoreError::Conflict(_) => "conflict",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::FailedPrecondition(_) => "failed_precondition",
            StoreError::OperationFailed { .. } => "operation_failed",
            StoreError::Internal(_) => "internal",
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
