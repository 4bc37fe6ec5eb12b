use thiserror::Error;

#[derive(Debug, Error)]
pub enum PartwiseError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protected partition: {0}")]
    ProtectedPartition(String),

    #[error("Insufficient space: minimum safe size is {min_safe_size} bytes")]
    InsufficientSpace { min_safe_size: u64 },

    #[error("No adjacent unallocated space: only {available} bytes available")]
    NoAdjacentSpace { available: u64 },

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Misaligned target size: nearest aligned size is {suggested_size} bytes")]
    AlignmentError { suggested_size: u64 },

    #[error("Operation already in progress for partition {0}")]
    OperationInProgress(String),

    #[error("External tool failed during {phase}: {output}")]
    ExternalToolFailure { phase: String, output: String },

    #[error("Verification mismatch: expected {expected} bytes, snapshot reports {actual} bytes")]
    VerificationMismatch { expected: u64, actual: u64 },

    #[error("Rollback failed, manual intervention required: {0}")]
    RollbackFailed(String),

    #[error("Operation cancelled by caller")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
