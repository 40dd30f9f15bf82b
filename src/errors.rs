//! Error handling for the snapshot & rollback controller
//!
//! Every fallible operation in the crate returns [`SnapResult`]. Each variant
//! maps to a distinct process exit code so the CLI surface can report the
//! exact failure condition to schedulers and operators.

use thiserror::Error;

/// Main error type for the controller
#[derive(Error, Debug)]
pub enum SnapError {
    #[error("Snapshot not found: {id}")]
    NotFound { id: String },

    #[error("Snapshot already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Snapshot {id} failed verification: {reason}")]
    Unverified { id: String, reason: String },

    #[error(
        "Extraction of {id} failed: {reason} (project tree is degraded; \
         recover manually from safety snapshot {safety_snapshot_id})"
    )]
    ExtractionFailed {
        id: String,
        safety_snapshot_id: String,
        reason: String,
    },

    #[error("I/O operation failed: {operation}")]
    IoFailure {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Another rollback is already in progress (lock held at {lock_path})")]
    AlreadyInProgress { lock_path: String },

    #[error("No verified snapshot is available for emergency rollback")]
    NoVerifiedSnapshot,

    #[error(
        "Post-rollback health check failed: score {score} \
         (safety snapshot {safety_snapshot_id} holds the previous state)"
    )]
    PostCheckFailed {
        score: u8,
        safety_snapshot_id: String,
    },

    #[error("Operation declined: {operation}")]
    Declined { operation: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid snapshot id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Type alias for Result with SnapError
pub type SnapResult<T> = Result<T, SnapError>;

impl SnapError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists { id: id.into() }
    }

    pub fn unverified(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unverified {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn extraction_failed(
        id: impl Into<String>,
        safety_snapshot_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ExtractionFailed {
            id: id.into(),
            safety_snapshot_id: safety_snapshot_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoFailure {
            operation: operation.into(),
            source,
        }
    }

    /// I/O failure without an underlying OS error (e.g. verification refused the result)
    pub fn io_other(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IoFailure {
            operation: operation.into(),
            source: std::io::Error::other(message.into()),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn declined(operation: impl Into<String>) -> Self {
        Self::Declined {
            operation: operation.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn invalid_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Process exit code reported by the CLI for this error kind
    pub fn exit_code(&self) -> u8 {
        match self {
            SnapError::NotFound { .. } => 2,
            SnapError::AlreadyExists { .. } => 3,
            SnapError::Unverified { .. } => 4,
            SnapError::ExtractionFailed { .. } => 5,
            SnapError::IoFailure { .. } | SnapError::Serialization { .. } => 6,
            SnapError::AlreadyInProgress { .. } => 7,
            SnapError::NoVerifiedSnapshot => 8,
            SnapError::PostCheckFailed { .. } => 9,
            SnapError::Declined { .. } => 10,
            SnapError::Cancelled { .. } => 11,
            SnapError::Config { .. } | SnapError::InvalidId { .. } => 12,
        }
    }
}

/// Convert from serde_json errors
impl From<serde_json::Error> for SnapError {
    fn from(err: serde_json::Error) -> Self {
        SnapError::serialization("json_operation", err)
    }
}

/// Convert from std::io errors
impl From<std::io::Error> for SnapError {
    fn from(err: std::io::Error) -> Self {
        SnapError::io("io_operation", err)
    }
}

/// Convert from zip errors
impl From<zip::result::ZipError> for SnapError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(source) => SnapError::io("zip_archive", source),
            other => SnapError::io_other("zip_archive", other.to_string()),
        }
    }
}

/// Convert from figment errors
impl From<figment::Error> for SnapError {
    fn from(err: figment::Error) -> Self {
        SnapError::config(err.to_string())
    }
}
