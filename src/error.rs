//! Error kinds shared across the vault.

use crate::object::{BlobRef, ContentHash, TenantKey};

/// Errors surfaced by vault operations.
///
/// Whether a failure is worth retrying is a property of the failure itself,
/// not of the task that hit it; the scheduler consults [`VaultError::retryable`]
/// when classifying a task outcome.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The requested blob does not exist in object storage.
    #[error("blob {blob} not found for tenant {tenant}")]
    BlobNotFound { tenant: TenantKey, blob: BlobRef },

    /// An object already exists under this key with different content.
    #[error("blob {blob} already exists with hash {existing}, refusing to overwrite")]
    BlobAlreadyExists {
        blob: BlobRef,
        existing: ContentHash,
    },

    /// Reconstructed bytes did not hash back to the manifest's identity.
    #[error("reconstruction of {expected} produced mismatched hash {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// No registered handler matched the content.
    ///
    /// The catch-all leaf handler matches everything, so seeing this means
    /// the registry was built without it.
    #[error("no format handler matched {filename:?}")]
    UnknownFormat { filename: String },

    /// A task's JSON input failed to deserialize into its declared shape.
    #[error("invalid input for task type {task_type}: {source}")]
    TaskInputInvalid {
        task_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// A task's execution failed.
    #[error("task execution failed: {cause}")]
    TaskExecutionFailed {
        retryable: bool,
        cause: anyhow::Error,
    },

    /// A task cannot run because a task it depends on failed.
    #[error("dependency task {dependency} failed")]
    DependencyFailed { dependency: i64 },

    /// A managed service cannot start because a dependency is not running.
    #[error("service {service} requires {dependency}, which is not running")]
    ServiceDependencyUnavailable {
        service: String,
        dependency: String,
    },

    /// Underlying I/O failure; transient by policy.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Underlying database failure; transient by policy.
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
}

impl VaultError {
    /// Returns `true` if retrying the failed operation could succeed.
    ///
    /// Storage and database failures are considered transient; identity
    /// violations (hash mismatches, mislabeled blobs) are terminal.
    pub fn retryable(&self) -> bool {
        match self {
            VaultError::Io(_) | VaultError::Database(_) => true,
            VaultError::TaskExecutionFailed { retryable, .. } => *retryable,
            VaultError::BlobNotFound { .. }
            | VaultError::BlobAlreadyExists { .. }
            | VaultError::HashMismatch { .. }
            | VaultError::UnknownFormat { .. }
            | VaultError::TaskInputInvalid { .. }
            | VaultError::DependencyFailed { .. }
            | VaultError::ServiceDependencyUnavailable { .. } => false,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = VaultError> = std::result::Result<T, E>;
