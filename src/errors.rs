//! Coordination Cache Error Hierarchy
//!
//! Defines the error types surfaced by the store client contract, the caches
//! and the configuration layer.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Result alias used by the [`crate::StoreClient`] contract
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failures reported by the coordination store
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cache lifecycle violations
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable failures
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Errors of the coordination store operations
///
/// `NotFound` is only escalated by operations that require the node: reads and
/// existence watches report a missing node as `exists=false` instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Node does not exist: {path}")]
    NotFound { path: String },

    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    #[error("Version mismatch at {path}: expected {expected}, actual {actual}")]
    VersionMismatch {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// Delete of a node that still has children
    #[error("Directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("Parent node does not exist for {path}")]
    NoParent { path: String },

    #[error("Ephemeral node cannot have children: {path}")]
    NoChildrenForEphemerals { path: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection to the coordination store is unavailable")]
    ConnectionUnavailable,

    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// Whole transaction rolled back because of the op at `index`
    #[error("Transaction failed at op {index}: {cause}")]
    TransactionFailed { index: usize, cause: Box<StoreError> },
}

impl StoreError {
    /// Connection-class failures pause a cache instead of failing it
    pub fn is_connection_error(&self) -> bool {
        matches!(self, StoreError::ConnectionUnavailable | StoreError::OperationTimeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Path carried by the error, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            StoreError::NotFound { path }
            | StoreError::NodeExists { path }
            | StoreError::VersionMismatch { path, .. }
            | StoreError::NotEmpty { path }
            | StoreError::NoParent { path }
            | StoreError::NoChildrenForEphemerals { path } => Some(path),
            StoreError::TransactionFailed { cause, .. } => cause.path(),
            _ => None,
        }
    }

    /// Rewrites every path carried by the error
    pub(crate) fn map_path(
        self,
        f: &dyn Fn(&str) -> String,
    ) -> Self {
        match self {
            StoreError::NotFound { path } => StoreError::NotFound { path: f(&path) },
            StoreError::NodeExists { path } => StoreError::NodeExists { path: f(&path) },
            StoreError::VersionMismatch {
                path,
                expected,
                actual,
            } => StoreError::VersionMismatch {
                path: f(&path),
                expected,
                actual,
            },
            StoreError::NotEmpty { path } => StoreError::NotEmpty { path: f(&path) },
            StoreError::NoParent { path } => StoreError::NoParent { path: f(&path) },
            StoreError::NoChildrenForEphemerals { path } => {
                StoreError::NoChildrenForEphemerals { path: f(&path) }
            }
            StoreError::TransactionFailed { index, cause } => StoreError::TransactionFailed {
                index,
                cause: Box::new(cause.map_path(f)),
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Cache already started")]
    AlreadyStarted,

    #[error("Cache is closed")]
    Closed,
}
