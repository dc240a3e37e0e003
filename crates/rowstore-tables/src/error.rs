//! Error types for table-level operations

use rowstore_core::StoreError;
use thiserror::Error;

/// Errors surfaced by the table interface
#[derive(Debug, Clone, Error)]
pub enum TableError {
    /// Failure inside the storage engine
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No table of that name exists
    #[error("Table '{0}' not found")]
    NotFound(String),

    /// Table name rejected before touching the filesystem
    #[error("Invalid table name '{name}': {reason}")]
    InvalidName {
        name: String,
        reason: &'static str,
    },

    /// Field type name not recognised
    #[error("Unknown field type '{0}'")]
    UnknownType(String),
}

/// Result type alias for table operations
pub type TableResult<T> = Result<T, TableError>;
