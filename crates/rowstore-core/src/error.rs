//! Error types for RowStore operations
//!
//! All storage-core errors are represented by the StoreError enum. Variants
//! carry enough context (path, offset, row id, field) to debug a failure
//! without re-running it.

use std::path::PathBuf;

use thiserror::Error;

use crate::value::RowId;

/// RowStore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", path_suffix(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Malformed condition rejected at construction time
    #[error("Condition error: {0}")]
    Condition(String),

    /// Checksum verification of an encoded blob failed
    #[error("Checksum mismatch{}: expected 0x{expected:08x}, got 0x{actual:08x}", path_suffix(.path))]
    ChecksumMismatch {
        /// File the blob came from, if any
        path: Option<PathBuf>,
        /// Checksum stored in the frame
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// Encoding or decoding through the object converter failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Row id has no ledger entry and no staged mutation
    #[error("Row {0} not found")]
    RowNotFound(RowId),

    /// Row id already registered in the ledger
    #[error("Row {0} already exists")]
    RowExists(RowId),

    /// Bytes read for a row do not match the ledger address
    #[error("Short read in {} at offset {position}: expected {expected} bytes, got {actual}", .path.display())]
    ShortRead {
        /// Row data file
        path: PathBuf,
        /// Ledger position of the row
        position: u64,
        /// Ledger size of the row
        expected: u64,
        /// Bytes actually available
        actual: u64,
    },

    /// Field is not part of the model, or its value has the wrong type
    #[error("Field '{field}': {reason}")]
    Field {
        /// Field name as given by the caller
        field: String,
        /// What went wrong
        reason: String,
    },

    /// Configuration rejected by `Config::validate`
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: &std::io::Error, what: &str) -> Self {
        StoreError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// Shorthand for a field error.
    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Field { field: field.into(), reason: reason.into() }
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

/// Result type alias for RowStore operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::ChecksumMismatch {
            path: Some(PathBuf::from("/tmp/table/model")),
            expected: 0x12345678,
            actual: 0x87654321,
        };

        let display = format!("{}", err);
        assert!(display.contains("Checksum mismatch"));
        assert!(display.contains("/tmp/table/model"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();

        match store_err {
            StoreError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_at_keeps_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StoreError::io_at("/data/row1", &io_err, "Failed to open row file");
        let display = err.to_string();
        assert!(display.contains("/data/row1"));
        assert!(display.contains("Failed to open row file"));
    }
}
