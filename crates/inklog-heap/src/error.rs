//! Error types for the heap backend
//!
//! All backend errors are represented by the HeapError enum, which provides
//! detailed context for debugging and recovery.

use std::fmt;
use std::error::Error;
use std::path::PathBuf;

/// Heap backend error types with detailed context
#[derive(Debug, Clone)]
pub enum HeapError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Checksum verification failed
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted record
        offset: u64,
    },

    /// Torn write detected (partial record at end of file)
    TornWrite {
        /// Expected record size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where the torn write begins
        offset: u64,
    },

    /// Record size exceeds maximum allowed
    OversizedRecord {
        /// Size of the oversized record
        record_size: u64,
        /// Maximum allowed size
        max_size: u64,
    },

    /// Magic bytes not found at expected location
    NoMagicFound {
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Record type byte is not a known record type
    UnknownRecordType {
        /// The unrecognized type byte
        record_type: u8,
        /// Offset of the record header
        offset: u64,
    },

    /// Database handle is not open
    UnknownDatabase {
        /// The handle that was used
        dbi: u32,
    },

    /// An exclusive operation was refused while a write transaction is open
    WriterBusy {
        /// The operation that was refused
        op: &'static str,
    },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error at {}: {} ({:?})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({:?})", message, kind)
                }
            }
            HeapError::ChecksumMismatch { expected, actual, offset } => {
                write!(
                    f,
                    "Checksum mismatch at offset {}: expected {:#010x}, got {:#010x}",
                    offset, expected, actual
                )
            }
            HeapError::TornWrite { expected_size, available_bytes, offset } => {
                write!(
                    f,
                    "Torn write at offset {}: record needs {} bytes, only {} available",
                    offset, expected_size, available_bytes
                )
            }
            HeapError::OversizedRecord { record_size, max_size } => {
                write!(
                    f,
                    "Record size {} exceeds maximum {}",
                    record_size, max_size
                )
            }
            HeapError::NoMagicFound { offset, found_bytes } => {
                write!(
                    f,
                    "Magic bytes not found at offset {}: found {:02x?}",
                    offset, found_bytes
                )
            }
            HeapError::UnknownRecordType { record_type, offset } => {
                write!(
                    f,
                    "Unknown record type {:#04x} at offset {}",
                    record_type, offset
                )
            }
            HeapError::UnknownDatabase { dbi } => {
                write!(f, "Database handle {} is not open", dbi)
            }
            HeapError::WriterBusy { op } => {
                write!(f, "Operation '{}' refused: a write transaction is active", op)
            }
        }
    }
}

impl Error for HeapError {}

impl From<std::io::Error> for HeapError {
    fn from(e: std::io::Error) -> Self {
        HeapError::Io {
            path: None,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Result type alias for heap backend operations
pub type HeapResult<T> = Result<T, HeapError>;
