//! Error types for the inklog write engine
//!
//! All engine errors are represented by the EngineError enum. Conflict
//! outcomes (key exists, key not found) are NOT errors here — they flow
//! through instruction status bits instead. EngineError is reserved for
//! failures that end a batch or reject a request.

use std::fmt;
use std::error::Error;

/// Write engine error types with detailed context
#[derive(Debug, Clone)]
pub enum EngineError {
    /// The transaction lock could not be granted to the caller
    Locked {
        /// What was holding the lock or why the grant was refused
        reason: String,
    },

    /// A backend store operation failed fatally
    Store {
        /// The operation being applied when the store failed
        op: &'static str,
        /// Backend error description
        message: String,
    },

    /// An instruction word could not be decoded
    BadInstruction {
        /// Log address of the flags word
        address: u64,
        /// The raw flags value found there
        flags: u32,
    },

    /// Key length exceeds the configured maximum
    KeyTooLarge {
        /// Size of the offending key
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// A value handle referenced a slot that was already consumed or never filled
    ValueMissing {
        /// The arena handle that failed to resolve
        handle: u32,
    },

    /// Configuration rejected by validation
    Config {
        /// What was wrong with the configuration
        message: String,
    },

    /// The write worker thread panicked or could not be spawned
    WorkerFailed {
        /// Description of the failure
        message: String,
    },

    /// I/O error from engine-level file operations
    Io {
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Locked { reason } => {
                write!(f, "Transaction lock unavailable: {}", reason)
            }

            EngineError::Store { op, message } => {
                write!(f, "Store operation '{}' failed: {}", op, message)
            }

            EngineError::BadInstruction { address, flags } => {
                write!(f, "Undecodable instruction at address 0x{:x}: flags 0x{:08x}", address, flags)
            }

            EngineError::KeyTooLarge { size, max } => {
                write!(f, "Key too large: {} bytes exceeds limit of {} bytes", size, max)
            }

            EngineError::ValueMissing { handle } => {
                write!(f, "Value handle {} resolves to no data", handle)
            }

            EngineError::Config { message } => {
                write!(f, "Invalid configuration: {}", message)
            }

            EngineError::WorkerFailed { message } => {
                write!(f, "Write worker failed: {}", message)
            }

            EngineError::Io { kind, message } => {
                write!(f, "I/O error: {} ({})", message, kind)
            }
        }
    }
}

impl Error for EngineError {}

/// Convert std::io::Error to EngineError::Io
impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
