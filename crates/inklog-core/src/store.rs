//! Backend store traits
//!
//! The write loop drives any transactional KV backend through these traits.
//! Conflict outcomes (key exists, key not found) are first-class results
//! because the engine converts them into FAILED_CONDITION status rather
//! than ending the batch.

use std::fmt;
use std::error::Error;

use crate::error::EngineError;
use crate::instruction;

/// Database handle within a store. Stores hand these out when a database
/// is opened; instructions carry them to name their target database.
pub type Dbi = u32;

/// Backend operation outcome that is not a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key (or duplicate value) already exists and overwrite was refused
    KeyExist,
    /// The key (or duplicate value) was not found
    NotFound,
    /// The backend failed in a way that must end the batch
    Fatal {
        /// Backend error description
        message: String,
    },
}

impl StoreError {
    /// Conflicts are reported through instruction status bits; everything
    /// else aborts the transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::KeyExist | StoreError::NotFound)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::KeyExist => write!(f, "key already exists"),
            StoreError::NotFound => write!(f, "key not found"),
            StoreError::Fatal { message } => write!(f, "store failure: {}", message),
        }
    }
}

impl Error for StoreError {}

impl EngineError {
    /// Wrap a fatal store error with the operation that hit it.
    pub fn from_store(op: &'static str, err: StoreError) -> Self {
        EngineError::Store {
            op,
            message: err.to_string(),
        }
    }
}

/// Put behavior bits forwarded from the instruction flags to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutFlags {
    /// Fail with KeyExist instead of replacing an existing value
    pub no_overwrite: bool,
    /// In a dupsort database, fail with KeyExist on an exact duplicate
    pub no_dup_data: bool,
    /// The key sorts after every existing key; backend may fast-path
    pub append: bool,
}

impl PutFlags {
    /// Extract the passthrough bits from an instruction flags word.
    pub fn from_instruction(flags: u32) -> Self {
        Self {
            no_overwrite: flags & instruction::NO_OVERWRITE != 0,
            no_dup_data: flags & instruction::NO_DUP_DATA != 0,
            append: flags & instruction::APPEND != 0,
        }
    }
}

/// One write transaction over the backend.
///
/// A transaction is owned by exactly one thread at a time. The coordinator
/// moves it between the write worker and a foreground caller but never
/// shares it.
pub trait StoreTxn: Send {
    /// Monotonic id of this transaction (assigned at begin).
    fn id(&self) -> u64;

    /// Read a value. For dupsort databases this returns the first duplicate.
    fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a value under a key.
    fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8], flags: PutFlags) -> Result<(), StoreError>;

    /// Delete a key and all its values.
    fn del(&mut self, dbi: Dbi, key: &[u8]) -> Result<(), StoreError>;

    /// Delete one specific value under a key (dupsort databases).
    fn del_value(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Empty a database, or delete its handle entirely when `delete` is set.
    fn drop_db(&mut self, dbi: Dbi, delete: bool) -> Result<(), StoreError>;

    /// Commit all writes atomically.
    fn commit(self) -> Result<(), StoreError>;

    /// Discard all writes.
    fn abort(self);
}

/// A transactional KV backend the write engine can drive.
pub trait Store: Send + Sync + 'static {
    /// The write transaction type.
    type Txn: StoreTxn;

    /// Begin the single write transaction. Implementations enforce that at
    /// most one write transaction exists at a time.
    fn begin_write(&self) -> Result<Self::Txn, StoreError>;

    /// Id of the most recently committed write transaction.
    fn last_committed_txn_id(&self) -> u64;

    /// Make all committed transactions durable.
    fn sync(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(StoreError::KeyExist.is_conflict());
        assert!(StoreError::NotFound.is_conflict());
        assert!(!StoreError::Fatal { message: "disk gone".into() }.is_conflict());
    }

    #[test]
    fn test_put_flags_extraction() {
        let flags = instruction::PUT | instruction::NO_OVERWRITE | instruction::APPEND;
        let put = PutFlags::from_instruction(flags);
        assert!(put.no_overwrite);
        assert!(!put.no_dup_data);
        assert!(put.append);
    }

    #[test]
    fn test_fatal_wrap() {
        let err = EngineError::from_store("put", StoreError::Fatal { message: "oom".into() });
        match err {
            EngineError::Store { op, message } => {
                assert_eq!(op, "put");
                assert!(message.contains("oom"));
            }
            _ => panic!("Expected Store error"),
        }
    }
}
