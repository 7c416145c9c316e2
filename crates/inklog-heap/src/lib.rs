//! Inklog Heap — RAM-first transactional backend
//!
//! A key-value backend for the inklog write engine. All committed data
//! lives in hash tables; a batch-framed write-ahead log makes commits
//! crash-atomic and rebuilds the tables on restart. Includes an LZ4
//! compressor for the engine's compression relay.
//!
//! # Layout
//!
//! - `store`: the `Store`/`StoreTxn` implementation (overlay transactions
//!   over shared tables)
//! - `wal` / `format`: batch-framed durability with CRC32C records
//! - `durability`: platform sync primitives
//! - `compress`: LZ4 value framing for the relay

pub mod compress;
pub mod durability;
pub mod error;
pub mod format;
pub mod store;
pub mod wal;

pub use compress::Lz4Compressor;
pub use error::{HeapError, HeapResult};
pub use format::WalRecord;
pub use store::{HeapConfig, HeapStore, HeapTxn};
pub use wal::{WalReader, WalWriter};
