//! Inklog Core — Asynchronous Instruction-Log Write Engine
//!
//! A single-writer execution engine for transactional key-value stores.
//! Callers serialize writes into a shared instruction log; a dedicated
//! worker thread decodes and applies them inside the backend's one write
//! transaction, batching many operations per commit.
//!
//! # Architecture
//!
//! - **Instruction log**: segmented buffer of 32-bit words; producers
//!   publish instructions lock-free, the engine stamps status bits back
//! - **Compression relay**: background thread compresses large values
//!   before the write loop needs them, with an exactly-once claim protocol
//! - **Transaction coordinator**: hands the single write transaction
//!   between the worker and foreground callers without blocking either
//!   indefinitely
//! - **Write loop**: decode-dispatch with condition-block gating; key
//!   conflicts mark status bits, only real failures end a batch
//!
//! Backends implement the `Store`/`StoreTxn` traits; the engine itself
//! holds no storage.

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod instruction;
pub mod progress;
pub mod relay;
pub mod store;
pub mod writer;

// Re-export key types for convenience
pub use buffer::{
    Addr, CompressionSettings, Condition, InstructionLog, InstructionRef, LogWriter, PutOptions,
    ValueArena,
};
pub use config::Config;
pub use coordinator::{transition, CoordEvent, Interruption, TxnCoordinator};
pub use engine::WriteEngine;
pub use error::{EngineError, EngineResult};
pub use instruction::Opcode;
pub use progress::{NullSink, Progress, ProgressSink, WriteHandle};
pub use relay::{Compressor, CompressorRegistry, RelayHandle};
pub use store::{Dbi, PutFlags, Store, StoreError, StoreTxn};
