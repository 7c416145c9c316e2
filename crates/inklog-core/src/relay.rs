//! Compression relay
//!
//! Large values are parked behind a six-word compression slot in the log.
//! A background relay thread walks the chain of slots and compresses each
//! value off the producer's thread. The write loop may reach a slot first;
//! whoever wins the atomic exchange on the claim word does the work, so
//! each value is compressed exactly once no matter how the race lands.
//!
//! If the write loop arrives while compression is in flight it parks a
//! waiting sentinel in the status word; the relay swaps in the final status
//! and wakes the engine condvar. Compression never fails a write: a missing
//! compressor, missing data, or an incompressible value just stores the
//! original bytes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::buffer::{
    Addr, InstructionLog, SLOT_CLAIM, SLOT_DONE, SLOT_HANDLE, SLOT_NEXT_HI, SLOT_NEXT_LO,
    SLOT_SKIPPED, SLOT_STATUS, SLOT_WAITING,
};
use crate::error::{EngineError, EngineResult};

/// A value compressor. Returning None stores the original bytes.
pub trait Compressor: Send + Sync + 'static {
    /// Compress `data`, or decline (too small, incompressible, failed).
    fn compress(&self, data: &[u8]) -> Option<Vec<u8>>;
}

/// Registered compressors, addressed by the id carried in compression
/// slots. Also keeps the relay counters, since inline steals by the write
/// loop count the same as relay work.
pub struct CompressorRegistry {
    compressors: RwLock<Vec<Arc<dyn Compressor>>>,
    compressed: AtomicU64,
    skipped: AtomicU64,
}

impl CompressorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            compressors: RwLock::new(Vec::new()),
            compressed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Register a compressor, returning its id.
    pub fn register(&self, compressor: Arc<dyn Compressor>) -> u32 {
        let mut list = self.compressors.write();
        list.push(compressor);
        (list.len() - 1) as u32
    }

    fn get(&self, id: u32) -> Option<Arc<dyn Compressor>> {
        let list = self.compressors.read();
        list.get(id as usize).cloned()
    }

    /// Values compressed since startup.
    pub fn compressed_total(&self) -> u64 {
        self.compressed.load(Ordering::Relaxed)
    }

    /// Values stored raw (declined or unresolvable) since startup.
    pub fn skipped_total(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self { Self::new() }
}

/// Claim and process one compression slot. Returns false if another thread
/// already owned the claim. `wake` is invoked when a parked write loop was
/// waiting on this slot.
pub(crate) fn compress_slot(
    log: &InstructionLog,
    registry: &CompressorRegistry,
    slot: Addr,
    wake: &dyn Fn(),
) -> bool {
    let claim = log.swap(slot + SLOT_CLAIM as u64, 0);
    if claim == 0 {
        return false;
    }
    let compressor_id = claim - 1;

    let handle = log.load(slot + SLOT_HANDLE as u64);
    let data = log.arena().peek(handle);

    let status = match (registry.get(compressor_id), data) {
        (Some(compressor), Some(bytes)) => match compressor.compress(&bytes) {
            Some(out) => {
                registry.compressed.fetch_add(1, Ordering::Relaxed);
                SLOT_DONE | log.arena().insert(Arc::from(out))
            }
            None => {
                registry.skipped.fetch_add(1, Ordering::Relaxed);
                SLOT_SKIPPED
            }
        },
        _ => {
            registry.skipped.fetch_add(1, Ordering::Relaxed);
            SLOT_SKIPPED
        }
    };

    let prev = log.swap(slot + SLOT_STATUS as u64, status);
    if prev == SLOT_WAITING {
        wake();
    }
    true
}

/// Walk a compressible chain starting at `slot`. Slots another thread
/// claimed are skipped; the link is always followed so a steal in the
/// middle never strands the tail. Returns the number of slots this walk
/// compressed or skipped itself.
pub(crate) fn walk_chain(
    log: &InstructionLog,
    registry: &CompressorRegistry,
    mut slot: Addr,
    wake: &dyn Fn(),
) -> u32 {
    let mut processed = 0;
    loop {
        if compress_slot(log, registry, slot, wake) {
            processed += 1;
        }
        let lo = log.load(slot + SLOT_NEXT_LO as u64) as u64;
        let hi = log.load(slot + SLOT_NEXT_HI as u64) as u64;
        let next = lo | (hi << 32);
        if next == 0 {
            return processed;
        }
        slot = next;
    }
}

struct RelayShared {
    queue: Mutex<VecDeque<Addr>>,
    work: Condvar,
    shutdown: AtomicBool,
}

/// Handle to the running relay thread. Dropping it stops the thread.
pub struct RelayHandle {
    shared: Arc<RelayShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Queue a chain head for background compression.
    pub fn kick(&self, slot: Addr) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(slot);
        self.shared.work.notify_one();
    }

    /// Check if the relay thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Request shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.shared.queue.lock();
            self.shared.work.notify_all();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the relay background thread.
///
/// `wake` is called whenever a slot completes that the write loop was
/// parked on; the engine routes it to the coordinator condvar.
pub fn start_relay(
    log: Arc<InstructionLog>,
    registry: Arc<CompressorRegistry>,
    wake: Arc<dyn Fn() + Send + Sync>,
) -> EngineResult<RelayHandle> {
    let shared = Arc::new(RelayShared {
        queue: Mutex::new(VecDeque::new()),
        work: Condvar::new(),
        shutdown: AtomicBool::new(false),
    });
    let shared_clone = Arc::clone(&shared);

    let thread = thread::Builder::new()
        .name("inklog-relay".to_string())
        .spawn(move || {
            relay_loop(log, registry, shared_clone, wake);
        })
        .map_err(|e| EngineError::WorkerFailed {
            message: format!("Failed to spawn relay thread: {}", e),
        })?;

    Ok(RelayHandle {
        shared,
        thread: Some(thread),
    })
}

/// Main relay loop — runs on the background thread.
fn relay_loop(
    log: Arc<InstructionLog>,
    registry: Arc<CompressorRegistry>,
    shared: Arc<RelayShared>,
    wake: Arc<dyn Fn() + Send + Sync>,
) {
    loop {
        let slot = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(slot) = queue.pop_front() {
                    break slot;
                }
                shared.work.wait(&mut queue);
            }
        };
        walk_chain(&log, &registry, slot, &*wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{CompressionSettings, LogWriter, PutOptions};
    use crate::config::Config;
    use std::time::Duration;

    /// Halves runs of repeated bytes; declines short inputs.
    struct TestCompressor;

    impl Compressor for TestCompressor {
        fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
            if data.len() < 16 {
                return None;
            }
            Some(data[..data.len() / 2].to_vec())
        }
    }

    fn chain_of(count: usize) -> (Arc<InstructionLog>, Arc<CompressorRegistry>, Addr) {
        let config = Config::compact();
        let log = Arc::new(InstructionLog::new(&config));
        let registry = Arc::new(CompressorRegistry::new());
        let id = registry.register(Arc::new(TestCompressor));

        let mut writer = LogWriter::new(Arc::clone(&log), &config)
            .with_compression(CompressionSettings { compressor: id, threshold: 64 });
        let value = vec![9u8; 200];
        for i in 0..count {
            let key = format!("k{}", i);
            writer
                .put(0, key.as_bytes(), &value, PutOptions { compressible: true, ..Default::default() })
                .unwrap();
        }
        let head = writer.take_compression_kick().expect("chain head");
        (log, registry, head)
    }

    #[test]
    fn test_claim_is_exactly_once() {
        let (log, registry, head) = chain_of(1);
        assert!(compress_slot(&log, &registry, head, &|| {}));
        assert!(!compress_slot(&log, &registry, head, &|| {}));
        assert_eq!(registry.compressed_total(), 1);
    }

    #[test]
    fn test_walk_processes_whole_chain() {
        let (log, registry, head) = chain_of(5);
        let processed = walk_chain(&log, &registry, head, &|| {});
        assert_eq!(processed, 5);
        assert_eq!(registry.compressed_total(), 5);
        // The compressed bytes landed in the arena.
        let status = log.load(head + SLOT_STATUS as u64);
        assert!(status & SLOT_DONE != 0);
        let compressed = log.arena().peek(status & !SLOT_DONE).unwrap();
        assert_eq!(compressed.len(), 100);
    }

    #[test]
    fn test_walk_skips_stolen_slot_but_follows_link() {
        let (log, registry, head) = chain_of(3);
        // Simulate the write loop stealing the head.
        assert!(compress_slot(&log, &registry, head, &|| {}));
        let processed = walk_chain(&log, &registry, head, &|| {});
        assert_eq!(processed, 2);
        assert_eq!(registry.compressed_total(), 3);
    }

    #[test]
    fn test_waiting_sentinel_triggers_wake() {
        let (log, registry, head) = chain_of(1);
        log.store(head + SLOT_STATUS as u64, SLOT_WAITING);
        let woke = AtomicBool::new(false);
        compress_slot(&log, &registry, head, &|| {
            woke.store(true, Ordering::Relaxed);
        });
        assert!(woke.load(Ordering::Relaxed));
    }

    #[test]
    fn test_missing_compressor_stores_raw() {
        let config = Config::compact();
        let log = Arc::new(InstructionLog::new(&config));
        let registry = Arc::new(CompressorRegistry::new());
        // Claim word references compressor id 6 which was never registered.
        let mut writer = LogWriter::new(Arc::clone(&log), &config)
            .with_compression(CompressionSettings { compressor: 6, threshold: 10 });
        writer
            .put(0, b"k", &vec![1u8; 100], PutOptions { compressible: true, ..Default::default() })
            .unwrap();
        let head = writer.take_compression_kick().unwrap();

        assert!(compress_slot(&log, &registry, head, &|| {}));
        assert_eq!(log.load(head + SLOT_STATUS as u64), SLOT_SKIPPED);
        assert_eq!(registry.skipped_total(), 1);
    }

    #[test]
    fn test_relay_thread_start_kick_shutdown() {
        let (log, registry, head) = chain_of(2);
        let handle = start_relay(Arc::clone(&log), Arc::clone(&registry), Arc::new(|| {})).unwrap();
        assert!(handle.is_running());

        handle.kick(head);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while registry.compressed_total() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(registry.compressed_total(), 2);
        handle.shutdown();
    }

    #[test]
    fn test_concurrent_claim_single_winner() {
        let (log, registry, head) = chain_of(1);
        let winners: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let log = &log;
                    let registry = &registry;
                    s.spawn(move || compress_slot(log, registry, head, &|| {}))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);
        assert_eq!(registry.compressed_total(), 1);
    }
}
