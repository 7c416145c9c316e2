//! Write engine facade
//!
//! Owns the instruction log, the compression relay, and the transaction
//! coordinator, and spawns the write worker. One engine drives one backend
//! store; a producer appends through a `LogWriter` over `log()` and kicks
//! execution off with `start_writing`.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::buffer::{Addr, InstructionLog, LogWriter};
use crate::config::Config;
use crate::coordinator::TxnCoordinator;
use crate::error::{EngineError, EngineResult};
use crate::progress::{Progress, ProgressSink, WriteHandle};
use crate::relay::{self, Compressor, CompressorRegistry, RelayHandle};
use crate::store::{Store, StoreTxn};
use crate::writer::WriteWorker;

struct EngineState {
    /// Where the last worker run stopped; the next resume starts here.
    resume_addr: Option<Addr>,
    /// Sink of the last started batch, reused by a respawning resume.
    sink: Option<Arc<dyn ProgressSink>>,
}

/// The asynchronous write engine over a backend store.
pub struct WriteEngine<S: Store> {
    store: Arc<S>,
    log: Arc<InstructionLog>,
    registry: Arc<CompressorRegistry>,
    coordinator: Arc<TxnCoordinator<S>>,
    relay: RelayHandle,
    state: Arc<Mutex<EngineState>>,
    config: Config,
}

impl<S: Store> WriteEngine<S> {
    /// Create an engine over `store`, starting the relay thread.
    pub fn new(store: Arc<S>, config: Config) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|message| EngineError::Config { message })?;

        let log = Arc::new(InstructionLog::new(&config));
        let registry = Arc::new(CompressorRegistry::new());
        let coordinator = Arc::new(TxnCoordinator::new(Arc::clone(&store)));

        let wake_coord = Arc::clone(&coordinator);
        let relay = relay::start_relay(
            Arc::clone(&log),
            Arc::clone(&registry),
            Arc::new(move || wake_coord.wake()),
        )?;

        Ok(Self {
            store,
            log,
            registry,
            coordinator,
            relay,
            state: Arc::new(Mutex::new(EngineState { resume_addr: None, sink: None })),
            config,
        })
    }

    /// The shared instruction log (for building `LogWriter`s and polling
    /// instruction status).
    pub fn log(&self) -> Arc<InstructionLog> {
        Arc::clone(&self.log)
    }

    /// The backend store.
    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Convenience constructor for a producer over this engine's log.
    pub fn writer(&self) -> LogWriter {
        LogWriter::new(Arc::clone(&self.log), &self.config)
    }

    /// Register a value compressor, returning the id producers reference.
    pub fn register_compressor(&self, compressor: Arc<dyn Compressor>) -> u32 {
        self.registry.register(compressor)
    }

    /// Queue a compressible chain head for the relay thread.
    pub fn compress(&self, slot: Addr) {
        self.relay.kick(slot);
    }

    /// Relay counters: values compressed and values stored raw.
    pub fn compression_totals(&self) -> (u64, u64) {
        (self.registry.compressed_total(), self.registry.skipped_total())
    }

    /// Start the asynchronous write worker at `start`. Fails if a worker
    /// is already running; the returned handle resumes, finishes, and
    /// joins the run.
    pub fn start_writing(
        &self,
        start: Addr,
        sink: Arc<dyn ProgressSink>,
    ) -> EngineResult<WriteHandle> {
        self.coordinator.worker_started()?;
        {
            let mut state = self.state.lock();
            state.sink = Some(Arc::clone(&sink));
            state.resume_addr = None;
        }
        self.spawn_worker(start, sink)
    }

    /// Resume writing: wake a parked worker, or restart one at the address
    /// the last run stopped at. With no parked worker and no stopped run
    /// this is a no-op. Returns a handle when a new worker was spawned.
    pub fn resume(&self) -> EngineResult<Option<WriteHandle>> {
        if self.coordinator.resume() {
            return Ok(None);
        }
        let (addr, sink) = {
            let mut state = self.state.lock();
            match (state.resume_addr.take(), state.sink.clone()) {
                (Some(addr), Some(sink)) => (addr, sink),
                (addr, _) => {
                    state.resume_addr = addr;
                    return Ok(None);
                }
            }
        };
        if self.coordinator.worker_started().is_err() {
            // A worker appeared in the window; it will see the new work.
            let mut state = self.state.lock();
            state.resume_addr = Some(addr);
            return Ok(None);
        }
        self.spawn_worker(addr, sink).map(Some)
    }

    /// Ask the running worker to commit at its next boundary and stop.
    pub fn finish(&self) {
        self.coordinator.finish();
    }

    fn spawn_worker(&self, start: Addr, sink: Arc<dyn ProgressSink>) -> EngineResult<WriteHandle> {
        let worker = WriteWorker {
            log: Arc::clone(&self.log),
            registry: Arc::clone(&self.registry),
            coordinator: Arc::clone(&self.coordinator),
            store: Arc::clone(&self.store),
            sink: Arc::clone(&sink),
            config: self.config.clone(),
        };
        let coordinator = Arc::clone(&self.coordinator);
        let state = Arc::clone(&self.state);

        let thread = thread::Builder::new()
            .name("inklog-writer".to_string())
            .spawn(move || {
                let result = worker.run(start);
                match &result {
                    Ok(addr) => {
                        let mut state = state.lock();
                        state.resume_addr = Some(*addr);
                    }
                    Err(e) => {
                        eprintln!("[WRITER] batch ended with error: {}", e);
                    }
                }
                coordinator.worker_finished();
                if result.is_ok() {
                    sink.notify(Progress::BatchDone);
                }
                result
            })
            .map_err(|e| {
                self.coordinator.worker_finished();
                EngineError::WorkerFailed {
                    message: format!("Failed to spawn write worker: {}", e),
                }
            })?;

        let resume_coord = Arc::clone(&self.coordinator);
        let finish_coord = Arc::clone(&self.coordinator);
        Ok(WriteHandle::new(
            thread,
            Box::new(move || {
                resume_coord.resume();
            }),
            Box::new(move || {
                finish_coord.finish();
            }),
        ))
    }

    /// Execute a batch synchronously on the calling thread. Takes the
    /// write transaction through the coordinator (interrupting a parked
    /// worker if needed) and commits when the stream runs dry.
    pub fn write(&self, start: Addr) -> EngineResult<()> {
        let txn = self.coordinator.acquire()?;
        let worker = WriteWorker {
            log: Arc::clone(&self.log),
            registry: Arc::clone(&self.registry),
            coordinator: Arc::clone(&self.coordinator),
            store: Arc::clone(&self.store),
            sink: Arc::new(crate::progress::NullSink),
            config: self.config.clone(),
        };
        let result = worker.run_sync(txn, start);
        self.coordinator.release();
        result.map(|_| ())
    }

    /// Run `f` inside an exclusively held write transaction, committing on
    /// Ok and aborting on Err. Interrupts a parked worker if needed.
    pub fn transaction_sync<R>(
        &self,
        f: impl FnOnce(&mut S::Txn) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut txn = self.coordinator.acquire()?;
        let result = f(&mut txn);
        let result = match result {
            Ok(r) => match txn.commit() {
                Ok(()) => Ok(r),
                Err(e) => Err(EngineError::from_store("commit", e)),
            },
            Err(e) => {
                txn.abort();
                Err(e)
            }
        };
        self.coordinator.release();
        result
    }

    /// Inspect the parked worker transaction, if one is deposited. The
    /// worker stays parked for the duration of `f`.
    pub fn with_current_txn<R>(&self, f: impl FnOnce(&mut S::Txn) -> R) -> EngineResult<R> {
        self.coordinator.with_parked_txn(f)
    }
}
