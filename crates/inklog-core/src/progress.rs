//! Progress reporting from the write worker to the caller
//!
//! The worker reports three kinds of events: a transaction boundary was
//! committed, a user callback instruction was reached, and the batch run
//! ended. Reporting is fire-and-forget; resumption always travels the
//! other way, through `WriteHandle::resume` / `WriteHandle::finish`. A
//! strict-order callback parks the worker until the resume arrives.

use std::thread;

use crate::buffer::Addr;
use crate::error::{EngineError, EngineResult};

/// One progress event from the write worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// The batch run ended; the worker thread is returning.
    BatchDone,
    /// A transaction committed at a stream boundary.
    TxnBoundary {
        /// Id of the committed transaction.
        txn_id: u64,
    },
    /// A user callback instruction was reached.
    UserCallback {
        /// Log address of the callback instruction, for correlation.
        addr: Addr,
        /// The worker is parked until `resume` when set.
        strict: bool,
    },
}

/// Receiver for worker progress events. Called from the worker thread.
pub trait ProgressSink: Send + Sync + 'static {
    /// Deliver one event. Must not block for long; the write loop is
    /// stalled for the duration.
    fn notify(&self, progress: Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(Progress) + Send + Sync + 'static,
{
    fn notify(&self, progress: Progress) {
        self(progress)
    }
}

/// Sink that drops every event, for callers that only poll instruction
/// status words.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn notify(&self, _progress: Progress) {}
}

/// Handle to a running write worker. Dropping the handle requests the
/// batch to finish and waits for the thread.
pub struct WriteHandle {
    thread: Option<thread::JoinHandle<EngineResult<Addr>>>,
    resume: Box<dyn Fn() + Send + Sync>,
    finish: Box<dyn Fn() + Send + Sync>,
}

impl WriteHandle {
    pub(crate) fn new(
        thread: thread::JoinHandle<EngineResult<Addr>>,
        resume: Box<dyn Fn() + Send + Sync>,
        finish: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self { thread: Some(thread), resume, finish }
    }

    /// Wake a parked worker: new instructions were appended, or a strict
    /// callback is acknowledged. A worker that is not parked ignores this.
    pub fn resume(&self) {
        (self.resume)()
    }

    /// Ask the worker to commit at its next boundary and end the run.
    pub fn finish(&self) {
        (self.finish)()
    }

    /// Check if the worker thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Wait for the worker to end. Returns the log address where the run
    /// stopped, which a later batch can resume from.
    pub fn join(mut self) -> EngineResult<Addr> {
        match self.thread.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(EngineError::WorkerFailed {
                    message: "write worker thread panicked".to_string(),
                }),
            },
            None => Err(EngineError::WorkerFailed {
                message: "write worker already joined".to_string(),
            }),
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            (self.finish)();
            let _ = handle.join();
        }
    }
}
