//! Transaction coordinator
//!
//! The backend allows exactly one write transaction. The write worker
//! normally owns it; foreground callers that need synchronous access take
//! it over through an interruption handshake:
//!
//! - the worker parks in AllowCommit at a top-level boundary
//! - the foreground posts InterruptBatch and waits
//! - the worker commits what it has, posts RestartWorkerTxn, and waits
//! - the foreground begins its own transaction, works, and unlocks
//! - the worker begins a fresh transaction and resumes where it left off
//!
//! Interruption is only granted from AllowCommit. A worker parked for a
//! strict-order callback is not interruptible and the foreground caller
//! gets a lock error instead of blocking forever.
//!
//! All handoffs ride one mutex and one condvar. State changes go through
//! the pure `transition` function so the legal moves stay in one table.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{EngineError, EngineResult};
use crate::store::{Store, StoreTxn};

/// Coordinator state. One of these holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// No handoff in progress; the worker (if any) owns the transaction.
    Idle,
    /// The worker is parked at a boundary and willing to commit.
    AllowCommit,
    /// A foreground caller asked the parked worker to commit and yield.
    InterruptBatch,
    /// The worker committed and yielded; the foreground caller may begin.
    RestartWorkerTxn,
    /// A foreground caller holds the write transaction.
    UserHasLock,
}

/// Events that move the coordinator between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordEvent {
    /// The worker parked at a boundary with allow-commit set.
    WorkerPark,
    /// The worker left its parked state (resumed or finishing).
    WorkerResume,
    /// A foreground caller requested interruption.
    ForegroundInterrupt,
    /// The parked worker committed in response to interruption.
    WorkerCommitted,
    /// The interrupting foreground caller finished and released.
    ForegroundDone,
    /// A foreground caller took the lock with no worker to interrupt.
    ForegroundLock,
    /// A foreground lock holder released.
    ForegroundUnlock,
}

/// The legal state moves. Returns None for a move the protocol forbids.
pub fn transition(state: Interruption, event: CoordEvent) -> Option<Interruption> {
    use CoordEvent::*;
    use Interruption::*;
    match (state, event) {
        (Idle, WorkerPark) => Some(AllowCommit),
        (AllowCommit, WorkerResume) => Some(Idle),
        (AllowCommit, ForegroundInterrupt) => Some(InterruptBatch),
        (InterruptBatch, WorkerCommitted) => Some(RestartWorkerTxn),
        (RestartWorkerTxn, ForegroundDone) => Some(Idle),
        (Idle, ForegroundLock) => Some(UserHasLock),
        (UserHasLock, ForegroundUnlock) => Some(Idle),
        _ => None,
    }
}

/// Why a parked worker woke up.
pub(crate) enum ParkOutcome<T> {
    /// Continue the batch, possibly with new instructions present.
    Resumed(T),
    /// Commit at this boundary and end the run.
    Finish(T),
}

enum ResumeSignal {
    Continue,
    Finish,
}

struct Inner<S: Store> {
    state: Interruption,
    parked: Option<S::Txn>,
    worker_active: bool,
    worker_waiting: bool,
    resume: Option<ResumeSignal>,
    finish_pending: bool,
    interrupt_failed: bool,
}

/// Coordinates the single write transaction between the write worker and
/// foreground callers.
pub struct TxnCoordinator<S: Store> {
    store: Arc<S>,
    inner: Mutex<Inner<S>>,
    cond: Condvar,
}

impl<S: Store> TxnCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner {
                state: Interruption::Idle,
                parked: None,
                worker_active: false,
                worker_waiting: false,
                resume: None,
                finish_pending: false,
                interrupt_failed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Current state, for introspection and tests.
    pub fn state(&self) -> Interruption {
        self.inner.lock().state
    }

    /// Register the write worker before its thread starts.
    pub(crate) fn worker_started(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if inner.worker_active {
            return Err(EngineError::Locked {
                reason: "a write worker is already running".to_string(),
            });
        }
        inner.worker_active = true;
        Ok(())
    }

    /// Deregister the worker when its run ends, for any reason.
    pub(crate) fn worker_finished(&self) {
        let mut inner = self.inner.lock();
        inner.worker_active = false;
        inner.worker_waiting = false;
        inner.finish_pending = false;
        inner.resume = None;
        self.cond.notify_all();
    }

    /// Park the worker with its transaction. `work_ready` is re-checked
    /// under the lock before every sleep, so a resume signal dropped in the
    /// producer race is never needed: published work is its own wakeup
    /// proof. Interruption is handled inside: the transaction is committed,
    /// the foreground caller runs, and a fresh transaction comes back.
    pub(crate) fn park(
        &self,
        txn: S::Txn,
        allow_commit: bool,
        work_ready: impl Fn() -> bool,
    ) -> EngineResult<ParkOutcome<S::Txn>> {
        let mut inner = self.inner.lock();
        inner.parked = Some(txn);
        inner.worker_waiting = true;
        if allow_commit {
            if let Some(next) = transition(inner.state, CoordEvent::WorkerPark) {
                inner.state = next;
            }
        }

        loop {
            if inner.finish_pending || matches!(inner.resume, Some(ResumeSignal::Finish)) {
                inner.finish_pending = false;
                inner.resume = None;
                return Ok(ParkOutcome::Finish(self.unpark(&mut inner)?));
            }
            if inner.resume.take().is_some() || work_ready() {
                return Ok(ParkOutcome::Resumed(self.unpark(&mut inner)?));
            }
            if inner.state == Interruption::InterruptBatch {
                let txn = match inner.parked.take() {
                    Some(t) => t,
                    None => {
                        return Err(EngineError::Locked {
                            reason: "parked transaction missing during interruption".to_string(),
                        })
                    }
                };
                match txn.commit() {
                    Ok(()) => {
                        if let Some(next) = transition(inner.state, CoordEvent::WorkerCommitted) {
                            inner.state = next;
                        }
                        self.cond.notify_all();
                        while inner.state != Interruption::Idle {
                            self.cond.wait(&mut inner);
                        }
                        let fresh = self.store.begin_write().map_err(|e| {
                            inner.worker_waiting = false;
                            EngineError::from_store("begin", e)
                        })?;
                        inner.parked = Some(fresh);
                        if allow_commit {
                            if let Some(next) = transition(inner.state, CoordEvent::WorkerPark) {
                                inner.state = next;
                            }
                        }
                        continue;
                    }
                    Err(e) => {
                        // Fatal batch end. Unblock the foreground caller
                        // with a failure instead of a transaction.
                        inner.state = Interruption::Idle;
                        inner.worker_waiting = false;
                        inner.interrupt_failed = true;
                        self.cond.notify_all();
                        return Err(EngineError::from_store("commit", e));
                    }
                }
            }
            self.cond.wait(&mut inner);
        }
    }

    fn unpark(&self, inner: &mut Inner<S>) -> EngineResult<S::Txn> {
        inner.worker_waiting = false;
        if let Some(next) = transition(inner.state, CoordEvent::WorkerResume) {
            inner.state = next;
        }
        inner.parked.take().ok_or_else(|| EngineError::Locked {
            reason: "parked transaction missing on wake".to_string(),
        })
    }

    /// Wake a parked worker. Dropped when no worker is waiting: published
    /// instructions are re-checked on every park cycle, so a signal with
    /// nothing behind it must not cause a spurious boundary.
    pub(crate) fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.worker_waiting {
            inner.resume = Some(ResumeSignal::Continue);
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Ask the active worker to end its run at the next boundary. Sticky
    /// until the worker consumes it; a no-op with no active worker.
    pub(crate) fn finish(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.worker_active {
            inner.finish_pending = true;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Foreground acquisition of the write transaction. Interrupts a
    /// worker parked in AllowCommit; begins directly when no worker is
    /// active; refuses otherwise.
    pub(crate) fn acquire(&self) -> EngineResult<S::Txn> {
        let mut inner = self.inner.lock();

        if !inner.worker_active {
            match transition(inner.state, CoordEvent::ForegroundLock) {
                Some(next) => inner.state = next,
                None => {
                    return Err(EngineError::Locked {
                        reason: format!("coordinator is {:?}", inner.state),
                    })
                }
            }
            return self.store.begin_write().map_err(|e| {
                inner.state = Interruption::Idle;
                EngineError::from_store("begin", e)
            });
        }

        match transition(inner.state, CoordEvent::ForegroundInterrupt) {
            Some(next) => inner.state = next,
            None => {
                return Err(EngineError::Locked {
                    reason: "write worker is mid-batch and cannot be interrupted".to_string(),
                })
            }
        }
        self.cond.notify_all();

        while inner.state != Interruption::RestartWorkerTxn {
            if inner.interrupt_failed {
                inner.interrupt_failed = false;
                return Err(EngineError::Locked {
                    reason: "worker transaction failed to commit during interruption".to_string(),
                });
            }
            self.cond.wait(&mut inner);
        }

        self.store.begin_write().map_err(|e| {
            // Hand the turn back to the worker anyway.
            inner.state = Interruption::Idle;
            self.cond.notify_all();
            EngineError::from_store("begin", e)
        })
    }

    /// Release a transaction acquired with `acquire`. The transaction
    /// itself must already be committed or aborted by the caller.
    pub(crate) fn release(&self) {
        let mut inner = self.inner.lock();
        let event = match inner.state {
            Interruption::RestartWorkerTxn => CoordEvent::ForegroundDone,
            _ => CoordEvent::ForegroundUnlock,
        };
        if let Some(next) = transition(inner.state, event) {
            inner.state = next;
        } else {
            inner.state = Interruption::Idle;
        }
        self.cond.notify_all();
    }

    /// Borrow the parked worker transaction for a read-only window. Only
    /// available while the worker is parked with its transaction deposited.
    pub(crate) fn with_parked_txn<R>(
        &self,
        f: impl FnOnce(&mut S::Txn) -> R,
    ) -> EngineResult<R> {
        let mut inner = self.inner.lock();
        if inner.state != Interruption::AllowCommit && !inner.worker_waiting {
            return Err(EngineError::Locked {
                reason: "no parked transaction to inspect".to_string(),
            });
        }
        match inner.parked.as_mut() {
            Some(txn) => Ok(f(txn)),
            None => Err(EngineError::Locked {
                reason: "no parked transaction to inspect".to_string(),
            }),
        }
    }

    /// Sleep until `done` holds. Used by the write loop while a value is
    /// being compressed on the relay thread.
    pub(crate) fn wait_until(&self, done: impl Fn() -> bool) {
        let mut inner = self.inner.lock();
        while !done() {
            self.cond.wait(&mut inner);
        }
    }

    /// Wake every sleeper on the coordinator condvar. The relay calls this
    /// when a compression slot the write loop waits on completes.
    pub fn wake(&self) {
        let _inner = self.inner.lock();
        self.cond.notify_all();
    }
}
