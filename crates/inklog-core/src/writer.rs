//! The write loop
//!
//! Decodes instructions from the log and applies them to the backend
//! inside the single write transaction. Condition blocks gate application
//! through two depth counters: an instruction is applied only while every
//! enclosing block validated. Key conflicts (exists / not found) mark the
//! instruction FAILED_CONDITION and the loop moves on; any other backend
//! error aborts the transaction and ends the batch.
//!
//! When the stream runs dry at the top level the worker parks with its
//! transaction open. New instructions extend the same transaction; a
//! resume or finish that finds the slot still empty commits at that slot,
//! stamps the boundary status bits, reports progress, and ends the run.

use std::sync::Arc;
use std::thread;

use crate::buffer::{
    Addr, Cursor, Decoded, InstructionLog, ValueRef, SLOT_CLAIM, SLOT_DONE, SLOT_HANDLE,
    SLOT_PENDING, SLOT_SKIPPED, SLOT_STATUS, SLOT_WAITING,
};
use crate::config::Config;
use crate::coordinator::{ParkOutcome, TxnCoordinator};
use crate::error::{EngineError, EngineResult};
use crate::instruction::{self, Opcode};
use crate::progress::{Progress, ProgressSink};
use crate::relay::{self, CompressorRegistry};
use crate::store::{PutFlags, Store, StoreTxn};

pub(crate) struct WriteWorker<S: Store> {
    pub log: Arc<InstructionLog>,
    pub registry: Arc<CompressorRegistry>,
    pub coordinator: Arc<TxnCoordinator<S>>,
    pub store: Arc<S>,
    pub sink: Arc<dyn ProgressSink>,
    pub config: Config,
}

impl<S: Store> WriteWorker<S> {
    /// Run an asynchronous batch from `start`. Returns the address the run
    /// stopped at, which a later batch resumes from.
    pub fn run(&self, start: Addr) -> EngineResult<Addr> {
        let txn = self
            .store
            .begin_write()
            .map_err(|e| EngineError::from_store("begin", e))?;
        self.run_loop(txn, start, false)
    }

    /// Run a batch synchronously inside a transaction the caller already
    /// acquired through the coordinator. No parking, no progress events;
    /// the boundary commit happens when the stream runs dry.
    pub fn run_sync(&self, txn: S::Txn, start: Addr) -> EngineResult<Addr> {
        self.run_loop(txn, start, true)
    }

    fn run_loop(&self, mut txn: S::Txn, start: Addr, sync: bool) -> EngineResult<Addr> {
        let mut cursor = Cursor::new(Arc::clone(&self.log), start);
        let mut condition_depth: u32 = 0;
        let mut validated_depth: u32 = 0;
        let mut finish_requested = false;

        loop {
            let inst = match cursor.decode_next() {
                Ok(inst) => inst,
                Err(e) => {
                    txn.abort();
                    return Err(e);
                }
            };

            match inst.op {
                Opcode::PointerNext => {}

                Opcode::NoInstructionYet => {
                    if condition_depth > 0 {
                        // The producer is mid-block; parking here could
                        // deadlock a resume that depends on the block
                        // committing. Spin until the slot fills.
                        for _ in 0..self.config.nested_spin {
                            std::hint::spin_loop();
                        }
                        thread::yield_now();
                        continue;
                    }

                    if sync || finish_requested {
                        return self.commit_boundary(txn, inst.addr, sync);
                    }

                    let addr = inst.addr;
                    let prev = self.log.fetch_or(addr, instruction::WAITING_OPERATION);
                    if prev & instruction::OP_MASK != 0 {
                        // Lost the race to a publishing producer.
                        self.log.fetch_and(addr, !instruction::WAITING_OPERATION);
                        continue;
                    }

                    let ready_log = Arc::clone(&self.log);
                    let ready = move || ready_log.load(addr) & instruction::OP_MASK != 0;
                    match self.coordinator.park(txn, true, ready) {
                        Ok(ParkOutcome::Resumed(t)) => {
                            txn = t;
                            if self.log.load(addr) & instruction::OP_MASK != 0 {
                                self.log.fetch_and(addr, !instruction::WAITING_OPERATION);
                                continue;
                            }
                            // Woken with nothing new: this is the batch end.
                            return self.commit_boundary(txn, addr, sync);
                        }
                        Ok(ParkOutcome::Finish(t)) => {
                            return self.commit_boundary(t, addr, sync);
                        }
                        Err(e) => return Err(e),
                    }
                }

                Opcode::StartBlock => {
                    condition_depth += 1;
                    if validated_depth == condition_depth - 1 {
                        validated_depth += 1;
                    }
                    self.log.fetch_or(inst.addr, instruction::FINISHED_OPERATION);
                }

                Opcode::StartConditionBlock | Opcode::StartConditionValueBlock => {
                    condition_depth += 1;
                    let enclosing_ok = validated_depth == condition_depth - 1;
                    let valid = if enclosing_ok {
                        match self.evaluate_condition(&txn, &inst) {
                            Ok(v) => v,
                            Err(e) => {
                                txn.abort();
                                return Err(e);
                            }
                        }
                    } else {
                        false
                    };
                    if valid {
                        validated_depth += 1;
                        self.log.fetch_or(inst.addr, instruction::FINISHED_OPERATION);
                    } else {
                        self.log.fetch_or(
                            inst.addr,
                            instruction::FINISHED_OPERATION | instruction::FAILED_CONDITION,
                        );
                    }
                }

                Opcode::BlockEnd => {
                    if condition_depth > 0 {
                        condition_depth -= 1;
                        if validated_depth > condition_depth {
                            validated_depth -= 1;
                        }
                    }
                    self.log.fetch_or(inst.addr, instruction::FINISHED_OPERATION);
                }

                Opcode::UserCallback => {
                    let strict = inst.flags & instruction::STRICT_ORDER != 0;
                    if !sync {
                        self.sink.notify(Progress::UserCallback { addr: inst.addr, strict });
                        if strict {
                            // Not a commit point; the park never enters the
                            // ALLOW_COMMIT window.
                            match self.coordinator.park(txn, false, || false) {
                                Ok(ParkOutcome::Resumed(t)) => txn = t,
                                Ok(ParkOutcome::Finish(t)) => {
                                    txn = t;
                                    finish_requested = true;
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                    self.log.fetch_or(inst.addr, instruction::FINISHED_OPERATION);
                }

                Opcode::Put | Opcode::Del | Opcode::DelValue | Opcode::DropDb => {
                    if validated_depth != condition_depth {
                        self.discard_value(&inst);
                        self.log.fetch_or(
                            inst.addr,
                            instruction::FINISHED_OPERATION | instruction::FAILED_CONDITION,
                        );
                        continue;
                    }

                    if let Some(expected) = inst.if_version {
                        match self.version_matches(&txn, &inst, expected) {
                            Ok(true) => {}
                            Ok(false) => {
                                self.discard_value(&inst);
                                self.log.fetch_or(
                                    inst.addr,
                                    instruction::FINISHED_OPERATION | instruction::FAILED_CONDITION,
                                );
                                continue;
                            }
                            Err(e) => {
                                txn.abort();
                                return Err(e);
                            }
                        }
                    }

                    match self.apply(&mut txn, &inst) {
                        Ok(applied) => {
                            let mut status = instruction::FINISHED_OPERATION;
                            if !applied {
                                status |= instruction::FAILED_CONDITION;
                            }
                            self.log.fetch_or(inst.addr, status);
                        }
                        Err(e) => {
                            txn.abort();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Apply one keyed operation. Ok(false) means a key conflict skipped
    /// it; fatal backend errors come back as Err.
    fn apply(&self, txn: &mut S::Txn, inst: &Decoded) -> EngineResult<bool> {
        let result = match inst.op {
            Opcode::Put => {
                let value = self.resolve_value(inst)?;
                let bytes = match inst.set_version {
                    Some(v) => {
                        let mut stamped = Vec::with_capacity(8 + value.len());
                        stamped.extend_from_slice(&v.to_bits().to_le_bytes());
                        stamped.extend_from_slice(&value);
                        stamped
                    }
                    None => value,
                };
                txn.put(inst.dbi, &inst.key, &bytes, PutFlags::from_instruction(inst.flags))
                    .map_err(|e| (e, "put"))
            }
            Opcode::Del => txn.del(inst.dbi, &inst.key).map_err(|e| (e, "del")),
            Opcode::DelValue => {
                let value = self.resolve_value(inst)?;
                txn.del_value(inst.dbi, &inst.key, &value).map_err(|e| (e, "del_value"))
            }
            Opcode::DropDb => {
                let delete = inst.flags & instruction::DELETE_DATABASE != 0;
                txn.drop_db(inst.dbi, delete).map_err(|e| (e, "drop_db"))
            }
            _ => Ok(()),
        };

        match result {
            Ok(()) => Ok(true),
            Err((e, _)) if e.is_conflict() => Ok(false),
            Err((e, op)) => Err(EngineError::from_store(op, e)),
        }
    }

    fn commit_boundary(&self, txn: S::Txn, addr: Addr, sync: bool) -> EngineResult<Addr> {
        let txn_id = txn.id();
        self.log.fetch_or(addr, instruction::TXN_DELIMITER);
        if let Err(e) = txn.commit() {
            return Err(EngineError::from_store("commit", e));
        }
        self.log
            .fetch_or(addr, instruction::TXN_COMMITTED | instruction::BATCH_DELIMITER);
        self.log.fetch_and(addr, !instruction::WAITING_OPERATION);

        if !sync {
            self.sink.notify(Progress::TxnBoundary { txn_id });
        }

        // Overlapping mode acknowledges the commit first, then makes it
        // durable; the store records the durable frontier inside sync().
        if self.config.overlapping_sync {
            if let Err(e) = self.store.sync() {
                return Err(EngineError::from_store("sync", e));
            }
        }
        Ok(addr)
    }

    fn evaluate_condition(&self, txn: &S::Txn, inst: &Decoded) -> EngineResult<bool> {
        if inst.op == Opcode::StartConditionValueBlock {
            let expected = self.resolve_value(inst)?;
            let stored = txn
                .get(inst.dbi, &inst.key)
                .map_err(|e| EngineError::from_store("get", e))?;
            return Ok(stored.as_deref() == Some(&expected[..]));
        }

        if let Some(expected) = inst.if_version {
            return self.version_matches(txn, inst, expected);
        }

        let exists = txn
            .get(inst.dbi, &inst.key)
            .map_err(|e| EngineError::from_store("get", e))?
            .is_some();
        if inst.flags & instruction::IF_NO_EXISTS != 0 {
            Ok(!exists)
        } else {
            Ok(exists)
        }
    }

    /// Compare the 8-byte version stamp at the head of the stored value.
    fn version_matches(&self, txn: &S::Txn, inst: &Decoded, expected: f64) -> EngineResult<bool> {
        let stored = txn
            .get(inst.dbi, &inst.key)
            .map_err(|e| EngineError::from_store("get", e))?;
        let matches = match stored {
            Some(bytes) if bytes.len() >= 8 => {
                let mut stamp = [0u8; 8];
                stamp.copy_from_slice(&bytes[..8]);
                f64::from_bits(u64::from_le_bytes(stamp)) == expected
            }
            _ => false,
        };
        Ok(matches)
    }

    fn resolve_value(&self, inst: &Decoded) -> EngineResult<Vec<u8>> {
        match &inst.value {
            None => Ok(Vec::new()),
            Some(ValueRef::Inline(bytes)) => Ok(bytes.clone()),
            Some(ValueRef::Handle(handle)) => self
                .log
                .arena()
                .take(*handle)
                .map(|a| a.to_vec())
                .ok_or(EngineError::ValueMissing { handle: *handle }),
            Some(ValueRef::Compressible { slot }) => self.resolve_compressible(*slot),
        }
    }

    /// Resolve a value behind a compression slot: steal the claim if the
    /// relay has not reached it, otherwise park a waiting sentinel and
    /// sleep until the relay finishes.
    fn resolve_compressible(&self, slot: Addr) -> EngineResult<Vec<u8>> {
        let coordinator = Arc::clone(&self.coordinator);
        let wake = move || coordinator.wake();
        relay::compress_slot(&self.log, &self.registry, slot, &wake);

        let status = self.wait_slot(slot);
        let orig = self.log.load(slot + SLOT_HANDLE as u64);
        if status & SLOT_DONE != 0 {
            let handle = status & !SLOT_DONE;
            let out = self
                .log
                .arena()
                .take(handle)
                .ok_or(EngineError::ValueMissing { handle })?;
            // The original is superseded; release its slot.
            let _ = self.log.arena().take(orig);
            return Ok(out.to_vec());
        }
        self.log
            .arena()
            .take(orig)
            .map(|a| a.to_vec())
            .ok_or(EngineError::ValueMissing { handle: orig })
    }

    /// Sleep until `slot` is done or skipped, parking a waiting sentinel in
    /// its status word. Returns the final status.
    fn wait_slot(&self, slot: Addr) -> u32 {
        let status_addr = slot + SLOT_STATUS as u64;
        loop {
            let status = self.log.load(status_addr);
            if status & SLOT_DONE != 0 || status == SLOT_SKIPPED {
                return status;
            }

            if status == SLOT_PENDING
                && self
                    .log
                    .compare_exchange(status_addr, SLOT_PENDING, SLOT_WAITING)
                    .is_err()
            {
                continue;
            }

            let wait_log = Arc::clone(&self.log);
            self.coordinator.wait_until(move || {
                let s = wait_log.load(status_addr);
                s & SLOT_DONE != 0 || s == SLOT_SKIPPED
            });
        }
    }

    /// Free the arena storage of a value whose instruction was skipped.
    /// Every value handle is consumed exactly once, applied or not.
    fn discard_value(&self, inst: &Decoded) {
        match &inst.value {
            Some(ValueRef::Handle(handle)) => {
                let _ = self.log.arena().take(*handle);
            }
            Some(ValueRef::Compressible { slot }) => self.discard_compressible(*slot),
            _ => {}
        }
    }

    /// Release both arena slots behind a skipped compressible value: the
    /// original, and the relay's output if compression already ran. Winning
    /// the claim keeps the relay from compressing a value nobody will read.
    fn discard_compressible(&self, slot: Addr) {
        let claim = self.log.swap(slot + SLOT_CLAIM as u64, 0);
        if claim != 0 {
            self.log.store(slot + SLOT_STATUS as u64, SLOT_SKIPPED);
        } else {
            let status = self.wait_slot(slot);
            if status & SLOT_DONE != 0 {
                let _ = self.log.arena().take(status & !SLOT_DONE);
            }
        }
        let orig = self.log.load(slot + SLOT_HANDLE as u64);
        let _ = self.log.arena().take(orig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{CompressionSettings, Condition, LogWriter, PutOptions};
    use crate::progress::NullSink;
    use crate::store::{Dbi, StoreError};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory backend double with just enough semantics for the loop:
    /// single table map, no dupsort, conflict errors on no-overwrite and
    /// missing deletes.
    struct MapStore {
        data: Mutex<HashMap<(Dbi, Vec<u8>), Vec<u8>>>,
        next_id: AtomicU64,
        committed: AtomicU64,
    }

    impl MapStore {
        fn new() -> Self {
            Self {
                data: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                committed: AtomicU64::new(0),
            }
        }
    }

    struct MapTxn {
        store: Arc<MapStore>,
        id: u64,
        overlay: HashMap<(Dbi, Vec<u8>), Option<Vec<u8>>>,
    }

    impl MapTxn {
        fn current(&self, dbi: Dbi, key: &[u8]) -> Option<Vec<u8>> {
            let k = (dbi, key.to_vec());
            match self.overlay.get(&k) {
                Some(v) => v.clone(),
                None => self.store.data.lock().get(&k).cloned(),
            }
        }
    }

    impl StoreTxn for MapTxn {
        fn id(&self) -> u64 {
            self.id
        }
        fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.current(dbi, key))
        }
        fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8], flags: PutFlags) -> Result<(), StoreError> {
            if flags.no_overwrite && self.current(dbi, key).is_some() {
                return Err(StoreError::KeyExist);
            }
            self.overlay.insert((dbi, key.to_vec()), Some(value.to_vec()));
            Ok(())
        }
        fn del(&mut self, dbi: Dbi, key: &[u8]) -> Result<(), StoreError> {
            if self.current(dbi, key).is_none() {
                return Err(StoreError::NotFound);
            }
            self.overlay.insert((dbi, key.to_vec()), None);
            Ok(())
        }
        fn del_value(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            match self.current(dbi, key) {
                Some(stored) if stored == value => {
                    self.overlay.insert((dbi, key.to_vec()), None);
                    Ok(())
                }
                _ => Err(StoreError::NotFound),
            }
        }
        fn drop_db(&mut self, dbi: Dbi, _delete: bool) -> Result<(), StoreError> {
            let keys: Vec<_> = {
                let data = self.store.data.lock();
                data.keys().filter(|(d, _)| *d == dbi).cloned().collect()
            };
            for k in keys {
                self.overlay.insert(k, None);
            }
            Ok(())
        }
        fn commit(self) -> Result<(), StoreError> {
            let mut data = self.store.data.lock();
            for (k, v) in self.overlay {
                match v {
                    Some(value) => {
                        data.insert(k, value);
                    }
                    None => {
                        data.remove(&k);
                    }
                }
            }
            self.store.committed.store(self.id, Ordering::Relaxed);
            Ok(())
        }
        fn abort(self) {}
    }

    struct MapHandle(Arc<MapStore>);

    impl Store for MapHandle {
        type Txn = MapTxn;
        fn begin_write(&self) -> Result<MapTxn, StoreError> {
            Ok(MapTxn {
                store: Arc::clone(&self.0),
                id: self.0.next_id.fetch_add(1, Ordering::Relaxed),
                overlay: HashMap::new(),
            })
        }
        fn last_committed_txn_id(&self) -> u64 {
            self.0.committed.load(Ordering::Relaxed)
        }
        fn sync(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn worker() -> (Arc<MapStore>, Arc<InstructionLog>, LogWriter, WriteWorker<MapHandle>) {
        let config = Config::compact();
        let map = Arc::new(MapStore::new());
        let store = Arc::new(MapHandle(Arc::clone(&map)));
        let log = Arc::new(InstructionLog::new(&config));
        let writer = LogWriter::new(Arc::clone(&log), &config);
        let w = WriteWorker {
            log: Arc::clone(&log),
            registry: Arc::new(CompressorRegistry::new()),
            coordinator: Arc::new(TxnCoordinator::new(Arc::clone(&store))),
            store,
            sink: Arc::new(NullSink),
            config,
        };
        (map, log, writer, w)
    }

    fn get(map: &MapStore, dbi: Dbi, key: &[u8]) -> Option<Vec<u8>> {
        map.data.lock().get(&(dbi, key.to_vec())).cloned()
    }

    /// Sync-mode run: drives the loop to the boundary without parking.
    fn run_to_end(w: &WriteWorker<MapHandle>, start: Addr) -> EngineResult<Addr> {
        let txn = w.store.begin_write().unwrap();
        w.run_sync(txn, start)
    }

    #[test]
    fn test_simple_batch_applies_and_stamps_status() {
        let (map, _log, mut writer, w) = worker();
        let put = writer.put(0, b"a", b"1", PutOptions::default()).unwrap();
        let del = writer.del(0, b"missing").unwrap();

        run_to_end(&w, writer.batch_start()).unwrap();

        assert_eq!(get(&map, 0, b"a"), Some(b"1".to_vec()));
        assert!(put.is_finished());
        assert!(!put.failed_condition());
        // Deleting a missing key is a conflict, not an error.
        assert!(del.is_finished());
        assert!(del.failed_condition());
    }

    #[test]
    fn test_boundary_bits_on_dry_slot() {
        let (_map, log, mut writer, w) = worker();
        writer.put(0, b"k", b"v", PutOptions::default()).unwrap();
        let end = run_to_end(&w, writer.batch_start()).unwrap();

        let status = log.load(end);
        assert!(status & instruction::TXN_DELIMITER != 0);
        assert!(status & instruction::TXN_COMMITTED != 0);
        assert!(status & instruction::BATCH_DELIMITER != 0);
    }

    #[test]
    fn test_failed_condition_block_skips_contents() {
        let (map, _log, mut writer, w) = worker();
        // Guard on a key that does not exist.
        let guard = writer.start_condition_block(0, b"guard", Condition::Exists).unwrap();
        let inner = writer.put(0, b"inner", b"x", PutOptions::default()).unwrap();
        writer.block_end().unwrap();
        let after = writer.put(0, b"after", b"y", PutOptions::default()).unwrap();

        run_to_end(&w, writer.batch_start()).unwrap();

        assert!(guard.failed_condition());
        assert!(inner.failed_condition());
        assert_eq!(get(&map, 0, b"inner"), None);
        // Instructions after the block apply normally.
        assert!(!after.failed_condition());
        assert_eq!(get(&map, 0, b"after"), Some(b"y".to_vec()));
    }

    #[test]
    fn test_nested_block_gating() {
        let (map, _log, mut writer, w) = worker();
        map.data.lock().insert((0, b"outer".to_vec()), b"1".to_vec());

        writer.start_condition_block(0, b"outer", Condition::Exists).unwrap();
        // Inner guard fails; its contents are skipped.
        writer.start_condition_block(0, b"inner-guard", Condition::Exists).unwrap();
        let skipped = writer.put(0, b"deep", b"no", PutOptions::default()).unwrap();
        writer.block_end().unwrap();
        // Back in the validated outer block.
        let applied = writer.put(0, b"shallow", b"yes", PutOptions::default()).unwrap();
        writer.block_end().unwrap();

        run_to_end(&w, writer.batch_start()).unwrap();

        assert!(skipped.failed_condition());
        assert_eq!(get(&map, 0, b"deep"), None);
        assert!(!applied.failed_condition());
        assert_eq!(get(&map, 0, b"shallow"), Some(b"yes".to_vec()));
    }

    #[test]
    fn test_version_stamp_and_if_version() {
        let (map, _log, mut writer, w) = worker();
        writer
            .put(0, b"doc", b"v1", PutOptions { set_version: Some(3.0), ..Default::default() })
            .unwrap();
        run_to_end(&w, writer.batch_start()).unwrap();

        let stored = get(&map, 0, b"doc").unwrap();
        assert_eq!(&stored[8..], b"v1");
        assert_eq!(f64::from_bits(u64::from_le_bytes(stored[..8].try_into().unwrap())), 3.0);

        // Matching if-version applies; stale if-version is skipped.
        let config = Config::compact();
        let mut writer2 = LogWriter::new(Arc::clone(&w.log), &config);
        let ok = writer2
            .put(0, b"doc", b"v2", PutOptions { if_version: Some(3.0), set_version: Some(4.0), ..Default::default() })
            .unwrap();
        let stale = writer2
            .put(0, b"doc", b"v3", PutOptions { if_version: Some(3.0), set_version: Some(5.0), ..Default::default() })
            .unwrap();
        run_to_end(&w, writer2.batch_start()).unwrap();

        assert!(!ok.failed_condition());
        assert!(stale.failed_condition());
        assert_eq!(&get(&map, 0, b"doc").unwrap()[8..], b"v2");
    }

    #[test]
    fn test_no_overwrite_conflict_is_nonfatal() {
        let (map, _log, mut writer, w) = worker();
        writer.put(0, b"once", b"first", PutOptions::default()).unwrap();
        let dup = writer
            .put(0, b"once", b"second", PutOptions { no_overwrite: true, ..Default::default() })
            .unwrap();
        let after = writer.put(0, b"next", b"ok", PutOptions::default()).unwrap();

        run_to_end(&w, writer.batch_start()).unwrap();

        assert!(dup.failed_condition());
        assert!(!after.failed_condition());
        assert_eq!(get(&map, 0, b"once"), Some(b"first".to_vec()));
    }

    #[test]
    fn test_condition_value_block() {
        let (map, _log, mut writer, w) = worker();
        map.data.lock().insert((0, b"cas".to_vec()), b"expected".to_vec());

        writer.start_condition_value_block(0, b"cas", b"expected").unwrap();
        writer.put(0, b"won", b"1", PutOptions::default()).unwrap();
        writer.block_end().unwrap();
        writer.start_condition_value_block(0, b"cas", b"wrong").unwrap();
        let lost = writer.put(0, b"lost", b"1", PutOptions::default()).unwrap();
        writer.block_end().unwrap();

        run_to_end(&w, writer.batch_start()).unwrap();

        assert_eq!(get(&map, 0, b"won"), Some(b"1".to_vec()));
        assert!(lost.failed_condition());
        assert_eq!(get(&map, 0, b"lost"), None);
    }

    #[test]
    fn test_skipped_put_frees_arena_value() {
        let (_map, log, mut writer, w) = worker();
        writer.start_condition_block(0, b"no-such", Condition::Exists).unwrap();
        writer.put(0, b"big", &vec![1u8; 300], PutOptions::default()).unwrap();
        writer.block_end().unwrap();

        run_to_end(&w, writer.batch_start()).unwrap();
        assert!(log.arena().is_empty());
    }

    struct HalvingCompressor;

    impl crate::relay::Compressor for HalvingCompressor {
        fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
            Some(data[..data.len() / 2].to_vec())
        }
    }

    #[test]
    fn test_skipped_compressible_put_frees_arena() {
        let (map, log, _writer, w) = worker();
        let id = w.registry.register(Arc::new(HalvingCompressor));

        let config = Config::compact();
        let mut producer = LogWriter::new(Arc::clone(&log), &config)
            .with_compression(CompressionSettings { compressor: id, threshold: 64 });
        producer.start_condition_block(0, b"no-such", Condition::Exists).unwrap();
        let skipped = producer
            .put(0, b"big", &vec![7u8; 300], PutOptions { compressible: true, ..Default::default() })
            .unwrap();
        producer.block_end().unwrap();

        run_to_end(&w, producer.batch_start()).unwrap();

        assert!(skipped.failed_condition());
        assert_eq!(get(&map, 0, b"big"), None);
        assert!(log.arena().is_empty());
    }

    #[test]
    fn test_skipped_compressible_drops_relay_output() {
        let (_map, log, _writer, w) = worker();
        let id = w.registry.register(Arc::new(HalvingCompressor));

        let config = Config::compact();
        let mut producer = LogWriter::new(Arc::clone(&log), &config)
            .with_compression(CompressionSettings { compressor: id, threshold: 64 });
        producer.start_condition_block(0, b"no-such", Condition::Exists).unwrap();
        producer
            .put(0, b"big", &vec![7u8; 300], PutOptions { compressible: true, ..Default::default() })
            .unwrap();
        producer.block_end().unwrap();

        // The relay finishes before the loop reaches the instruction, so
        // both the original and the compressed output are live.
        let head = producer.take_compression_kick().unwrap();
        relay::compress_slot(&log, &w.registry, head, &|| {});
        assert_eq!(log.arena().len(), 2);

        run_to_end(&w, producer.batch_start()).unwrap();
        assert!(log.arena().is_empty());
    }

    #[test]
    fn test_stale_if_version_compressible_frees_arena() {
        let (map, log, _writer, w) = worker();
        let id = w.registry.register(Arc::new(HalvingCompressor));
        map.data.lock().insert((0, b"doc".to_vec()), {
            let mut v = 7.0f64.to_bits().to_le_bytes().to_vec();
            v.extend_from_slice(b"old");
            v
        });

        let config = Config::compact();
        let mut producer = LogWriter::new(Arc::clone(&log), &config)
            .with_compression(CompressionSettings { compressor: id, threshold: 64 });
        let stale = producer
            .put(
                0,
                b"doc",
                &vec![7u8; 300],
                PutOptions { compressible: true, if_version: Some(3.0), ..Default::default() },
            )
            .unwrap();

        run_to_end(&w, producer.batch_start()).unwrap();

        assert!(stale.failed_condition());
        assert_eq!(&get(&map, 0, b"doc").unwrap()[8..], b"old");
        assert!(log.arena().is_empty());
    }
}
