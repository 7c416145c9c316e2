//! RAM-first transactional store
//!
//! All committed data lives in hash tables; the WAL exists only to
//! rebuild them after a restart. Reads go straight to RAM. Writes go
//! through a single write transaction that buffers an overlay and its WAL
//! records, then commits by appending one sealed batch and folding the
//! overlay into the tables. The write path is WAL-first: the batch is on
//! its way to disk before RAM changes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use inklog_core::store::{Dbi, PutFlags, Store, StoreError, StoreTxn};

use crate::error::{HeapError, HeapResult};
use crate::format::WalRecord;
use crate::wal::{WalReader, WalWriter};

/// Heap backend configuration.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Sync every commit to persistent storage before returning. When
    /// false, commits land in the OS page cache and `sync()` makes them
    /// durable in bulk.
    pub durable_commit: bool,
}

impl HeapConfig {
    /// Every commit survives power loss.
    pub fn durable() -> Self {
        Self { durable_commit: true }
    }

    /// Commits are crash-atomic but only durable up to the last `sync()`.
    pub fn fast() -> Self {
        Self { durable_commit: false }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::durable()
    }
}

/// One database: a hash table from key to its sorted value list.
/// Non-dupsort tables keep exactly one value per key.
struct Table {
    name: Option<Vec<u8>>,
    dupsort: bool,
    open: bool,
    map: HashMap<Vec<u8>, Vec<Vec<u8>>>,
}

impl Table {
    fn new(name: Option<Vec<u8>>, dupsort: bool) -> Self {
        Self { name, dupsort, open: true, map: HashMap::new() }
    }
}

/// All databases plus the name index. Guarded by one RwLock; the read
/// path takes it shared, commit takes it exclusive briefly.
struct Tables {
    tables: Vec<Table>,
    by_name: HashMap<Vec<u8>, Dbi>,
}

impl Tables {
    fn new() -> Self {
        // dbi 0 is the unnamed default database, always open
        Self {
            tables: vec![Table::new(None, false)],
            by_name: HashMap::new(),
        }
    }

    fn table(&self, dbi: Dbi) -> Option<&Table> {
        self.tables.get(dbi as usize).filter(|t| t.open)
    }

    fn table_mut(&mut self, dbi: Dbi) -> Option<&mut Table> {
        self.tables.get_mut(dbi as usize).filter(|t| t.open)
    }

    fn apply(&mut self, record: &WalRecord) {
        match record {
            WalRecord::Put { dbi, key, value } => {
                if let Some(table) = self.table_mut(*dbi) {
                    let dupsort = table.dupsort;
                    let list = table.map.entry(key.clone()).or_default();
                    insert_value(list, value.clone(), dupsort);
                }
            }
            WalRecord::Del { dbi, key } => {
                if let Some(table) = self.table_mut(*dbi) {
                    table.map.remove(key);
                }
            }
            WalRecord::DelValue { dbi, key, value } => {
                if let Some(table) = self.table_mut(*dbi) {
                    if let Some(list) = table.map.get_mut(key) {
                        if let Ok(at) = list.binary_search(value) {
                            list.remove(at);
                        }
                        if list.is_empty() {
                            table.map.remove(key);
                        }
                    }
                }
            }
            WalRecord::DropDb { dbi } => self.drop_table(*dbi, true),
            WalRecord::EmptyDb { dbi } => self.drop_table(*dbi, false),
            WalRecord::OpenDbi { dbi, dupsort, name } => {
                let at = *dbi as usize;
                while self.tables.len() <= at {
                    let mut closed = Table::new(None, false);
                    closed.open = false;
                    self.tables.push(closed);
                }
                self.tables[at] = Table::new(Some(name.clone()), *dupsort);
                self.by_name.insert(name.clone(), *dbi);
            }
            WalRecord::Commit { .. } => {}
        }
    }

    fn drop_table(&mut self, dbi: Dbi, delete: bool) {
        if let Some(table) = self.tables.get_mut(dbi as usize) {
            table.map.clear();
            if delete {
                table.open = false;
                if let Some(name) = table.name.take() {
                    self.by_name.remove(&name);
                }
            }
        }
    }
}

/// Insert into a sorted value list. Non-dupsort replaces; dupsort keeps
/// duplicates sorted and ignores an exact duplicate.
fn insert_value(list: &mut Vec<Vec<u8>>, value: Vec<u8>, dupsort: bool) {
    if !dupsort {
        list.clear();
        list.push(value);
        return;
    }
    if let Err(at) = list.binary_search(&value) {
        list.insert(at, value);
    }
}

struct HeapInner {
    tables: RwLock<Tables>,
    wal: Mutex<WalWriter>,
    writer_busy: AtomicBool,
    last_committed: AtomicU64,
    durable_frontier: AtomicU64,
    config: HeapConfig,
}

/// Handle to a heap store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct HeapStore {
    inner: Arc<HeapInner>,
}

impl HeapStore {
    /// Open a store at `path`, replaying the WAL to rebuild the tables.
    pub fn open<P: AsRef<Path>>(path: P, config: HeapConfig) -> HeapResult<Self> {
        let (records, last_txn_id) = WalReader::new(path.as_ref()).recover()?;

        let mut tables = Tables::new();
        for record in &records {
            tables.apply(record);
        }

        let wal = WalWriter::new(path.as_ref())?;

        Ok(Self {
            inner: Arc::new(HeapInner {
                tables: RwLock::new(tables),
                wal: Mutex::new(wal),
                writer_busy: AtomicBool::new(false),
                last_committed: AtomicU64::new(last_txn_id),
                durable_frontier: AtomicU64::new(last_txn_id),
                config,
            }),
        })
    }

    /// Open (or look up) a named database. The assignment is logged as
    /// its own sealed batch so handles survive a restart. Creating a new
    /// handle takes the writer reservation for the duration of the batch,
    /// keeping its transaction id distinct from any live write transaction;
    /// looking up an existing name never needs it.
    pub fn open_dbi(&self, name: &[u8], dupsort: bool) -> HeapResult<Dbi> {
        let mut tables = self.inner.tables.write();
        if let Some(&dbi) = tables.by_name.get(name) {
            return Ok(dbi);
        }

        let was_busy = self
            .inner
            .writer_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err();
        if was_busy {
            return Err(HeapError::WriterBusy { op: "open_dbi" });
        }

        let dbi = tables.tables.len() as Dbi;
        let record = WalRecord::OpenDbi {
            dbi,
            dupsort,
            name: name.to_vec(),
        };
        let txn_id = self.inner.last_committed.load(Ordering::Acquire) + 1;
        let appended = {
            let mut wal = self.inner.wal.lock();
            wal.append_batch(
                std::slice::from_ref(&record),
                txn_id,
                self.inner.config.durable_commit,
            )
        };
        match appended {
            Ok(()) => {
                self.inner.last_committed.store(txn_id, Ordering::Release);
                self.inner.writer_busy.store(false, Ordering::Release);
            }
            Err(e) => {
                self.inner.writer_busy.store(false, Ordering::Release);
                return Err(e);
            }
        }

        tables.tables.push(Table::new(Some(name.to_vec()), dupsort));
        tables.by_name.insert(name.to_vec(), dbi);
        Ok(dbi)
    }

    /// Read the committed value for a key (first duplicate for dupsort).
    /// Served entirely from RAM.
    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Option<Vec<u8>> {
        let tables = self.inner.tables.read();
        tables
            .table(dbi)?
            .map
            .get(key)
            .and_then(|list| list.first().cloned())
    }

    /// Read all committed duplicates for a key, in sorted order.
    pub fn get_values(&self, dbi: Dbi, key: &[u8]) -> Vec<Vec<u8>> {
        let tables = self.inner.tables.read();
        tables
            .table(dbi)
            .and_then(|t| t.map.get(key).cloned())
            .unwrap_or_default()
    }

    /// Number of keys in a database. Returns None for a closed handle.
    pub fn entry_count(&self, dbi: Dbi) -> Option<usize> {
        let tables = self.inner.tables.read();
        tables.table(dbi).map(|t| t.map.len())
    }

    /// Id of the last transaction known durable on persistent storage.
    pub fn durable_txn_id(&self) -> u64 {
        self.inner.durable_frontier.load(Ordering::Acquire)
    }
}

impl Store for HeapStore {
    type Txn = HeapTxn;

    fn begin_write(&self) -> Result<HeapTxn, StoreError> {
        let was_busy = self
            .inner
            .writer_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err();
        if was_busy {
            return Err(StoreError::Fatal {
                message: "write transaction already active".into(),
            });
        }
        Ok(HeapTxn {
            inner: Arc::clone(&self.inner),
            id: self.inner.last_committed.load(Ordering::Acquire) + 1,
            overlay: HashMap::new(),
            cleared: HashMap::new(),
            records: Vec::new(),
        })
    }

    fn last_committed_txn_id(&self) -> u64 {
        self.inner.last_committed.load(Ordering::Acquire)
    }

    fn sync(&self) -> Result<(), StoreError> {
        let committed = self.inner.last_committed.load(Ordering::Acquire);
        {
            let wal = self.inner.wal.lock();
            wal.sync().map_err(fatal)?;
        }
        self.inner
            .durable_frontier
            .fetch_max(committed, Ordering::AcqRel);
        Ok(())
    }
}

fn fatal(e: HeapError) -> StoreError {
    StoreError::Fatal { message: e.to_string() }
}

/// The single write transaction. Uncommitted writes live in a per-dbi
/// overlay (None marks a deleted key); WAL records accumulate in order
/// and become one sealed batch at commit.
pub struct HeapTxn {
    inner: Arc<HeapInner>,
    id: u64,
    overlay: HashMap<Dbi, HashMap<Vec<u8>, Option<Vec<Vec<u8>>>>>,
    /// Databases dropped (true) or emptied (false) in this transaction
    cleared: HashMap<Dbi, bool>,
    records: Vec<WalRecord>,
}

impl HeapTxn {
    fn table_dupsort(&self, dbi: Dbi) -> Result<bool, StoreError> {
        if let Some(&deleted) = self.cleared.get(&dbi) {
            if deleted {
                return Err(StoreError::Fatal {
                    message: format!("database handle {} was dropped in this transaction", dbi),
                });
            }
        }
        let tables = self.inner.tables.read();
        match tables.table(dbi) {
            Some(t) => Ok(t.dupsort),
            // A handle dropped earlier in this txn is still open in the
            // committed tables, so only truly unknown handles land here
            None => Err(StoreError::Fatal {
                message: format!("unknown database handle {}", dbi),
            }),
        }
    }

    /// The value list this transaction currently sees for a key.
    fn current(&self, dbi: Dbi, key: &[u8]) -> Option<Vec<Vec<u8>>> {
        if let Some(per_dbi) = self.overlay.get(&dbi) {
            if let Some(entry) = per_dbi.get(key) {
                return entry.clone();
            }
        }
        if self.cleared.contains_key(&dbi) {
            return None;
        }
        let tables = self.inner.tables.read();
        tables.table(dbi).and_then(|t| t.map.get(key).cloned())
    }

    fn set(&mut self, dbi: Dbi, key: &[u8], entry: Option<Vec<Vec<u8>>>) {
        self.overlay
            .entry(dbi)
            .or_default()
            .insert(key.to_vec(), entry);
    }
}

impl StoreTxn for HeapTxn {
    fn id(&self) -> u64 {
        self.id
    }

    fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.table_dupsort(dbi)?;
        Ok(self
            .current(dbi, key)
            .and_then(|list| list.into_iter().next()))
    }

    fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8], flags: PutFlags) -> Result<(), StoreError> {
        let dupsort = self.table_dupsort(dbi)?;
        let existing = self.current(dbi, key);

        if flags.no_overwrite && existing.is_some() {
            return Err(StoreError::KeyExist);
        }

        let mut list = if dupsort {
            existing.unwrap_or_default()
        } else {
            Vec::new()
        };

        if dupsort {
            match list.binary_search_by(|v| v.as_slice().cmp(value)) {
                Ok(_) => {
                    if flags.no_dup_data {
                        return Err(StoreError::KeyExist);
                    }
                    // Exact duplicate already present; nothing to write
                    return Ok(());
                }
                Err(at) => list.insert(at, value.to_vec()),
            }
        } else {
            list.push(value.to_vec());
        }

        self.set(dbi, key, Some(list));
        self.records.push(WalRecord::Put {
            dbi,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn del(&mut self, dbi: Dbi, key: &[u8]) -> Result<(), StoreError> {
        self.table_dupsort(dbi)?;
        if self.current(dbi, key).is_none() {
            return Err(StoreError::NotFound);
        }
        self.set(dbi, key, None);
        self.records.push(WalRecord::Del { dbi, key: key.to_vec() });
        Ok(())
    }

    fn del_value(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.table_dupsort(dbi)?;
        let mut list = self.current(dbi, key).ok_or(StoreError::NotFound)?;
        let at = list
            .binary_search_by(|v| v.as_slice().cmp(value))
            .map_err(|_| StoreError::NotFound)?;
        list.remove(at);
        let entry = if list.is_empty() { None } else { Some(list) };
        self.set(dbi, key, entry);
        self.records.push(WalRecord::DelValue {
            dbi,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn drop_db(&mut self, dbi: Dbi, delete: bool) -> Result<(), StoreError> {
        self.table_dupsort(dbi)?;
        self.overlay.remove(&dbi);
        self.cleared.insert(dbi, delete);
        self.records.push(if delete {
            WalRecord::DropDb { dbi }
        } else {
            WalRecord::EmptyDb { dbi }
        });
        Ok(())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let records = std::mem::take(&mut self.records);
        let overlay = std::mem::take(&mut self.overlay);
        let cleared = std::mem::take(&mut self.cleared);

        // WAL first. Until append_batch returns, RAM is untouched and a
        // crash simply loses the unsealed batch.
        if !records.is_empty() {
            let mut wal = self.inner.wal.lock();
            wal.append_batch(&records, self.id, self.inner.config.durable_commit)
                .map_err(fatal)?;
        }

        {
            let mut tables = self.inner.tables.write();
            for (&dbi, &delete) in &cleared {
                tables.drop_table(dbi, delete);
            }
            for (dbi, keys) in overlay {
                if let Some(table) = tables.table_mut(dbi) {
                    for (key, entry) in keys {
                        match entry {
                            Some(list) => {
                                table.map.insert(key, list);
                            }
                            None => {
                                table.map.remove(&key);
                            }
                        }
                    }
                }
            }
        }

        self.inner.last_committed.store(self.id, Ordering::Release);
        if self.inner.config.durable_commit && !records.is_empty() {
            self.inner
                .durable_frontier
                .fetch_max(self.id, Ordering::AcqRel);
        }
        Ok(())
    }

    fn abort(self) {
        // Drop releases the writer slot; the overlay simply disappears
    }
}

impl Drop for HeapTxn {
    fn drop(&mut self) {
        self.inner.writer_busy.store(false, Ordering::Release);
    }
}
