//! Write-Ahead Log with batch framing
//!
//! The WAL is the durability side of the RAM-first contract: the read path
//! serves from memory, the write path lands in the WAL before memory is
//! updated. Records are grouped per transaction; the whole batch plus its
//! Commit record is written in one append, so a crash can never expose a
//! half-applied transaction. Recovery replays sealed batches in order and
//! discards any unsealed tail.

use crate::error::{HeapError, HeapResult};
use crate::format::{decode_record, encode_record, WalRecord};
use crate::durability::durable_sync;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// WAL file rotation threshold (100MB)
const WAL_ROTATION_SIZE: u64 = 100 * 1024 * 1024;

/// Appends transaction batches to the current WAL file.
///
/// INVARIANT: `append_batch` must return before the caller updates the
/// in-memory tables. With `durable` set it must also not return before
/// `durable_sync` completes.
pub struct WalWriter {
    /// Current WAL file handle
    file: File,
    /// Path to current WAL file (for error context)
    path: PathBuf,
    /// Current file size in bytes (tracked to avoid stat calls)
    size: u64,
    /// WAL directory for file rotation
    wal_dir: PathBuf,
    /// Monotonic sequence number for WAL file naming
    sequence: u64,
}

impl WalWriter {
    /// Create a WAL writer in the specified directory. If WAL files
    /// already exist, appends to the highest sequence number.
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> HeapResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&wal_dir).map_err(|e| HeapError::Io {
            path: Some(wal_dir.clone()),
            kind: e.kind(),
            message: format!("Failed to create WAL directory: {}", e),
        })?;

        let sequence = find_max_sequence(&wal_dir);
        let path = wal_file_path(&wal_dir, sequence);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HeapError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to open WAL file: {}", e),
            })?;

        let size = file
            .metadata()
            .map_err(|e| HeapError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to stat WAL file: {}", e),
            })?
            .len();

        Ok(Self { file, path, size, wal_dir, sequence })
    }

    /// Append one transaction's records plus its Commit seal in a single
    /// write. With `durable` set, the batch is synced to persistent
    /// storage before returning; otherwise it lands in the OS page cache
    /// and a later `sync()` makes it durable.
    pub fn append_batch(&mut self, records: &[WalRecord], txn_id: u64, durable: bool) -> HeapResult<()> {
        let mut batch = Vec::new();
        for record in records {
            batch.extend_from_slice(&encode_record(record)?);
        }
        batch.extend_from_slice(&encode_record(&WalRecord::Commit { txn_id })?);

        // Rotate only between batches so a batch never spans two files
        if self.size > 0 && self.size + batch.len() as u64 > WAL_ROTATION_SIZE {
            self.rotate()?;
        }

        self.file.write_all(&batch).map_err(|e| HeapError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("WAL write failed: {}", e),
        })?;

        if durable {
            durable_sync(&self.file).map_err(|e| HeapError::Io {
                path: Some(self.path.clone()),
                kind: e.kind(),
                message: format!("WAL durable_sync failed: {}", e),
            })?;
        }

        self.size += batch.len() as u64;
        Ok(())
    }

    /// Sync the current WAL file without writing anything. Called after a
    /// run of non-durable batches to make them all durable at once.
    pub fn sync(&self) -> HeapResult<()> {
        durable_sync(&self.file).map_err(|e| HeapError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("WAL sync failed: {}", e),
        })
    }

    /// Rotate to a new WAL file. Syncs the current file first.
    fn rotate(&mut self) -> HeapResult<()> {
        durable_sync(&self.file).map_err(|e| HeapError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("WAL sync before rotation failed: {}", e),
        })?;

        self.sequence += 1;
        let new_path = wal_file_path(&self.wal_dir, self.sequence);

        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)
            .map_err(|e| HeapError::Io {
                path: Some(new_path.clone()),
                kind: e.kind(),
                message: format!("Failed to create rotated WAL file: {}", e),
            })?;

        self.file = new_file;
        self.path = new_path;
        self.size = 0;

        Ok(())
    }

    /// Current WAL file path (for diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Current WAL file size in bytes
    pub fn current_size(&self) -> u64 {
        self.size
    }
}

fn wal_file_path(wal_dir: &Path, sequence: u64) -> PathBuf {
    wal_dir.join(format!("wal-{:016x}.inkl", sequence))
}

/// Find the highest WAL sequence number in the directory.
fn find_max_sequence(wal_dir: &Path) -> u64 {
    let mut max_seq = 0u64;
    if let Ok(entries) = std::fs::read_dir(wal_dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("wal-") && name.ends_with(".inkl") {
                    let hex = &name[4..name.len() - 5]; // strip "wal-" and ".inkl"
                    if let Ok(seq) = u64::from_str_radix(hex, 16) {
                        max_seq = max_seq.max(seq);
                    }
                }
            }
        }
    }
    max_seq
}

/// Replays sealed batches from the WAL files in a directory.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Recover all sealed batches in sequence order.
    ///
    /// Per file: decode records in order, buffering them until a Commit
    /// record seals the batch. A torn write, checksum mismatch, or bad
    /// magic ends recovery at that point; the pending (unsealed) records
    /// are discarded, which is exactly the batch that was mid-write when
    /// the crash happened.
    ///
    /// Returns the applied records and the highest committed txn id.
    pub fn recover(&self) -> HeapResult<(Vec<WalRecord>, u64)> {
        let mut applied = Vec::new();
        let mut last_txn_id = 0u64;

        let mut wal_files: Vec<PathBuf> = Vec::new();
        match std::fs::read_dir(&self.wal_dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| HeapError::Io {
                        path: Some(self.wal_dir.clone()),
                        kind: e.kind(),
                        message: format!("Failed to read directory entry: {}", e),
                    })?;
                    let path = entry.path();
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if name.starts_with("wal-") && name.ends_with(".inkl") {
                            wal_files.push(path);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((applied, last_txn_id));
            }
            Err(e) => {
                return Err(HeapError::Io {
                    path: Some(self.wal_dir.clone()),
                    kind: e.kind(),
                    message: format!("Failed to read WAL directory: {}", e),
                });
            }
        }

        wal_files.sort(); // lexicographic sort = sequence order (hex-padded)

        let mut stopped = false;
        for wal_path in &wal_files {
            if stopped {
                // A crash point was found in an earlier file; later files
                // should not exist, but if they do they cannot be trusted.
                eprintln!(
                    "[WAL RECOVERY] Ignoring {} after earlier crash point",
                    wal_path.display()
                );
                continue;
            }
            stopped = self.recover_file(wal_path, &mut applied, &mut last_txn_id)?;
        }

        Ok((applied, last_txn_id))
    }

    /// Recover sealed batches from one file. Returns true if recovery hit
    /// a crash point and must not continue into later files.
    fn recover_file(
        &self,
        path: &Path,
        applied: &mut Vec<WalRecord>,
        last_txn_id: &mut u64,
    ) -> HeapResult<bool> {
        let mut file = File::open(path).map_err(|e| HeapError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("Failed to open WAL file for recovery: {}", e),
        })?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).map_err(|e| HeapError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("Failed to read WAL file: {}", e),
        })?;

        let mut pending: Vec<WalRecord> = Vec::new();
        let mut offset = 0usize;

        while offset < buffer.len() {
            match decode_record(&buffer[offset..], offset as u64) {
                Ok((record, size)) => {
                    offset += size;
                    if let WalRecord::Commit { txn_id } = record {
                        applied.append(&mut pending);
                        *last_txn_id = (*last_txn_id).max(txn_id);
                    } else {
                        pending.push(record);
                    }
                }
                Err(HeapError::TornWrite { .. }) => {
                    eprintln!(
                        "[WAL RECOVERY] Torn write at offset {} in {}, dropping unsealed tail",
                        offset,
                        path.display()
                    );
                    return Ok(true);
                }
                Err(e) => {
                    eprintln!(
                        "[WAL RECOVERY] Corrupt record at offset {} in {}: {}",
                        offset,
                        path.display(),
                        e
                    );
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::HEADER_SIZE;
    use tempfile::TempDir;

    fn put(dbi: u32, key: &[u8], value: &[u8]) -> WalRecord {
        WalRecord::Put { dbi, key: key.to_vec(), value: value.to_vec() }
    }

    #[test]
    fn test_batch_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::new(temp.path()).unwrap();
        writer
            .append_batch(&[put(0, b"a", b"1"), put(0, b"b", b"2")], 1, true)
            .unwrap();
        writer
            .append_batch(&[WalRecord::Del { dbi: 0, key: b"a".to_vec() }], 2, true)
            .unwrap();
        drop(writer);

        let (records, last_txn) = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(last_txn, 2);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], put(0, b"a", b"1"));
        assert_eq!(records[2], WalRecord::Del { dbi: 0, key: b"a".to_vec() });
    }

    #[test]
    fn test_unsealed_tail_is_dropped() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::new(temp.path()).unwrap();
        writer.append_batch(&[put(0, b"kept", b"v")], 1, true).unwrap();
        let wal_path = writer.current_path().to_path_buf();
        drop(writer);

        // Simulate a crash mid-batch: records appended without a Commit
        let orphan = encode_record(&put(0, b"lost", b"v")).unwrap();
        let mut data = std::fs::read(&wal_path).unwrap();
        data.extend_from_slice(&orphan);
        std::fs::write(&wal_path, data).unwrap();

        let (records, last_txn) = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(last_txn, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], put(0, b"kept", b"v"));
    }

    #[test]
    fn test_torn_write_stops_recovery() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::new(temp.path()).unwrap();
        writer.append_batch(&[put(0, b"complete", b"v")], 1, true).unwrap();
        let wal_path = writer.current_path().to_path_buf();
        drop(writer);

        // Truncated record: full header claiming more payload than exists
        let full = encode_record(&put(0, b"torn", b"a value that gets cut")).unwrap();
        let mut data = std::fs::read(&wal_path).unwrap();
        data.extend_from_slice(&full[..full.len() - 8]);
        std::fs::write(&wal_path, data).unwrap();

        let (records, last_txn) = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(last_txn, 1);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_corrupt_record_invalidates_batch() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::new(temp.path()).unwrap();
        writer.append_batch(&[put(0, b"good", b"v")], 1, true).unwrap();
        writer
            .append_batch(&[put(0, b"bad1", b"v"), put(0, b"bad2", b"v")], 2, true)
            .unwrap();
        let wal_path = writer.current_path().to_path_buf();
        drop(writer);

        // Flip a payload byte inside the second batch
        let first_batch_len = {
            let a = encode_record(&put(0, b"good", b"v")).unwrap().len();
            let c = encode_record(&WalRecord::Commit { txn_id: 1 }).unwrap().len();
            a + c
        };
        let mut data = std::fs::read(&wal_path).unwrap();
        data[first_batch_len + HEADER_SIZE + 2] ^= 0xFF;
        std::fs::write(&wal_path, data).unwrap();

        // Batch 1 survives; batch 2 is discarded entirely
        let (records, last_txn) = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(last_txn, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], put(0, b"good", b"v"));
    }

    #[test]
    fn test_empty_directory() {
        let temp = TempDir::new().unwrap();
        let (records, last_txn) = WalReader::new(temp.path()).recover().unwrap();
        assert!(records.is_empty());
        assert_eq!(last_txn, 0);
    }

    #[test]
    fn test_wal_file_naming() {
        let temp = TempDir::new().unwrap();
        let writer = WalWriter::new(temp.path()).unwrap();
        let name = writer
            .current_path()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(name.starts_with("wal-"));
        assert!(name.ends_with(".inkl"));
    }
}
