//! On-disk record format for the write-ahead log
//!
//! Every WAL record is a fixed 16-byte header followed by a payload:
//!
//! ```text
//! [magic: 4 bytes "INKL"] [length: u32 LE] [checksum: u32 LE]
//! [record_type: u8] [reserved: 3 bytes]
//! [payload: length bytes]
//! ```
//!
//! The checksum is CRC32C over the payload only, so a corrupted header
//! fails the magic check and a corrupted payload fails the checksum check.
//! Records are grouped into batches; a Commit record seals a batch and
//! recovery discards any unsealed tail.

use crate::error::{HeapError, HeapResult};

/// Magic bytes at the start of every record: "INKL"
pub const MAGIC: [u8; 4] = *b"INKL";

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Maximum payload size (256MB). Anything larger is rejected at write
/// time rather than risking a multi-gigabyte allocation during recovery.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

const TYPE_PUT: u8 = 1;
const TYPE_DEL: u8 = 2;
const TYPE_DEL_VALUE: u8 = 3;
const TYPE_DROP_DB: u8 = 5;
const TYPE_EMPTY_DB: u8 = 6;
const TYPE_OPEN_DBI: u8 = 7;
const TYPE_COMMIT: u8 = 8;

/// OpenDbi flag bit: the database keeps sorted duplicate values per key
const DBI_FLAG_DUPSORT: u32 = 0x1;

/// One logical operation recorded in the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Store a value under a key
    Put { dbi: u32, key: Vec<u8>, value: Vec<u8> },
    /// Delete a key and all its values
    Del { dbi: u32, key: Vec<u8> },
    /// Delete one duplicate value under a key
    DelValue { dbi: u32, key: Vec<u8>, value: Vec<u8> },
    /// Delete a database and its handle
    DropDb { dbi: u32 },
    /// Remove all entries from a database, keeping the handle
    EmptyDb { dbi: u32 },
    /// A named database was opened and assigned a handle
    OpenDbi { dbi: u32, dupsort: bool, name: Vec<u8> },
    /// Seals the batch for one transaction. Records since the previous
    /// Commit become visible atomically during recovery.
    Commit { txn_id: u64 },
}

impl WalRecord {
    fn type_byte(&self) -> u8 {
        match self {
            WalRecord::Put { .. } => TYPE_PUT,
            WalRecord::Del { .. } => TYPE_DEL,
            WalRecord::DelValue { .. } => TYPE_DEL_VALUE,
            WalRecord::DropDb { .. } => TYPE_DROP_DB,
            WalRecord::EmptyDb { .. } => TYPE_EMPTY_DB,
            WalRecord::OpenDbi { .. } => TYPE_OPEN_DBI,
            WalRecord::Commit { .. } => TYPE_COMMIT,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            WalRecord::Put { dbi, key, value } | WalRecord::DelValue { dbi, key, value } => {
                out.extend_from_slice(&dbi.to_le_bytes());
                out.extend_from_slice(&(key.len() as u32).to_le_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(value);
            }
            WalRecord::Del { dbi, key } => {
                out.extend_from_slice(&dbi.to_le_bytes());
                out.extend_from_slice(&(key.len() as u32).to_le_bytes());
                out.extend_from_slice(key);
            }
            WalRecord::DropDb { dbi } | WalRecord::EmptyDb { dbi } => {
                out.extend_from_slice(&dbi.to_le_bytes());
            }
            WalRecord::OpenDbi { dbi, dupsort, name } => {
                out.extend_from_slice(&dbi.to_le_bytes());
                let flags = if *dupsort { DBI_FLAG_DUPSORT } else { 0 };
                out.extend_from_slice(&flags.to_le_bytes());
                out.extend_from_slice(name);
            }
            WalRecord::Commit { txn_id } => {
                out.extend_from_slice(&txn_id.to_le_bytes());
            }
        }
    }
}

/// Serialize a record into its on-disk form: header + payload.
pub fn encode_record(record: &WalRecord) -> HeapResult<Vec<u8>> {
    let mut payload = Vec::new();
    record.encode_payload(&mut payload);

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(HeapError::OversizedRecord {
            record_size: payload.len() as u64,
            max_size: MAX_PAYLOAD_SIZE as u64,
        });
    }

    let checksum = crc32c::crc32c(&payload);

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes.push(record.type_byte());
    bytes.extend_from_slice(&[0u8; 3]);
    bytes.extend_from_slice(&payload);

    Ok(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn decode_payload(record_type: u8, payload: &[u8], offset: u64) -> HeapResult<WalRecord> {
    let short = || HeapError::TornWrite {
        expected_size: HEADER_SIZE as u32,
        available_bytes: payload.len() as u64,
        offset,
    };

    match record_type {
        TYPE_PUT | TYPE_DEL | TYPE_DEL_VALUE => {
            if payload.len() < 8 {
                return Err(short());
            }
            let dbi = read_u32(payload, 0);
            let key_len = read_u32(payload, 4) as usize;
            if payload.len() < 8 + key_len {
                return Err(short());
            }
            let key = payload[8..8 + key_len].to_vec();
            let rest = payload[8 + key_len..].to_vec();
            Ok(match record_type {
                TYPE_PUT => WalRecord::Put { dbi, key, value: rest },
                TYPE_DEL => WalRecord::Del { dbi, key },
                _ => WalRecord::DelValue { dbi, key, value: rest },
            })
        }
        TYPE_DROP_DB | TYPE_EMPTY_DB => {
            if payload.len() < 4 {
                return Err(short());
            }
            let dbi = read_u32(payload, 0);
            Ok(if record_type == TYPE_DROP_DB {
                WalRecord::DropDb { dbi }
            } else {
                WalRecord::EmptyDb { dbi }
            })
        }
        TYPE_OPEN_DBI => {
            if payload.len() < 8 {
                return Err(short());
            }
            let dbi = read_u32(payload, 0);
            let flags = read_u32(payload, 4);
            let name = payload[8..].to_vec();
            Ok(WalRecord::OpenDbi {
                dbi,
                dupsort: flags & DBI_FLAG_DUPSORT != 0,
                name,
            })
        }
        TYPE_COMMIT => {
            if payload.len() < 8 {
                return Err(short());
            }
            Ok(WalRecord::Commit { txn_id: read_u64(payload, 0) })
        }
        other => Err(HeapError::UnknownRecordType {
            record_type: other,
            offset,
        }),
    }
}

/// Decode the record starting at `buf[0]`. `offset` is the record's
/// absolute file offset, used only for error context. Returns the record
/// and its total on-disk size.
///
/// Validation order:
/// 1. Magic bytes must match
/// 2. Full record (header + payload) must fit in the buffer
/// 3. CRC32C of the payload must match the header checksum
pub fn decode_record(buf: &[u8], offset: u64) -> HeapResult<(WalRecord, usize)> {
    if buf.len() < HEADER_SIZE {
        return Err(HeapError::TornWrite {
            expected_size: HEADER_SIZE as u32,
            available_bytes: buf.len() as u64,
            offset,
        });
    }

    if buf[0..4] != MAGIC {
        let mut found = [0u8; 4];
        found.copy_from_slice(&buf[0..4]);
        return Err(HeapError::NoMagicFound {
            offset,
            found_bytes: found,
        });
    }

    let length = read_u32(buf, 4) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(HeapError::OversizedRecord {
            record_size: length as u64,
            max_size: MAX_PAYLOAD_SIZE as u64,
        });
    }

    let total = HEADER_SIZE + length;
    if buf.len() < total {
        return Err(HeapError::TornWrite {
            expected_size: total as u32,
            available_bytes: buf.len() as u64,
            offset,
        });
    }

    let expected = read_u32(buf, 8);
    let payload = &buf[HEADER_SIZE..total];
    let actual = crc32c::crc32c(payload);
    if actual != expected {
        return Err(HeapError::ChecksumMismatch {
            expected,
            actual,
            offset,
        });
    }

    let record = decode_payload(buf[12], payload, offset)?;
    Ok((record, total))
}
