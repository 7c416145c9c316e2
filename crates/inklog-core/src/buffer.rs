//! Shared instruction log
//!
//! Instructions live in segments of 32-bit words. The producer appends on
//! one side; the write loop decodes on the other. The only word two threads
//! ever race on is a flags word: the producer publishes an instruction by
//! swapping the opcode into a pre-zeroed slot, and the engine accumulates
//! status bits into it with fetch-or. Everything after a flags word is
//! written before the flags are published and read only after they are
//! observed, so body words need no atomicity beyond that handoff.
//!
//! Addresses are 64-bit: segment index in the high half, word index in the
//! low half. Segments are never freed while the log lives, so an address
//! stays valid for the lifetime of the batch that produced it.
//!
//! Layout of one instruction, in words from the flags word `w`:
//!
//! ```text
//! w      flags (opcode nibble + modifiers + status bits)
//! w+1    dbi                          } only when the key bit is set
//! w+2    key length in bytes         }
//! w+3..  key bytes packed LE, then round up to an even word index
//! [2]    if-version f64 bits         when CONDITIONAL_VERSION
//! [2]    set-version f64 bits        when SET_VERSION
//! [1]    value length in bytes       } only when key and value bits are set
//! [1]    reserved
//! [..]   inline value bytes (rounded to even)  when HAS_INLINE_VALUE
//! [6]    compression slot                      when COMPRESSIBLE
//! [2]    arena handle + reserved               otherwise
//! ```
//!
//! A compression slot is six words: original arena handle, status, claim
//! word (compressor id + 1, exchanged to 0 by whoever compresses), one
//! reserved word, then the address of the next compressible slot in the
//! chain (lo, hi).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::instruction::{self, Opcode};
use crate::store::Dbi;

/// Log address: `(segment_index << 32) | word_index`.
pub type Addr = u64;

/// Pack a segment/word pair into an address.
pub fn addr(segment: u32, word: u32) -> Addr {
    ((segment as u64) << 32) | word as u64
}

/// Split an address into its segment and word indices.
pub fn split_addr(a: Addr) -> (u32, u32) {
    ((a >> 32) as u32, a as u32)
}

// Compression slot word offsets relative to the slot address.
pub(crate) const SLOT_HANDLE: u32 = 0;
pub(crate) const SLOT_STATUS: u32 = 1;
pub(crate) const SLOT_CLAIM: u32 = 2;
pub(crate) const SLOT_NEXT_LO: u32 = 4;
pub(crate) const SLOT_NEXT_HI: u32 = 5;
pub(crate) const SLOT_WORDS: u32 = 6;

// Compression slot status word values. Anything with the done bit set is a
// finished result.
pub(crate) const SLOT_PENDING: u32 = 0;
pub(crate) const SLOT_WAITING: u32 = 1;
pub(crate) const SLOT_SKIPPED: u32 = 2;
pub(crate) const SLOT_DONE: u32 = 0x8000_0000;

struct Segment {
    words: Box<[AtomicU32]>,
}

impl Segment {
    fn new(words: u32) -> Self {
        let mut v = Vec::with_capacity(words as usize);
        v.resize_with(words as usize, || AtomicU32::new(0));
        Self { words: v.into_boxed_slice() }
    }
}

/// Out-of-line value storage. The producer deposits value bytes here and
/// records the handle in the instruction; the consumer takes the bytes out
/// exactly once when the instruction is applied.
pub struct ValueArena {
    slots: Mutex<ArenaSlots>,
}

struct ArenaSlots {
    values: Vec<Option<Arc<[u8]>>>,
    free: Vec<u32>,
}

impl ValueArena {
    fn new() -> Self {
        Self {
            slots: Mutex::new(ArenaSlots { values: Vec::new(), free: Vec::new() }),
        }
    }

    /// Deposit a value, returning its handle.
    pub fn insert(&self, value: Arc<[u8]>) -> u32 {
        let mut slots = self.slots.lock();
        if let Some(idx) = slots.free.pop() {
            slots.values[idx as usize] = Some(value);
            idx
        } else {
            slots.values.push(Some(value));
            (slots.values.len() - 1) as u32
        }
    }

    /// Take a value out, freeing its slot. Each handle resolves at most once.
    pub fn take(&self, handle: u32) -> Option<Arc<[u8]>> {
        let mut slots = self.slots.lock();
        let value = slots.values.get_mut(handle as usize)?.take();
        if value.is_some() {
            slots.free.push(handle);
        }
        value
    }

    /// Read a value without consuming it. The relay uses this so a failed
    /// compression leaves the original in place.
    pub fn peek(&self, handle: u32) -> Option<Arc<[u8]>> {
        let slots = self.slots.lock();
        slots.values.get(handle as usize)?.clone()
    }

    /// Number of live values (for tests and introspection).
    pub fn len(&self) -> usize {
        let slots = self.slots.lock();
        slots.values.iter().filter(|v| v.is_some()).count()
    }

    /// True when no values are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The shared instruction log: segmented word storage plus the value arena.
pub struct InstructionLog {
    segments: RwLock<Vec<Arc<Segment>>>,
    segment_words: u32,
    arena: ValueArena,
}

impl InstructionLog {
    /// Create an empty log with the configured segment size.
    pub fn new(config: &Config) -> Self {
        Self {
            segments: RwLock::new(Vec::new()),
            segment_words: config.segment_words,
            arena: ValueArena::new(),
        }
    }

    /// The value arena backing out-of-line values.
    pub fn arena(&self) -> &ValueArena {
        &self.arena
    }

    pub(crate) fn segment_words(&self) -> u32 {
        self.segment_words
    }

    fn alloc_segment(&self) -> u32 {
        let mut segments = self.segments.write();
        segments.push(Arc::new(Segment::new(self.segment_words)));
        (segments.len() - 1) as u32
    }

    fn segment(&self, idx: u32) -> Arc<Segment> {
        let segments = self.segments.read();
        Arc::clone(&segments[idx as usize])
    }

    /// Atomic load of one word.
    pub fn load(&self, a: Addr) -> u32 {
        let (seg, word) = split_addr(a);
        self.segment(seg).words[word as usize].load(Ordering::Acquire)
    }

    /// Plain store into an unpublished word.
    pub(crate) fn store(&self, a: Addr, value: u32) {
        let (seg, word) = split_addr(a);
        self.segment(seg).words[word as usize].store(value, Ordering::Relaxed);
    }

    /// Accumulate status bits into a flags word. Returns the prior value.
    pub fn fetch_or(&self, a: Addr, bits: u32) -> u32 {
        let (seg, word) = split_addr(a);
        self.segment(seg).words[word as usize].fetch_or(bits, Ordering::AcqRel)
    }

    /// Clear bits in a flags word. Returns the prior value.
    pub fn fetch_and(&self, a: Addr, mask: u32) -> u32 {
        let (seg, word) = split_addr(a);
        self.segment(seg).words[word as usize].fetch_and(mask, Ordering::AcqRel)
    }

    /// Swap a word, returning the prior value. The producer publishes a
    /// flags word with this so a concurrently set WAITING_OPERATION bit is
    /// observed rather than lost.
    pub fn swap(&self, a: Addr, value: u32) -> u32 {
        let (seg, word) = split_addr(a);
        self.segment(seg).words[word as usize].swap(value, Ordering::AcqRel)
    }

    /// Compare-exchange on one word. Returns the prior value on failure.
    pub(crate) fn compare_exchange(&self, a: Addr, current: u32, new: u32) -> Result<u32, u32> {
        let (seg, word) = split_addr(a);
        self.segment(seg).words[word as usize].compare_exchange(
            current,
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
    }
}

/// Caller-side view of one appended instruction, for polling its status.
#[derive(Clone)]
pub struct InstructionRef {
    log: Arc<InstructionLog>,
    addr: Addr,
}

impl InstructionRef {
    /// Log address of the flags word.
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Current flags word, status bits included.
    pub fn status(&self) -> u32 {
        self.log.load(self.addr)
    }

    /// Has the engine fully processed this instruction?
    pub fn is_finished(&self) -> bool {
        self.status() & instruction::FINISHED_OPERATION != 0
    }

    /// Was the operation skipped by a failed condition or key conflict?
    pub fn failed_condition(&self) -> bool {
        self.status() & instruction::FAILED_CONDITION != 0
    }

    /// Did a transaction boundary land on this slot?
    pub fn txn_delimiter(&self) -> bool {
        self.status() & instruction::TXN_DELIMITER != 0
    }

    /// Has the transaction ending at this slot committed?
    pub fn txn_committed(&self) -> bool {
        self.status() & instruction::TXN_COMMITTED != 0
    }
}

/// How a condition block validates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    /// Valid when the key exists.
    Exists,
    /// Valid when the key does not exist.
    NoExists,
    /// Valid when the stored value's version stamp equals this.
    Version(f64),
}

/// Options for a put instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Stamp this version onto the stored value (8-byte prefix).
    pub set_version: Option<f64>,
    /// Apply only if the stored version equals this.
    pub if_version: Option<f64>,
    /// Apply only if the key does not already exist.
    pub if_no_exists: bool,
    /// Refuse to replace an existing value.
    pub no_overwrite: bool,
    /// In dupsort databases, refuse an exact duplicate.
    pub no_dup_data: bool,
    /// Key sorts after all existing keys; backend may fast-path.
    pub append: bool,
    /// Route the value through the compression relay when large enough.
    pub compressible: bool,
}

/// Compression settings carried by a producer.
#[derive(Debug, Clone, Copy)]
pub struct CompressionSettings {
    /// Registered compressor id (see the relay registry).
    pub compressor: u32,
    /// Values at or above this size go through the relay.
    pub threshold: usize,
}

/// Producer-side appender. One writer owns the tail of the log; appends are
/// not thread-safe against each other, only against the consuming engine.
pub struct LogWriter {
    log: Arc<InstructionLog>,
    seg: u32,
    word: u32,
    start: Addr,
    max_key_size: usize,
    compression: Option<CompressionSettings>,
    last_slot: Option<Addr>,
    kick: Option<Addr>,
    resume_needed: bool,
}

impl LogWriter {
    /// Start a new batch at a fresh segment.
    pub fn new(log: Arc<InstructionLog>, config: &Config) -> Self {
        let seg = log.alloc_segment();
        Self {
            log,
            seg,
            word: 0,
            start: addr(seg, 0),
            max_key_size: config.max_key_size,
            compression: None,
            last_slot: None,
            kick: None,
            resume_needed: false,
        }
    }

    /// Enable compression for subsequent puts.
    pub fn with_compression(mut self, settings: CompressionSettings) -> Self {
        self.compression = Some(settings);
        self
    }

    /// Address of the first instruction of this batch.
    pub fn batch_start(&self) -> Addr {
        self.start
    }

    /// True once any published instruction landed on a slot the engine was
    /// parked on. Cleared by the call; the caller should resume the engine.
    pub fn take_resume_needed(&mut self) -> bool {
        std::mem::take(&mut self.resume_needed)
    }

    /// A compressible value whose chain link could no longer reach the
    /// relay. The caller should hand this address to the engine's
    /// compression kick-off. Cleared by the call.
    pub fn take_compression_kick(&mut self) -> Option<Addr> {
        self.kick.take()
    }

    fn here(&self) -> Addr {
        addr(self.seg, self.word)
    }

    /// Make room for `body_words` plus the next flags word, emitting a
    /// continuation jump into a fresh segment when the current one is full.
    fn ensure_capacity(&mut self, body_words: u32) {
        let needed = body_words + 4;
        if self.word + needed <= self.log.segment_words() {
            return;
        }
        let new_seg = self.log.alloc_segment();
        let target = addr(new_seg, 0);
        // Body of the jump first, then publish its flags.
        self.log.store(addr(self.seg, self.word + 1), 0);
        self.log.store(addr(self.seg, self.word + 2), target as u32);
        self.log.store(addr(self.seg, self.word + 3), (target >> 32) as u32);
        self.publish_at(self.here(), instruction::POINTER_NEXT);
        self.seg = new_seg;
        self.word = 0;
    }

    /// Publish a flags word over a pre-zeroed slot, noticing a parked engine.
    fn publish_at(&mut self, flags_addr: Addr, flags: u32) {
        let prev = self.log.swap(flags_addr, flags);
        if prev & instruction::WAITING_OPERATION != 0 {
            self.resume_needed = true;
        }
    }

    fn write_word(&mut self, value: u32) {
        self.log.store(self.here(), value);
        self.word += 1;
    }

    fn write_f64(&mut self, value: f64) {
        let bits = value.to_bits();
        self.write_word(bits as u32);
        self.write_word((bits >> 32) as u32);
    }

    fn write_key(&mut self, dbi: Dbi, key: &[u8]) -> EngineResult<()> {
        if key.len() > self.max_key_size {
            return Err(EngineError::KeyTooLarge { size: key.len(), max: self.max_key_size });
        }
        self.write_word(dbi);
        self.write_word(key.len() as u32);
        for chunk in key.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write_word(u32::from_le_bytes(word));
        }
        // 64-bit fields that follow sit at even word indices.
        if self.word & 1 != 0 {
            self.write_word(0);
        }
        Ok(())
    }

    /// Emit one instruction: reserve space, skip the flags word, write the
    /// body via `body`, zero the next flags slot, publish.
    fn emit(
        &mut self,
        flags: u32,
        body_words_hint: u32,
        body: impl FnOnce(&mut Self) -> EngineResult<()>,
    ) -> EngineResult<InstructionRef> {
        self.ensure_capacity(body_words_hint + 1);
        let flags_addr = self.here();
        self.word += 1;
        body(self)?;
        // Pre-zero the slot the next instruction (or the dry-spell park)
        // will use.
        self.log.store(self.here(), 0);
        self.publish_at(flags_addr, flags);
        Ok(InstructionRef { log: Arc::clone(&self.log), addr: flags_addr })
    }

    fn key_body_words(&self, key: &[u8]) -> u32 {
        2 + (key.len() as u32 + 3) / 4 + 1
    }

    /// Append a put.
    pub fn put(
        &mut self,
        dbi: Dbi,
        key: &[u8],
        value: &[u8],
        opts: PutOptions,
    ) -> EngineResult<InstructionRef> {
        let mut flags = instruction::PUT;
        if opts.if_version.is_some() {
            flags |= instruction::CONDITIONAL_VERSION;
        }
        if opts.if_no_exists || opts.no_overwrite {
            flags |= instruction::NO_OVERWRITE;
        }
        if opts.no_dup_data {
            flags |= instruction::NO_DUP_DATA;
        }
        if opts.append {
            flags |= instruction::APPEND;
        }
        if opts.set_version.is_some() {
            flags |= instruction::SET_VERSION;
        }
        self.keyed_value_op(flags, dbi, key, value, opts.if_version, opts.set_version, opts.compressible)
    }

    /// Append a delete of a key.
    pub fn del(&mut self, dbi: Dbi, key: &[u8]) -> EngineResult<InstructionRef> {
        let words = self.key_body_words(key);
        self.emit(instruction::DEL, words, |w| w.write_key(dbi, key))
    }

    /// Append a conditional delete of a key (if-version).
    pub fn del_if_version(&mut self, dbi: Dbi, key: &[u8], version: f64) -> EngineResult<InstructionRef> {
        let words = self.key_body_words(key) + 2;
        self.emit(instruction::DEL | instruction::CONDITIONAL_VERSION, words, |w| {
            w.write_key(dbi, key)?;
            w.write_f64(version);
            Ok(())
        })
    }

    /// Append a delete of one duplicate value.
    pub fn del_value(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) -> EngineResult<InstructionRef> {
        self.keyed_value_op(instruction::DEL_VALUE, dbi, key, value, None, None, false)
    }

    /// Append a database drop. `delete` removes the handle entirely.
    pub fn drop_db(&mut self, dbi: Dbi, delete: bool) -> EngineResult<InstructionRef> {
        let mut flags = instruction::DROP_DB;
        if delete {
            flags |= instruction::DELETE_DATABASE;
        }
        let words = self.key_body_words(&[]);
        self.emit(flags, words, |w| w.write_key(dbi, &[]))
    }

    /// Append a user callback marker.
    pub fn user_callback(&mut self, strict_order: bool) -> EngineResult<InstructionRef> {
        let mut flags = instruction::USER_CALLBACK;
        if strict_order {
            flags |= instruction::STRICT_ORDER;
        }
        self.emit(flags, 0, |_| Ok(()))
    }

    /// Open an unconditional block.
    pub fn start_block(&mut self) -> EngineResult<InstructionRef> {
        self.emit(instruction::START_BLOCK, 0, |_| Ok(()))
    }

    /// Open a condition block gated on key existence or version.
    pub fn start_condition_block(
        &mut self,
        dbi: Dbi,
        key: &[u8],
        condition: Condition,
    ) -> EngineResult<InstructionRef> {
        let mut flags = instruction::START_CONDITION_BLOCK;
        let mut version = None;
        match condition {
            Condition::Exists => {}
            Condition::NoExists => flags |= instruction::IF_NO_EXISTS,
            Condition::Version(v) => {
                flags |= instruction::CONDITIONAL_VERSION;
                version = Some(v);
            }
        }
        let words = self.key_body_words(key) + if version.is_some() { 2 } else { 0 };
        self.emit(flags, words, |w| {
            w.write_key(dbi, key)?;
            if let Some(v) = version {
                w.write_f64(v);
            }
            Ok(())
        })
    }

    /// Open a condition block gated on an exact stored-value match.
    pub fn start_condition_value_block(
        &mut self,
        dbi: Dbi,
        key: &[u8],
        expected: &[u8],
    ) -> EngineResult<InstructionRef> {
        self.keyed_value_op(
            instruction::START_CONDITION_VALUE_BLOCK,
            dbi,
            key,
            expected,
            None,
            None,
            false,
        )
    }

    /// Close the innermost block.
    pub fn block_end(&mut self) -> EngineResult<InstructionRef> {
        self.emit(instruction::BLOCK_END, 0, |_| Ok(()))
    }

    fn keyed_value_op(
        &mut self,
        mut flags: u32,
        dbi: Dbi,
        key: &[u8],
        value: &[u8],
        if_version: Option<f64>,
        set_version: Option<f64>,
        compressible: bool,
    ) -> EngineResult<InstructionRef> {
        let compression = match (compressible, self.compression) {
            (true, Some(c)) if value.len() >= c.threshold => Some(c),
            _ => None,
        };

        // Small values ride inline; larger ones go through the arena.
        let inline = compression.is_none() && value.len() <= 64;
        let value_words = if inline {
            2 + (value.len() as u32 + 3) / 4 + 1
        } else if compression.is_some() {
            2 + SLOT_WORDS
        } else {
            2 + 2
        };
        if inline {
            flags |= instruction::HAS_INLINE_VALUE;
        } else if compression.is_some() {
            flags |= instruction::COMPRESSIBLE;
        }

        let version_words = [if_version, set_version].iter().filter(|v| v.is_some()).count() as u32 * 2;
        let words = self.key_body_words(key) + version_words + value_words;

        let handle = if inline {
            None
        } else {
            Some(self.log.arena.insert(Arc::from(value)))
        };

        let mut slot_addr = None;
        let value_len = value.len() as u32;
        let instr = self.emit(flags, words, |w| {
            w.write_key(dbi, key)?;
            if let Some(v) = if_version {
                w.write_f64(v);
            }
            if let Some(v) = set_version {
                w.write_f64(v);
            }
            w.write_word(value_len);
            w.write_word(0);
            if inline {
                for chunk in value.chunks(4) {
                    let mut word = [0u8; 4];
                    word[..chunk.len()].copy_from_slice(chunk);
                    w.write_word(u32::from_le_bytes(word));
                }
                if w.word & 1 != 0 {
                    w.write_word(0);
                }
            } else if let Some(c) = compression {
                let slot = w.here();
                w.write_word(handle.unwrap_or(0));
                w.write_word(SLOT_PENDING);
                w.write_word(c.compressor + 1);
                w.write_word(0);
                w.write_word(0);
                w.write_word(0);
                slot_addr = Some(slot);
            } else {
                w.write_word(handle.unwrap_or(0));
                w.write_word(0);
            }
            Ok(())
        })?;

        if let Some(slot) = slot_addr {
            self.link_compression_slot(slot);
        }
        Ok(instr)
    }

    /// Chain a new compression slot behind the previous one. If the relay
    /// already consumed the previous slot the chain is broken and the new
    /// slot must be kicked off separately.
    fn link_compression_slot(&mut self, slot: Addr) {
        let broken = match self.last_slot {
            None => true,
            Some(prev) => {
                self.log.store(prev + SLOT_NEXT_LO as u64, slot as u32);
                self.log.store(prev + SLOT_NEXT_HI as u64, (slot >> 32) as u32);
                // Claim word already taken means the relay walked past.
                self.log.load(prev + SLOT_CLAIM as u64) == 0
            }
        };
        self.last_slot = Some(slot);
        if broken {
            self.kick = Some(slot);
        }
    }
}

/// Out-of-line value reference decoded from an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    /// Bytes copied straight out of the log.
    Inline(Vec<u8>),
    /// Arena handle, consumed when the instruction is applied.
    Handle(u32),
    /// Compression slot address; resolve through the relay protocol.
    Compressible { slot: Addr },
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// Address of the flags word.
    pub addr: Addr,
    /// Raw flags at decode time.
    pub flags: u32,
    /// Decoded opcode.
    pub op: Opcode,
    /// Target database, when the key bit is set.
    pub dbi: Dbi,
    /// Key bytes, when the key bit is set.
    pub key: Vec<u8>,
    /// If-version comparison operand.
    pub if_version: Option<f64>,
    /// Version stamp to store.
    pub set_version: Option<f64>,
    /// Value reference, when value fields are present.
    pub value: Option<ValueRef>,
    /// Declared value length in bytes.
    pub value_len: u32,
}

/// Engine-side decoder. Tracks a position in the log and decodes one
/// instruction per call, following continuation jumps.
pub struct Cursor {
    log: Arc<InstructionLog>,
    pos: Addr,
}

impl Cursor {
    /// Position a cursor at an address.
    pub fn new(log: Arc<InstructionLog>, start: Addr) -> Self {
        Self { log, pos: start }
    }

    /// Current position (the flags word the next decode will read).
    pub fn position(&self) -> Addr {
        self.pos
    }

    fn read(&self, offset: u32) -> u32 {
        let (seg, word) = split_addr(self.pos);
        self.log.load(addr(seg, word + offset))
    }

    fn read_f64(&self, offset: u32) -> f64 {
        let lo = self.read(offset) as u64;
        let hi = self.read(offset + 1) as u64;
        f64::from_bits(lo | (hi << 32))
    }

    /// Decode the instruction at the current position. An empty slot
    /// decodes as NoInstructionYet and does not advance; everything else
    /// advances the cursor past the instruction (or through a jump).
    pub fn decode_next(&mut self) -> EngineResult<Decoded> {
        let flags_addr = self.pos;
        let flags = self.log.load(flags_addr);
        let op = Opcode::from_flags(flags).ok_or(EngineError::BadInstruction {
            address: flags_addr,
            flags,
        })?;

        let mut decoded = Decoded {
            addr: flags_addr,
            flags,
            op,
            dbi: 0,
            key: Vec::new(),
            if_version: None,
            set_version: None,
            value: None,
            value_len: 0,
        };

        if op == Opcode::NoInstructionYet {
            return Ok(decoded);
        }

        if op == Opcode::PointerNext {
            let lo = self.read(2) as u64;
            let hi = self.read(3) as u64;
            self.pos = lo | (hi << 32);
            return Ok(decoded);
        }

        let (seg, base) = split_addr(flags_addr);
        let mut w = 1u32;

        if instruction::has_key(flags) {
            decoded.dbi = self.read(1);
            let key_len = self.read(2) as usize;
            let key_words = (key_len + 3) / 4;
            let mut key = Vec::with_capacity(key_len);
            for i in 0..key_words {
                let word = self.read(3 + i as u32).to_le_bytes();
                let take = (key_len - i * 4).min(4);
                key.extend_from_slice(&word[..take]);
            }
            decoded.key = key;
            w = 3 + key_words as u32;
            if (base + w) & 1 != 0 {
                w += 1;
            }
        }

        if flags & instruction::CONDITIONAL_VERSION != 0 {
            decoded.if_version = Some(self.read_f64(w));
            w += 2;
        }
        if flags & instruction::SET_VERSION != 0 {
            decoded.set_version = Some(self.read_f64(w));
            w += 2;
        }

        if instruction::has_value(flags) {
            let value_len = self.read(w);
            decoded.value_len = value_len;
            w += 2;
            if flags & instruction::HAS_INLINE_VALUE != 0 {
                let value_words = (value_len as usize + 3) / 4;
                let mut value = Vec::with_capacity(value_len as usize);
                for i in 0..value_words {
                    let word = self.read(w + i as u32).to_le_bytes();
                    let take = (value_len as usize - i * 4).min(4);
                    value.extend_from_slice(&word[..take]);
                }
                decoded.value = Some(ValueRef::Inline(value));
                w += value_words as u32;
                if (base + w) & 1 != 0 {
                    w += 1;
                }
            } else if flags & instruction::COMPRESSIBLE != 0 {
                decoded.value = Some(ValueRef::Compressible { slot: addr(seg, base + w) });
                w += SLOT_WORDS;
            } else {
                decoded.value = Some(ValueRef::Handle(self.read(w)));
                w += 2;
            }
        }

        self.pos = addr(seg, base + w);
        Ok(decoded)
    }
}
