//! Instruction word encoding
//!
//! Every instruction in the log starts with one 32-bit flags word. The low
//! nibble is the opcode, and the same nibble bits double as property flags:
//! bit 1 (0x2) means a value field follows, bit 2 (0x4) means a key field
//! follows, bit 3 (0x8) marks the operation as conditional. PUT is 15
//! because a put has a key, a value, and respects condition gating. Value
//! fields are only present when the key bit is also set, so BLOCK_END (2)
//! carries no fields at all.
//!
//! Bits above the nibble are modifiers written by the producer, except for
//! the status bits in the top byte and a half, which only the engine sets
//! and always via atomic fetch-or.

/// Mask selecting the opcode nibble from a flags word.
pub const OP_MASK: u32 = 0xf;

/// Nibble property bit: a value field follows (when HAS_KEY is also set).
pub const HAS_VALUE: u32 = 0x2;
/// Nibble property bit: dbi + key fields follow.
pub const HAS_KEY: u32 = 0x4;
/// Nibble property bit: the operation is gated by enclosing condition blocks.
pub const CONDITIONAL: u32 = 0x8;

// Opcode values (the low nibble).
pub const NO_INSTRUCTION_YET: u32 = 0;
pub const START_BLOCK: u32 = 1;
pub const BLOCK_END: u32 = 2;
pub const POINTER_NEXT: u32 = 3;
pub const START_CONDITION_BLOCK: u32 = 4;
pub const START_CONDITION_VALUE_BLOCK: u32 = 6;
pub const USER_CALLBACK: u32 = 8;
pub const DROP_DB: u32 = 12;
pub const DEL: u32 = 13;
pub const DEL_VALUE: u32 = 14;
pub const PUT: u32 = 15;

// Producer-written modifier bits.
/// An if-version comparison precedes the operation (8-byte version follows the key).
pub const CONDITIONAL_VERSION: u32 = 0x100;
/// An 8-byte version to stamp onto the stored value follows.
pub const SET_VERSION: u32 = 0x200;
/// The value bytes are inline in the log rather than behind a handle.
pub const HAS_INLINE_VALUE: u32 = 0x400;
/// The value sits behind a compression slot the relay may process.
pub const COMPRESSIBLE: u32 = 0x0010_0000;
/// On DROP_DB: delete the database handle rather than just emptying it.
pub const DELETE_DATABASE: u32 = 0x400;
/// On USER_CALLBACK: the write loop must block until the callback is acknowledged.
pub const STRICT_ORDER: u32 = 0x0010_0000;
/// Condition shorthand: validate only if the key does not exist.
pub const IF_NO_EXISTS: u32 = 0x10;

// Store passthrough bits on PUT, forwarded to the backend untouched.
pub const NO_OVERWRITE: u32 = 0x10;
pub const NO_DUP_DATA: u32 = 0x20;
pub const APPEND: u32 = 0x0002_0000;

// Engine-written status bits. Only ever set with fetch-or so concurrent
// producer reads observe a monotonic accumulation.
/// Condition failed or the operation hit a key conflict; it was not applied.
pub const FAILED_CONDITION: u32 = 0x1;
/// The engine has fully processed this instruction.
pub const FINISHED_OPERATION: u32 = 0x1000_0000;
/// A transaction boundary was placed at this slot.
pub const TXN_DELIMITER: u32 = 0x2000_0000;
/// The transaction ending at this slot has committed.
pub const TXN_COMMITTED: u32 = 0x4000_0000;
/// The batch ended at this slot; the worker run returned.
pub const BATCH_DELIMITER: u32 = 0x0800_0000;
/// The engine is parked waiting for an instruction at this slot.
pub const WAITING_OPERATION: u32 = 0x0040_0000;
/// The slot is mid-publication; pollers must not interpret other bits yet.
pub const LOCKED: u32 = 0x0020_0000;

/// Decoded opcode of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Empty slot; the stream has run dry at this address.
    NoInstructionYet,
    /// Enter an unconditional block.
    StartBlock,
    /// Leave the innermost block.
    BlockEnd,
    /// Continuation jump to another log address.
    PointerNext,
    /// Enter a block gated on key existence or version.
    StartConditionBlock,
    /// Enter a block gated on an exact stored-value match.
    StartConditionValueBlock,
    /// Report a user callback event to the caller.
    UserCallback,
    /// Empty or delete a whole database.
    DropDb,
    /// Delete a key.
    Del,
    /// Delete one value under a key (dupsort).
    DelValue,
    /// Store a value under a key.
    Put,
}

impl Opcode {
    /// Decode the opcode nibble. Returns None for the unassigned values.
    pub fn from_flags(flags: u32) -> Option<Self> {
        match flags & OP_MASK {
            NO_INSTRUCTION_YET => Some(Opcode::NoInstructionYet),
            START_BLOCK => Some(Opcode::StartBlock),
            BLOCK_END => Some(Opcode::BlockEnd),
            POINTER_NEXT => Some(Opcode::PointerNext),
            START_CONDITION_BLOCK => Some(Opcode::StartConditionBlock),
            START_CONDITION_VALUE_BLOCK => Some(Opcode::StartConditionValueBlock),
            USER_CALLBACK => Some(Opcode::UserCallback),
            DROP_DB => Some(Opcode::DropDb),
            DEL => Some(Opcode::Del),
            DEL_VALUE => Some(Opcode::DelValue),
            PUT => Some(Opcode::Put),
            _ => None,
        }
    }

    /// The opcode nibble value.
    pub fn as_u32(self) -> u32 {
        match self {
            Opcode::NoInstructionYet => NO_INSTRUCTION_YET,
            Opcode::StartBlock => START_BLOCK,
            Opcode::BlockEnd => BLOCK_END,
            Opcode::PointerNext => POINTER_NEXT,
            Opcode::StartConditionBlock => START_CONDITION_BLOCK,
            Opcode::StartConditionValueBlock => START_CONDITION_VALUE_BLOCK,
            Opcode::UserCallback => USER_CALLBACK,
            Opcode::DropDb => DROP_DB,
            Opcode::Del => DEL,
            Opcode::DelValue => DEL_VALUE,
            Opcode::Put => PUT,
        }
    }
}

/// Does this flags word carry dbi + key fields?
pub fn has_key(flags: u32) -> bool {
    flags & HAS_KEY != 0
}

/// Does this flags word carry value fields? Value fields only exist behind
/// a key, so BLOCK_END (which has the value bit but not the key bit) reads
/// as field-free.
pub fn has_value(flags: u32) -> bool {
    flags & HAS_VALUE != 0 && flags & HAS_KEY != 0
}

/// Is this operation gated by condition-block validation?
pub fn is_conditional(flags: u32) -> bool {
    flags & CONDITIONAL != 0
}
