//! Configuration for the write engine
//!
//! Presets cover the common deployment shapes: a durable default, a
//! throughput-oriented mode that defers fsync past commit, and a small
//! preset for tests and embedded use.

/// Write engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Words per instruction-log segment (each word is 4 bytes)
    pub segment_words: u32,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Spin iterations at an empty nested-block slot before yielding
    pub nested_spin: u32,
    /// Report commit before fsync, then sync and record durability separately
    pub overlapping_sync: bool,
}

impl Config {
    /// Default shape: 64KB segments, commits are reported only after they
    /// are durable.
    pub fn durable() -> Self {
        Self {
            segment_words: 0x4000,
            max_key_size: 1978,
            nested_spin: 64,
            overlapping_sync: false,
        }
    }

    /// Throughput shape: commit is acknowledged at the transaction boundary
    /// and made durable by a staged fsync afterwards.
    pub fn overlapping() -> Self {
        Self {
            overlapping_sync: true,
            ..Self::durable()
        }
    }

    /// Small segments for tests and tightly embedded callers.
    pub fn compact() -> Self {
        Self {
            segment_words: 0x400,
            max_key_size: 511,
            nested_spin: 16,
            overlapping_sync: false,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        // A segment must hold the largest single instruction: flags + dbi +
        // key length + packed key words + versions + value fields + the
        // reserved continuation-jump tail.
        let worst_case = 3 + (self.max_key_size as u32 + 3) / 4 + 1 + 4 + 8 + 4;
        if self.segment_words < worst_case {
            return Err(format!(
                "segment_words must be >= {} for max_key_size {}",
                worst_case, self.max_key_size
            ));
        }
        if self.segment_words > 0x0080_0000 {
            return Err("segment_words must be <= 0x800000 (32MB segments)".into());
        }
        if self.max_key_size == 0 || self.max_key_size > 0xffff {
            return Err("max_key_size must be in [1, 65535]".into());
        }
        if self.nested_spin == 0 {
            return Err("nested_spin must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::durable() }
}
