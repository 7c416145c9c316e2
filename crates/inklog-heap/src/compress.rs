//! LZ4 value compression
//!
//! Stored values are self-describing: a leading byte below 250 means the
//! bytes are raw, 254 and 255 introduce an LZ4 block prefixed with the
//! uncompressed length. Because of that, a raw value whose first byte is
//! 250 or above MUST be stored compressed even when compression grows it,
//! otherwise the read path would misparse it.

use inklog_core::relay::Compressor;

/// 24-bit length limit for the short framing
const SHORT_LEN_LIMIT: usize = 0x0100_0000;

/// First stored byte at or above this means "framed", not raw
const FRAME_THRESHOLD: u8 = 250;

const FRAME_SHORT: u8 = 254;
const FRAME_LONG: u8 = 255;

/// LZ4 block compressor for the relay.
#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl Lz4Compressor {
    pub fn new() -> Self {
        Self
    }

    /// Decode a stored value back to its raw bytes. Returns None when the
    /// framing is malformed or the block fails to decompress.
    pub fn decode(stored: &[u8]) -> Option<Vec<u8>> {
        match stored.first() {
            None => Some(Vec::new()),
            Some(&FRAME_SHORT) => {
                if stored.len() < 4 {
                    return None;
                }
                let len = ((stored[1] as usize) << 16)
                    | ((stored[2] as usize) << 8)
                    | stored[3] as usize;
                lz4_flex::block::decompress(&stored[4..], len).ok()
            }
            Some(&FRAME_LONG) => {
                if stored.len() < 12 {
                    return None;
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(&stored[4..12]);
                let len = u64::from_le_bytes(b) as usize;
                lz4_flex::block::decompress(&stored[12..], len).ok()
            }
            Some(&first) if first >= FRAME_THRESHOLD => None,
            Some(_) => Some(stored.to_vec()),
        }
    }

    fn frame(data: &[u8]) -> Vec<u8> {
        let block = lz4_flex::block::compress(data);
        if data.len() < SHORT_LEN_LIMIT {
            let mut out = Vec::with_capacity(4 + block.len());
            out.push(FRAME_SHORT);
            out.push((data.len() >> 16) as u8);
            out.push((data.len() >> 8) as u8);
            out.push(data.len() as u8);
            out.extend_from_slice(&block);
            out
        } else {
            let mut out = Vec::with_capacity(12 + block.len());
            out.extend_from_slice(&[FRAME_LONG, 0, 0, 0]);
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            out.extend_from_slice(&block);
            out
        }
    }
}

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        let must_frame = data.first().is_some_and(|&b| b >= FRAME_THRESHOLD);
        let framed = Self::frame(data);
        if must_frame || framed.len() < data.len() {
            Some(framed)
        } else {
            None
        }
    }
}
