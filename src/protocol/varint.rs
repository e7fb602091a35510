//! 7-bit variable-length integers
//!
//! Each byte carries 7 value bits, low group first; the MSB is set on every
//! byte except the last. A `u32` takes at most 5 bytes. Signed values are
//! zig-zag folded (sign into bit 0) before encoding.

use crate::error::SerializeError;

pub const MAX_VARINT_LEN: usize = 5;

#[inline(always)]
pub fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline(always)]
pub fn unzigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Encoded size of `value` in bytes.
#[inline]
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Encode into a stack array; returns the array and the used length.
#[inline]
pub fn encode_u32(mut value: u32) -> ([u8; MAX_VARINT_LEN], usize) {
    let mut out = [0u8; MAX_VARINT_LEN];
    let mut n = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out[n] = byte;
            return (out, n + 1);
        }
        out[n] = byte | 0x80;
        n += 1;
    }
}

#[inline]
pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    let (bytes, n) = encode_u32(value);
    out.extend_from_slice(&bytes[..n]);
}

#[inline]
pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    write_u32(out, zigzag(value));
}

/// Decode from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the last byte of the varint,
/// otherwise the value and the number of bytes consumed.
#[inline]
pub fn read_u32(buf: &[u8]) -> Result<Option<(u32, usize)>, SerializeError> {
    let mut decoder = VarintDecoder::new();
    for (i, &byte) in buf.iter().enumerate() {
        if let Some(value) = decoder.push(byte).map_err(|_| SerializeError::VarintOverflow(i))? {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Incremental decoder fed one byte at a time, so a varint may straddle any
/// number of buffer boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarintDecoder {
    value: u32,
    shift: u32,
    count: usize,
}

/// A sixth continuation byte or bits beyond 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

impl VarintDecoder {
    pub const fn new() -> Self {
        Self {
            value: 0,
            shift: 0,
            count: 0,
        }
    }

    /// Feed one byte; yields the value when it completes. The decoder resets
    /// itself after a completed value or an overflow.
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<Option<u32>, Overflow> {
        let bits = (byte & 0x7F) as u32;
        // Fifth byte may only carry the top 4 bits
        if self.count == MAX_VARINT_LEN - 1 && (byte & 0x80 != 0 || bits > 0x0F) {
            *self = Self::new();
            return Err(Overflow);
        }
        self.value |= bits << self.shift;
        self.shift += 7;
        self.count += 1;
        if byte & 0x80 == 0 {
            let value = self.value;
            *self = Self::new();
            return Ok(Some(value));
        }
        Ok(None)
    }

    /// True between the first and last byte of a value.
    #[inline(always)]
    pub fn in_progress(&self) -> bool {
        self.count > 0
    }
}
