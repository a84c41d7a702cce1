//! Binary primitives shared by the container and the resource codecs.
//!
//! All multi-byte integers in the package format are little-endian; the one
//! deliberate exception (the big-endian uncompressed-size field inside a
//! compression frame) is read explicitly as such by `codec`.
//!
//! # 7-bit varints
//! Lengths are encoded LSB-first, seven payload bits per byte, high bit set
//! meaning "more follows".  Encoding is capped at 5 bytes, which is enough
//! for any u32; a sixth continuation byte is malformed input, not a longer
//! number.
//!
//! # Length-prefixed strings
//! A varint gives the *byte* length of the payload (not the character
//! count); the payload is UTF-16BE.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Maximum encoded length of a varint.  Five 7-bit groups cover 35 bits.
pub const MAX_VARINT_BYTES: usize = 5;

#[derive(Error, Debug)]
pub enum BinaryError {
    #[error("Unexpected end of input at byte {at}: needed {needed} more")]
    UnexpectedEof { at: usize, needed: usize },
    #[error("Varint continues past {MAX_VARINT_BYTES} bytes")]
    MalformedVarInt,
    #[error("Invalid UTF-16BE string payload")]
    InvalidString,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Slice cursor ─────────────────────────────────────────────────────────────

/// Bounds-checked cursor over an in-memory buffer.
///
/// Every read either returns the requested bytes or fails with
/// [`BinaryError::UnexpectedEof`]; the cursor never advances past the end.
#[derive(Debug)]
pub struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], BinaryError> {
        if self.remaining() < n {
            return Err(BinaryError::UnexpectedEof {
                at:     self.pos,
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, BinaryError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BinaryError> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, BinaryError> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, BinaryError> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    /// Big-endian u32 — only the compression-frame size field uses this.
    pub fn read_u32_be(&mut self) -> Result<u32, BinaryError> {
        Ok(u32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    /// Decode a 7-bit varint, rejecting encodings longer than
    /// [`MAX_VARINT_BYTES`].
    pub fn read_varint(&mut self) -> Result<u32, BinaryError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as u32);
            }
        }
        Err(BinaryError::MalformedVarInt)
    }
}

// ── Varint / string emit ─────────────────────────────────────────────────────

/// Append the minimum-byte varint encoding of `value`.
pub fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Decode a varint from a stream (wrapper-format string prefixes).
pub fn read_varint_from<R: Read>(r: &mut R) -> Result<u32, BinaryError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let byte = r.read_u8()?;
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as u32);
        }
    }
    Err(BinaryError::MalformedVarInt)
}

/// Read a varint-length-prefixed UTF-16BE string.
pub fn read_prefixed_string<R: Read>(r: &mut R) -> Result<String, BinaryError> {
    let byte_len = read_varint_from(r)? as usize;
    if byte_len % 2 != 0 {
        return Err(BinaryError::InvalidString);
    }
    let mut units = Vec::with_capacity(byte_len / 2);
    for _ in 0..byte_len / 2 {
        units.push(r.read_u16::<BigEndian>()?);
    }
    String::from_utf16(&units).map_err(|_| BinaryError::InvalidString)
}

/// Write a varint-length-prefixed UTF-16BE string.
pub fn write_prefixed_string<W: Write>(w: &mut W, s: &str) -> Result<(), BinaryError> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut prefix = Vec::with_capacity(MAX_VARINT_BYTES);
    write_varint(&mut prefix, (units.len() * 2) as u32);
    w.write_all(&prefix)?;
    for unit in units {
        w.write_u16::<BigEndian>(unit)?;
    }
    Ok(())
}
