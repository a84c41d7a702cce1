//! Payload compression: the 2-byte tag frame and the deflate family.
//!
//! # On-disk frame
//!
//! ```text
//! Offset  Size  Field
//!    0      2   tag                (LE u16)
//!    2      4   uncompressed_size  (BE u32 — the one big-endian field)
//!    6    ...   codec body
//! ```
//!
//! # Tag namespace
//! The tag is an *open* enum.  Recognized values:
//!
//! | tag      | meaning                                          |
//! |----------|--------------------------------------------------|
//! | `0x0000` | stored — body is the payload verbatim            |
//! | `0xFB5A` | raw deflate body                                 |
//! | `0xFB5B` | zlib body                                        |
//! | `0x5A42` | legacy internal ("ZB") — recognized, not decoded |
//!
//! Unknown tags must never fail a package open; they surface as
//! [`CodecError::Unsupported`] only when the payload is actually requested,
//! and the framed bytes stay accessible and copyable.  `0x5A42` is treated
//! the same way: its semantics are not specified here and are never guessed
//! at.

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use flate2::Compression;
use thiserror::Error;

// ── Tags ─────────────────────────────────────────────────────────────────────

/// Stored — no compression.
pub const TAG_STORED: u16 = 0x0000;
/// Raw deflate stream.
pub const TAG_DEFLATE: u16 = 0xFB5A;
/// Zlib-wrapped deflate stream.
pub const TAG_ZLIB: u16 = 0xFB5B;
/// Legacy internal format ("ZB").  Recognized so the bytes survive a
/// save/load cycle, never decoded.
pub const TAG_INTERNAL: u16 = 0x5A42;

/// Byte length of the frame preceding the codec body.
pub const FRAME_HEADER_SIZE: usize = 6;

#[derive(Error, Debug)]
pub enum CodecError {
    /// The tag is recognized (or unknown) but this build cannot decode it.
    /// The entry stays enumerable and its raw bytes stay readable.
    #[error("Compression tag {tag:#06X} is not supported — raw bytes remain accessible")]
    Unsupported { tag: u16 },
    #[error("Payload declares {expected} uncompressed bytes but decoded to {actual}")]
    BadPayload { expected: usize, actual: usize },
    #[error("Compressed payload is truncated or corrupt: {0}")]
    Corrupt(String),
    #[error("Payload shorter than the {FRAME_HEADER_SIZE}-byte compression frame")]
    FrameTooShort,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A compression frame split into its parts, borrowed from the raw payload.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub tag:           u16,
    pub declared_size: u32,
    pub body:          &'a [u8],
}

/// Split a raw on-disk payload into tag, declared size, and body.
pub fn parse_frame(raw: &[u8]) -> Result<Frame<'_>, CodecError> {
    if raw.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::FrameTooShort);
    }
    let tag = u16::from_le_bytes(raw[0..2].try_into().unwrap());
    let declared_size = u32::from_be_bytes(raw[2..6].try_into().unwrap());
    Ok(Frame { tag, declared_size, body: &raw[FRAME_HEADER_SIZE..] })
}

/// True for tags this build can both emit and decode.
#[inline]
pub fn is_supported(tag: u16) -> bool {
    matches!(tag, TAG_STORED | TAG_DEFLATE | TAG_ZLIB)
}

// ── Decompress ───────────────────────────────────────────────────────────────

/// Decode a codec body.  The result must be exactly `expected_size` bytes;
/// anything else is corruption, regardless of which codec ran.
pub fn decompress(tag: u16, body: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError> {
    let out = match tag {
        TAG_STORED => body.to_vec(),
        TAG_DEFLATE => {
            let mut out = Vec::with_capacity(expected_size);
            DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| CodecError::Corrupt(e.to_string()))?;
            out
        }
        TAG_ZLIB => {
            let mut out = Vec::with_capacity(expected_size);
            ZlibDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| CodecError::Corrupt(e.to_string()))?;
            out
        }
        other => return Err(CodecError::Unsupported { tag: other }),
    };

    if out.len() != expected_size {
        return Err(CodecError::BadPayload { expected: expected_size, actual: out.len() });
    }
    Ok(out)
}

/// Parse the frame and decode it in one step.
pub fn decompress_framed(raw: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError> {
    let frame = parse_frame(raw)?;
    if frame.declared_size as usize != expected_size {
        return Err(CodecError::BadPayload {
            expected: expected_size,
            actual:   frame.declared_size as usize,
        });
    }
    decompress(frame.tag, frame.body, expected_size)
}

// ── Compress ─────────────────────────────────────────────────────────────────

/// Encode a codec body for `tag`.  The emitted body always inflates back to
/// exactly `src.len()` bytes.
pub fn compress(tag: u16, src: &[u8]) -> Result<Vec<u8>, CodecError> {
    match tag {
        TAG_STORED => Ok(src.to_vec()),
        TAG_DEFLATE => {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(src)?;
            Ok(enc.finish()?)
        }
        TAG_ZLIB => {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(src)?;
            Ok(enc.finish()?)
        }
        other => Err(CodecError::Unsupported { tag: other }),
    }
}

/// Encode a full frame: tag, big-endian uncompressed size, body.
pub fn compress_framed(tag: u16, src: &[u8]) -> Result<Vec<u8>, CodecError> {
    let body = compress(tag, src)?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&(src.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
