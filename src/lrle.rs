//! LRLE — palettized run-length image resource with mipmaps.
//!
//! # Container layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic        = 0x454C524C  ("LRLE")
//!    4      4   version      0 (V1) or 0x32303056 ("V002", V2)
//!    8      2   width        (LE u16)
//!   10      2   height       (LE u16)
//!   12      4   mip_count    (LE u32)
//!   16    4×N   mip_offsets  offsets into the payload, first 0, increasing
//!   ...    4    color_count  V2 only, ≤ 256
//!   ...  4×C    palette      V2 only, ARGB (LE u32)
//!   ...   ...   payload      concatenated compressed mip chunks
//! ```
//!
//! # Chunk encoding
//! A chunk is a sequence of runs.  Each run is a command byte whose low bit
//! selects the operation, then the run length as a 7-bit varint (≥ 1), then
//! the color data:
//!
//! - `0x00` repeat run — one color, emitted N times.
//! - `0x01` color run — N distinct colors, each emitted once.
//!
//! A color is a raw LE u32 ARGB in V1 and a single palette-index byte in V2.
//! Mip `k` must decode to exactly `max(1, width>>k) × max(1, height>>k)`
//! pixels; undershooting is a truncation error, overshooting an overflow.
//!
//! # Canonical encoding
//! The encoder is greedy: a repeat run wherever at least two equal pixels
//! are adjacent, otherwise a color run extended until the buffer ends or the
//! next pixel pair repeats; run lengths use minimum-byte varints.  Decoding
//! a canonical stream and re-encoding it reproduces the bytes exactly.

use std::collections::HashMap;

use thiserror::Error;

use crate::binary::{write_varint, BinaryError, SliceReader};
use crate::key::ResourceKey;
use crate::registry::{DecodeError, Resource, ResourceFactory};

pub const LRLE_MAGIC: u32 = 0x454C_524C; // "LRLE"
pub const VERSION_V1: u32 = 0;
pub const VERSION_V2: u32 = 0x3230_3056; // "V002"

/// Resource-type id the ecosystem assigns to LRLE images.
pub const LRLE_RESOURCE_TYPE: u32 = 0x2BC0_4EDF;

/// u16 dimensions cannot survive more than 16 halvings.
pub const MAX_MIP_COUNT: u32 = 16;
/// A V2 palette index is one byte.
pub const MAX_PALETTE_SIZE: usize = 256;

const CMD_REPEAT: u8 = 0x00;
const CMD_COLOR: u8 = 0x01;

#[derive(Error, Debug)]
pub enum LrleError {
    #[error("Invalid magic number — not an LRLE image")]
    BadMagic,
    #[error("Unknown LRLE version {0:#010X}")]
    UnknownVersion(u32),
    #[error("Image dimensions {width}×{height} are empty")]
    EmptyImage { width: u16, height: u16 },
    #[error("Mip count {0} outside 1..={MAX_MIP_COUNT}")]
    BadMipCount(u32),
    #[error("Container header truncated")]
    ContainerTruncated,
    #[error("Mip offsets must start at 0, increase, and stay inside the payload")]
    BadOffsets,
    #[error("Palette holds {0} colors, limit {MAX_PALETTE_SIZE}")]
    PaletteTooLarge(u32),
    #[error("Image uses more than {MAX_PALETTE_SIZE} distinct colors — version V2 cannot represent it")]
    TooManyColors,
    #[error("Palette index {index} out of range for {palette_len} colors")]
    BadPaletteIndex { index: u8, palette_len: usize },
    #[error("Chunk for mip {mip} ended after {got} of {expected} pixels")]
    Truncated { mip: usize, got: usize, expected: usize },
    #[error("Chunk for mip {mip} emits past {expected} pixels")]
    Overflow { mip: usize, expected: usize },
    #[error("Run length varint exceeds the 5-byte cap")]
    MalformedVarInt,
    #[error("Run of length zero")]
    ZeroRun,
    #[error("Unknown run command byte {0:#04X}")]
    BadCommand(u8),
    #[error("Mip {mip} holds {got} pixels, dimensions require {expected}")]
    MipSizeMismatch { mip: usize, got: usize, expected: usize },
}

/// Container version discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrleVersion {
    /// Inline ARGB colors, no palette.
    V1,
    /// Palettized: runs carry one-byte indices into an ARGB palette.
    V2,
}

impl LrleVersion {
    #[inline]
    pub fn wire(self) -> u32 {
        match self {
            LrleVersion::V1 => VERSION_V1,
            LrleVersion::V2 => VERSION_V2,
        }
    }

    pub fn from_wire(v: u32) -> Result<Self, LrleError> {
        match v {
            VERSION_V1 => Ok(LrleVersion::V1),
            VERSION_V2 => Ok(LrleVersion::V2),
            other => Err(LrleError::UnknownVersion(other)),
        }
    }
}

/// One mip level: its offset within the payload and its compressed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LrleMip {
    pub offset: u32,
    pub data:   Vec<u8>,
}

/// A parsed LRLE container.  Pixels stay compressed until a decode is
/// requested; `mips` holds the per-level chunks in level order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LrleImage {
    pub width:   u16,
    pub height:  u16,
    pub version: LrleVersion,
    /// ARGB palette; empty in V1.
    pub palette: Vec<u32>,
    pub mips:    Vec<LrleMip>,
}

/// Dimensions of mip level `k` for a base size.
#[inline]
pub fn mip_dimensions(width: u16, height: u16, level: u32) -> (usize, usize) {
    (
        ((width as usize) >> level).max(1),
        ((height as usize) >> level).max(1),
    )
}

fn map_bin(e: BinaryError, mip: usize, got: usize, expected: usize) -> LrleError {
    match e {
        BinaryError::MalformedVarInt => LrleError::MalformedVarInt,
        _ => LrleError::Truncated { mip, got, expected },
    }
}

impl LrleImage {
    // ── Container framing ────────────────────────────────────────────────────

    pub fn parse(bytes: &[u8]) -> Result<Self, LrleError> {
        let mut r = SliceReader::new(bytes);
        let eof = |_: BinaryError| LrleError::ContainerTruncated;

        if r.read_u32().map_err(|_| LrleError::BadMagic)? != LRLE_MAGIC {
            return Err(LrleError::BadMagic);
        }
        let version = LrleVersion::from_wire(r.read_u32().map_err(eof)?)?;
        let width = r.read_u16().map_err(eof)?;
        let height = r.read_u16().map_err(eof)?;
        if width == 0 || height == 0 {
            return Err(LrleError::EmptyImage { width, height });
        }
        let mip_count = r.read_u32().map_err(eof)?;
        if mip_count == 0 || mip_count > MAX_MIP_COUNT {
            return Err(LrleError::BadMipCount(mip_count));
        }

        let mut offsets = Vec::with_capacity(mip_count as usize);
        for _ in 0..mip_count {
            offsets.push(r.read_u32().map_err(eof)?);
        }

        let palette = match version {
            LrleVersion::V1 => Vec::new(),
            LrleVersion::V2 => {
                let color_count = r.read_u32().map_err(eof)?;
                if color_count as usize > MAX_PALETTE_SIZE {
                    return Err(LrleError::PaletteTooLarge(color_count));
                }
                let mut palette = Vec::with_capacity(color_count as usize);
                for _ in 0..color_count {
                    palette.push(r.read_u32().map_err(eof)?);
                }
                palette
            }
        };

        let rest = r.remaining();
        let payload = r.read_bytes(rest).map_err(eof)?;
        if offsets[0] != 0 {
            return Err(LrleError::BadOffsets);
        }
        for pair in offsets.windows(2) {
            if pair[1] <= pair[0] {
                return Err(LrleError::BadOffsets);
            }
        }
        if offsets.last().copied().unwrap() as usize > payload.len() {
            return Err(LrleError::BadOffsets);
        }

        let mut mips = Vec::with_capacity(offsets.len());
        for (k, &off) in offsets.iter().enumerate() {
            let end = offsets
                .get(k + 1)
                .map(|&next| next as usize)
                .unwrap_or(payload.len());
            mips.push(LrleMip {
                offset: off,
                data:   payload[off as usize..end].to_vec(),
            });
        }

        Ok(Self { width, height, version, palette, mips })
    }

    /// Emit the container.  Offsets are recomputed from the chunk lengths,
    /// so a parsed image re-emits byte-identically.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_len: usize = self.mips.iter().map(|m| m.data.len()).sum();
        let mut out = Vec::with_capacity(16 + 4 * self.mips.len() + 4 + 4 * self.palette.len() + payload_len);

        out.extend_from_slice(&LRLE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.version.wire().to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&(self.mips.len() as u32).to_le_bytes());

        let mut offset = 0u32;
        for mip in &self.mips {
            out.extend_from_slice(&offset.to_le_bytes());
            offset += mip.data.len() as u32;
        }

        if self.version == LrleVersion::V2 {
            out.extend_from_slice(&(self.palette.len() as u32).to_le_bytes());
            for &color in &self.palette {
                out.extend_from_slice(&color.to_le_bytes());
            }
        }

        for mip in &self.mips {
            out.extend_from_slice(&mip.data);
        }
        out
    }

    #[inline]
    pub fn mip_count(&self) -> u32 {
        self.mips.len() as u32
    }

    // ── Decode ───────────────────────────────────────────────────────────────

    /// Decode one mip level to ARGB pixels.
    pub fn decode_mip(&self, level: usize) -> Result<Vec<u32>, LrleError> {
        let mip = self
            .mips
            .get(level)
            .ok_or(LrleError::BadMipCount(level as u32))?;
        let (w, h) = mip_dimensions(self.width, self.height, level as u32);
        let expected = w * h;

        let mut out: Vec<u32> = Vec::with_capacity(expected);
        let mut r = SliceReader::new(&mip.data);

        while out.len() < expected {
            let got = out.len();
            let cmd = r.read_u8().map_err(|e| map_bin(e, level, got, expected))?;
            let n = r.read_varint().map_err(|e| map_bin(e, level, got, expected))? as usize;
            if n == 0 {
                return Err(LrleError::ZeroRun);
            }
            if got + n > expected {
                return Err(LrleError::Overflow { mip: level, expected });
            }
            match cmd {
                CMD_REPEAT => {
                    let color = self.read_color(&mut r, level, got, expected)?;
                    out.extend(std::iter::repeat(color).take(n));
                }
                CMD_COLOR => {
                    for _ in 0..n {
                        let color = self.read_color(&mut r, level, out.len(), expected)?;
                        out.push(color);
                    }
                }
                other => return Err(LrleError::BadCommand(other)),
            }
        }
        Ok(out)
    }

    /// Decode every mip level, base level first.
    pub fn decode(&self) -> Result<Vec<Vec<u32>>, LrleError> {
        (0..self.mips.len()).map(|k| self.decode_mip(k)).collect()
    }

    fn read_color(
        &self,
        r: &mut SliceReader<'_>,
        mip: usize,
        got: usize,
        expected: usize,
    ) -> Result<u32, LrleError> {
        match self.version {
            LrleVersion::V1 => r.read_u32().map_err(|e| map_bin(e, mip, got, expected)),
            LrleVersion::V2 => {
                let index = r.read_u8().map_err(|e| map_bin(e, mip, got, expected))?;
                self.palette
                    .get(index as usize)
                    .copied()
                    .ok_or(LrleError::BadPaletteIndex {
                        index,
                        palette_len: self.palette.len(),
                    })
            }
        }
    }

    // ── Encode ───────────────────────────────────────────────────────────────

    /// Encode base-level pixels, generating `mip_count` levels by box
    /// filter (level 0 is the input).
    pub fn encode(
        width: u16,
        height: u16,
        pixels: &[u32],
        mip_count: u32,
        version: LrleVersion,
    ) -> Result<Self, LrleError> {
        if width == 0 || height == 0 {
            return Err(LrleError::EmptyImage { width, height });
        }
        if pixels.len() != width as usize * height as usize {
            return Err(LrleError::MipSizeMismatch {
                mip:      0,
                got:      pixels.len(),
                expected: width as usize * height as usize,
            });
        }
        if mip_count == 0 || mip_count > MAX_MIP_COUNT {
            return Err(LrleError::BadMipCount(mip_count));
        }

        let mut levels: Vec<Vec<u32>> = Vec::with_capacity(mip_count as usize);
        levels.push(pixels.to_vec());
        for k in 1..mip_count {
            let (pw, ph) = mip_dimensions(width, height, k - 1);
            let next = downsample(levels.last().unwrap(), pw, ph);
            levels.push(next);
        }
        Self::from_mips(width, height, &levels, version)
    }

    /// Encode explicit per-level pixels.  Level `k` must hold exactly
    /// `max(1, width>>k) × max(1, height>>k)` pixels.
    pub fn from_mips(
        width: u16,
        height: u16,
        levels: &[Vec<u32>],
        version: LrleVersion,
    ) -> Result<Self, LrleError> {
        if width == 0 || height == 0 {
            return Err(LrleError::EmptyImage { width, height });
        }
        if levels.is_empty() || levels.len() as u32 > MAX_MIP_COUNT {
            return Err(LrleError::BadMipCount(levels.len() as u32));
        }
        for (k, level) in levels.iter().enumerate() {
            let (w, h) = mip_dimensions(width, height, k as u32);
            if level.len() != w * h {
                return Err(LrleError::MipSizeMismatch {
                    mip:      k,
                    got:      level.len(),
                    expected: w * h,
                });
            }
        }

        let palette = match version {
            LrleVersion::V1 => Vec::new(),
            LrleVersion::V2 => derive_palette(levels)?,
        };
        let palette_index: HashMap<u32, u8> = palette
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u8))
            .collect();

        let mut mips = Vec::with_capacity(levels.len());
        let mut offset = 0u32;
        for level in levels {
            let data = encode_chunk(level, version, &palette_index);
            let len = data.len() as u32;
            mips.push(LrleMip { offset, data });
            offset += len;
        }

        Ok(Self { width, height, version, palette, mips })
    }
}

// ── Run-length chunk encoding ────────────────────────────────────────────────

fn push_color(out: &mut Vec<u8>, color: u32, version: LrleVersion, palette_index: &HashMap<u32, u8>) {
    match version {
        LrleVersion::V1 => out.extend_from_slice(&color.to_le_bytes()),
        // Palette is derived from these exact pixels, so the lookup is total.
        LrleVersion::V2 => out.push(palette_index[&color]),
    }
}

/// Greedy run split: repeat runs for any adjacent pair of equal pixels,
/// color runs for everything between.
fn encode_chunk(pixels: &[u32], version: LrleVersion, palette_index: &HashMap<u32, u8>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < pixels.len() {
        let mut run = 1usize;
        while i + run < pixels.len() && pixels[i + run] == pixels[i] {
            run += 1;
        }

        if run >= 2 {
            out.push(CMD_REPEAT);
            write_varint(&mut out, run as u32);
            push_color(&mut out, pixels[i], version, palette_index);
            i += run;
        } else {
            let start = i;
            i += 1;
            while i < pixels.len() {
                if i + 1 < pixels.len() && pixels[i + 1] == pixels[i] {
                    break;
                }
                i += 1;
            }
            out.push(CMD_COLOR);
            write_varint(&mut out, (i - start) as u32);
            for &px in &pixels[start..i] {
                push_color(&mut out, px, version, palette_index);
            }
        }
    }
    out
}

/// Distinct colors across every level, first-seen order.
fn derive_palette(levels: &[Vec<u32>]) -> Result<Vec<u32>, LrleError> {
    let mut palette = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for level in levels {
        for &px in level {
            if seen.insert(px) {
                palette.push(px);
                if palette.len() > MAX_PALETTE_SIZE {
                    return Err(LrleError::TooManyColors);
                }
            }
        }
    }
    Ok(palette)
}

// ── Mip generation ───────────────────────────────────────────────────────────

/// Box-filter halving.  Odd trailing rows/columns are clamped into the last
/// destination pixel's block.
fn downsample(src: &[u32], w: usize, h: usize) -> Vec<u32> {
    let nw = (w / 2).max(1);
    let nh = (h / 2).max(1);
    let mut out = Vec::with_capacity(nw * nh);

    for dy in 0..nh {
        for dx in 0..nw {
            let x0 = (dx * 2).min(w - 1);
            let y0 = (dy * 2).min(h - 1);
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);

            let mut acc = [0u32; 4];
            let mut count = 0u32;
            for &(x, y) in &[(x0, y0), (x1, y0), (x0, y1), (x1, y1)] {
                let px = src[y * w + x];
                acc[0] += px >> 24;
                acc[1] += (px >> 16) & 0xFF;
                acc[2] += (px >> 8) & 0xFF;
                acc[3] += px & 0xFF;
                count += 1;
            }
            // A clamped corner contributes the same sample more than once,
            // which keeps the divisor a constant 4.
            out.push(
                ((acc[0] / count) << 24)
                    | ((acc[1] / count) << 16)
                    | ((acc[2] / count) << 8)
                    | (acc[3] / count),
            );
        }
    }
    out
}

// ── Factory wiring ───────────────────────────────────────────────────────────

/// An LRLE image behind the generic resource interface.
pub struct LrleResource {
    pub key:   ResourceKey,
    pub image: LrleImage,
}

impl Resource for LrleResource {
    fn resource_type(&self) -> u32 {
        LRLE_RESOURCE_TYPE
    }

    fn serialize(&self) -> Vec<u8> {
        self.image.to_bytes()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Factory for [`LRLE_RESOURCE_TYPE`]; register it with
/// [`crate::registry::register`] to decode LRLE payloads on lookup.
pub struct LrleFactory;

impl ResourceFactory for LrleFactory {
    fn decode(&self, payload: &[u8], key: ResourceKey) -> Result<Box<dyn Resource>, DecodeError> {
        let image = LrleImage::parse(payload).map_err(|e| DecodeError::Malformed {
            resource_type: LRLE_RESOURCE_TYPE,
            reason:        e.to_string(),
        })?;
        Ok(Box::new(LrleResource { key, image }))
    }

    fn recognized_types(&self) -> &[u32] {
        &[LRLE_RESOURCE_TYPE]
    }
}
