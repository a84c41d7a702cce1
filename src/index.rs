//! Packed resource index — variable-width entries with shared-field hoisting.
//!
//! # On-disk layout
//!
//! ```text
//! index_type_flags: u32          bits 0/1/2 hoist type / group / instance-high
//! [shared_type: u32]             present iff bit 0
//! [shared_group: u32]            present iff bit 1
//! [shared_instance_high: u32]    present iff bit 2
//! entries: resource_count × {
//!     [type_id: u32]             absent when hoisted
//!     [group_id: u32]            absent when hoisted
//!     [instance_high: u32]       absent when hoisted
//!     instance_low:    u32
//!     chunk_offset:    u32
//!     raw_file_size:   u32       bit 31 always stored set, masked on read
//!     memory_size:     u32
//!     compression_tag: u16       0 = stored, 0xFFFF = compressed, open set
//!     aux:             u16       conventionally 1
//! }
//! ```
//!
//! Per-entry width is 32 bytes minus 4 for each hoisted field, so one of
//! {20, 24, 28, 32}.
//!
//! # Gating
//! The blob is read iff `index_size > 0 && resource_count > 0`.  The header's
//! index-position slots are *never* part of that decision — a zero position
//! slot is an ordinary modern file.  Treating position 0 as "no index" is the
//! classic shipped defect this module regression-tests against.
//!
//! # Writing
//! The shared bits are recomputed from the entries every time: a bit is set
//! iff that field is identical across all of them.  The layout the entries
//! were read with is deliberately not preserved, since edits may have broken
//! the sharing.

use bitflags::bitflags;
use thiserror::Error;

use crate::binary::{BinaryError, SliceReader};
use crate::key::ResourceKey;

/// Sentinel chunk offset for entries whose payload exists only in memory.
pub const CHUNK_OFFSET_UNALLOCATED: u32 = u32::MAX;

/// Upper bound on a sane index blob; anything larger is corruption, not a
/// package with two billion resources.
pub const MAX_INDEX_SIZE: u32 = 0x7FFF_FFFF;

/// Entry-level compression marker: payload carries a compression frame.
pub const ENTRY_COMPRESSED: u16 = 0xFFFF;
/// Conventional value of the trailing per-entry field.
pub const AUX_DEFAULT: u16 = 0x0001;

bitflags! {
    /// The index-type bitfield at the head of the blob.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IndexFlags: u32 {
        const SHARED_TYPE          = 1 << 0;
        const SHARED_GROUP         = 1 << 1;
        const SHARED_INSTANCE_HIGH = 1 << 2;
    }
}

impl IndexFlags {
    /// Bytes per entry under this flag set.
    #[inline]
    pub fn entry_size(self) -> usize {
        32 - 4 * self.bits().count_ones() as usize
    }

    /// Bytes of the shared header (flags word plus hoisted fields).
    #[inline]
    pub fn shared_header_size(self) -> usize {
        4 + 4 * self.bits().count_ones() as usize
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index type flags {0:#010X} set bits above the defined three")]
    ImpossibleFlags(u32),
    #[error("Index blob truncated: {0}")]
    Truncated(#[from] BinaryError),
    #[error("Index blob is {actual} bytes, layout requires {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Index size {size} exceeds the {MAX_INDEX_SIZE} byte ceiling")]
    TooLarge { size: u32 },
    #[error("Index at {position} with size {size} overruns the {container} byte container")]
    OutOfBounds { position: u64, size: u32, container: u64 },
}

// ── Entry ────────────────────────────────────────────────────────────────────

/// A defect found while validating an entry at open time.  Recorded on the
/// entry and raised only when the payload is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDefect {
    /// `chunk_offset + file_size` extends past the container.
    PastEnd,
    /// The chunk starts inside the 96-byte header.
    OverlapsHeader,
    /// The chunk overlaps a previously validated entry's chunk.
    OverlapsEntry,
}

/// One resource's identity, location, and sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key:             ResourceKey,
    /// Absolute byte position of the payload; [`CHUNK_OFFSET_UNALLOCATED`]
    /// for dirty entries that have never been written.
    pub chunk_offset:    u32,
    /// Bytes on disk, after masking the always-set top bit.
    pub file_size:       u32,
    /// Bytes after decompression.
    pub memory_size:     u32,
    pub compression_tag: u16,
    pub aux:             u16,
    /// Tombstone: skipped by iteration and dropped at the next save.
    pub(crate) deleted:  bool,
    pub(crate) defect:   Option<EntryDefect>,
}

impl IndexEntry {
    pub fn new(key: ResourceKey, chunk_offset: u32, file_size: u32, memory_size: u32, compression_tag: u16) -> Self {
        Self {
            key,
            chunk_offset,
            file_size,
            memory_size,
            compression_tag,
            aux: AUX_DEFAULT,
            deleted: false,
            defect: None,
        }
    }

    /// An entry carries compressed bytes iff the sizes differ or the tag
    /// says so.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.file_size != self.memory_size || self.compression_tag != 0
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    #[inline]
    pub fn defect(&self) -> Option<EntryDefect> {
        self.defect
    }
}

// ── Read ─────────────────────────────────────────────────────────────────────

/// Parse a packed index blob holding `count` entries.
pub fn read_index(blob: &[u8], count: u32) -> Result<Vec<IndexEntry>, IndexError> {
    let mut r = SliceReader::new(blob);

    let raw_flags = r.read_u32()?;
    let flags = IndexFlags::from_bits(raw_flags)
        .ok_or(IndexError::ImpossibleFlags(raw_flags))?;

    let shared_type = if flags.contains(IndexFlags::SHARED_TYPE) { Some(r.read_u32()?) } else { None };
    let shared_group = if flags.contains(IndexFlags::SHARED_GROUP) { Some(r.read_u32()?) } else { None };
    let shared_instance_high =
        if flags.contains(IndexFlags::SHARED_INSTANCE_HIGH) { Some(r.read_u32()?) } else { None };

    let expected = flags.shared_header_size() + flags.entry_size() * count as usize;
    if blob.len() != expected {
        return Err(IndexError::SizeMismatch { expected, actual: blob.len() });
    }

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_id = match shared_type {
            Some(t) => t,
            None => r.read_u32()?,
        };
        let group_id = match shared_group {
            Some(g) => g,
            None => r.read_u32()?,
        };
        let instance_high = match shared_instance_high {
            Some(i) => i,
            None => r.read_u32()?,
        };
        let instance_low = r.read_u32()?;
        let chunk_offset = r.read_u32()?;
        let raw_file_size = r.read_u32()?;
        let memory_size = r.read_u32()?;
        let compression_tag = r.read_u16()?;
        let aux = r.read_u16()?;

        entries.push(IndexEntry {
            key: ResourceKey::new(
                type_id,
                group_id,
                ResourceKey::join_instance(instance_high, instance_low),
            ),
            chunk_offset,
            file_size: raw_file_size & 0x7FFF_FFFF,
            memory_size,
            compression_tag,
            aux,
            deleted: false,
            defect: None,
        });
    }
    Ok(entries)
}

// ── Write ────────────────────────────────────────────────────────────────────

/// Pick the widest sharing the entries allow: a bit is set iff the field is
/// identical across every entry.  An empty list shares nothing.
pub fn choose_flags(entries: &[IndexEntry]) -> IndexFlags {
    let Some(first) = entries.first() else {
        return IndexFlags::empty();
    };
    let mut flags = IndexFlags::all();
    for e in &entries[1..] {
        if e.key.type_id != first.key.type_id {
            flags.remove(IndexFlags::SHARED_TYPE);
        }
        if e.key.group_id != first.key.group_id {
            flags.remove(IndexFlags::SHARED_GROUP);
        }
        if e.key.instance_high() != first.key.instance_high() {
            flags.remove(IndexFlags::SHARED_INSTANCE_HIGH);
        }
    }
    flags
}

/// Emit the packed blob for `entries` (tombstones must already be gone).
pub fn write_index(entries: &[IndexEntry]) -> Vec<u8> {
    let flags = choose_flags(entries);
    let mut out = Vec::with_capacity(flags.shared_header_size() + flags.entry_size() * entries.len());

    out.extend_from_slice(&flags.bits().to_le_bytes());
    if let Some(first) = entries.first() {
        if flags.contains(IndexFlags::SHARED_TYPE) {
            out.extend_from_slice(&first.key.type_id.to_le_bytes());
        }
        if flags.contains(IndexFlags::SHARED_GROUP) {
            out.extend_from_slice(&first.key.group_id.to_le_bytes());
        }
        if flags.contains(IndexFlags::SHARED_INSTANCE_HIGH) {
            out.extend_from_slice(&first.key.instance_high().to_le_bytes());
        }
    }

    for e in entries {
        if !flags.contains(IndexFlags::SHARED_TYPE) {
            out.extend_from_slice(&e.key.type_id.to_le_bytes());
        }
        if !flags.contains(IndexFlags::SHARED_GROUP) {
            out.extend_from_slice(&e.key.group_id.to_le_bytes());
        }
        if !flags.contains(IndexFlags::SHARED_INSTANCE_HIGH) {
            out.extend_from_slice(&e.key.instance_high().to_le_bytes());
        }
        out.extend_from_slice(&e.key.instance_low().to_le_bytes());
        out.extend_from_slice(&e.chunk_offset.to_le_bytes());
        out.extend_from_slice(&(e.file_size | 0x8000_0000).to_le_bytes());
        out.extend_from_slice(&e.memory_size.to_le_bytes());
        out.extend_from_slice(&e.compression_tag.to_le_bytes());
        out.extend_from_slice(&e.aux.to_le_bytes());
    }
    out
}

/// Validate the blob's placement against the container before reading it.
pub fn check_bounds(position: u64, size: u32, container: u64) -> Result<(), IndexError> {
    if size > MAX_INDEX_SIZE {
        return Err(IndexError::TooLarge { size });
    }
    if position + size as u64 > container {
        return Err(IndexError::OutOfBounds { position, size, container });
    }
    Ok(())
}
