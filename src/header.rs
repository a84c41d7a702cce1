//! Package header — format anchor at offset 0.
//!
//! # On-disk layout (96 bytes, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic               = "DBPF"  (4 ASCII bytes)
//!    4      4   major               = 2       (LE u32)
//!    8      4   minor               = 0 or 1  (LE u32)
//!   12      4   user_major
//!   16      4   user_minor
//!   20      4   flags
//!   24      4   created             seconds since the Unix epoch
//!   28      4   modified
//!   32      4   index_major
//!   36      4   resource_count
//!   40      4   index_position_low  legacy u32 slot, 0 in modern files
//!   44      4   index_size          total bytes of the packed index blob
//!   48      4   hole_count          preserved on read, written 0
//!   52      4   hole_position       preserved on read, written 0
//!   56      4   hole_size           preserved on read, written 0
//!   60      4   index_minor
//!   64      8   index_position      u64 slot, authoritative when non-zero
//!   72     24   reserved            preserved verbatim, zero in new files
//! ```
//!
//! # The two index-position slots
//! Modern files leave the legacy u32 at offset 40 zeroed and carry the real
//! offset in the u64 at offset 64.  [`PackageHeader::index_position`] prefers
//! the u64 slot and falls back to the legacy one.  Neither slot ever decides
//! whether the index is loaded: that is gated on `index_size` and
//! `resource_count` alone, because a zero position slot is an ordinary,
//! valid file — not a sentinel.
//!
//! # Version handling
//! Unknown major/minor values are preserved and do not change parser
//! behavior; only the index blob's own type flags control index parsing.

use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"DBPF";
pub const HEADER_SIZE: usize = 96;

pub const FORMAT_MAJOR: u32 = 2;
pub const FORMAT_MINOR: u32 = 1;
/// Constants observed in shipped game files; preserved on read, written
/// as-is into new packages.
pub const DEFAULT_INDEX_MAJOR: u32 = 0;
pub const DEFAULT_INDEX_MINOR: u32 = 3;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Invalid magic number — not a DBPF package")]
    BadMagic,
    #[error("Header truncated: {0} of {HEADER_SIZE} bytes available")]
    Truncated(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageHeader {
    pub major:              u32,
    pub minor:              u32,
    pub user_major:         u32,
    pub user_minor:         u32,
    pub flags:              u32,
    pub created:            u32,
    pub modified:           u32,
    pub index_major:        u32,
    pub resource_count:     u32,
    pub index_position_low: u32,
    pub index_size:         u32,
    pub hole_count:         u32,
    pub hole_position:      u32,
    pub hole_size:          u32,
    pub index_minor:        u32,
    pub index_position_u64: u64,
    /// Trailing reserved bytes, preserved verbatim so foreign files
    /// round-trip byte-identically.
    pub reserved:           [u8; 24],
}

impl Default for PackageHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageHeader {
    /// Header for a freshly created package.  Timestamps start at zero and
    /// are stamped by the package on save.
    pub fn new() -> Self {
        Self {
            major:              FORMAT_MAJOR,
            minor:              FORMAT_MINOR,
            user_major:         0,
            user_minor:         0,
            flags:              0,
            created:            0,
            modified:           0,
            index_major:        DEFAULT_INDEX_MAJOR,
            resource_count:     0,
            index_position_low: 0,
            index_size:         0,
            hole_count:         0,
            hole_position:      0,
            hole_size:          0,
            index_minor:        DEFAULT_INDEX_MINOR,
            index_position_u64: 0,
            reserved:           [0u8; 24],
        }
    }

    /// Effective index position: the u64 slot when non-zero, else the
    /// legacy u32 slot.
    #[inline]
    pub fn index_position(&self) -> u64 {
        if self.index_position_u64 != 0 {
            self.index_position_u64
        } else {
            self.index_position_low as u64
        }
    }

    /// Parse and validate a header.  Fails on short input or a bad magic;
    /// everything else is preserved as-is.
    pub fn read(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated(bytes.len()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(HeaderError::BadMagic);
        }

        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());

        Ok(Self {
            major:              u32_at(4),
            minor:              u32_at(8),
            user_major:         u32_at(12),
            user_minor:         u32_at(16),
            flags:              u32_at(20),
            created:            u32_at(24),
            modified:           u32_at(28),
            index_major:        u32_at(32),
            resource_count:     u32_at(36),
            index_position_low: u32_at(40),
            index_size:         u32_at(44),
            hole_count:         u32_at(48),
            hole_position:      u32_at(52),
            hole_size:          u32_at(56),
            index_minor:        u32_at(60),
            index_position_u64: u64::from_le_bytes(bytes[64..72].try_into().unwrap()),
            reserved:           bytes[72..96].try_into().unwrap(),
        })
    }

    /// Emit exactly 96 bytes in the canonical field order.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);

        let mut put = |off: usize, v: u32| buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        put(4, self.major);
        put(8, self.minor);
        put(12, self.user_major);
        put(16, self.user_minor);
        put(20, self.flags);
        put(24, self.created);
        put(28, self.modified);
        put(32, self.index_major);
        put(36, self.resource_count);
        put(40, self.index_position_low);
        put(44, self.index_size);
        put(48, self.hole_count);
        put(52, self.hole_position);
        put(56, self.hole_size);
        put(60, self.index_minor);

        buf[64..72].copy_from_slice(&self.index_position_u64.to_le_bytes());
        buf[72..96].copy_from_slice(&self.reserved);
        buf
    }
}
