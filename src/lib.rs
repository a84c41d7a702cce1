//! # dbpf — DBPF v2.1 package container reference implementation
//!
//! Format guarantees (frozen for v2.x):
//! - All numeric fields are little-endian; the single exception is the
//!   big-endian uncompressed-size field inside a compression frame
//! - The header is exactly 96 bytes at offset 0; unknown versions and
//!   reserved bytes are preserved, never interpreted
//! - Index loading is gated on `index_size` and `resource_count` only; the
//!   index-position slots are locations, never sentinels
//! - The index-type bitfield hoists fields shared by every entry into the
//!   shared index header; writers recompute the sharing from the entries
//! - Compression tags are an open namespace: unknown tags never fail an
//!   open, and their payload bytes survive a save/load cycle verbatim
//! - Insertion order is on-disk order and survives save/load round-trips;
//!   tombstones are elided at save time
//!
//! The LRLE palettized run-length image codec (`lrle`) is the one resource
//! wrapper shipped in-tree; every other resource type round-trips through
//! the registry's raw pass-through factory.

pub mod binary;
pub mod codec;
pub mod hash;
pub mod header;
pub mod index;
pub mod key;
pub mod lrle;
pub mod package;
pub mod perf;
pub mod registry;

// Flat re-exports for the most common types.
pub use binary::{BinaryError, SliceReader};
pub use codec::{CodecError, TAG_DEFLATE, TAG_INTERNAL, TAG_STORED, TAG_ZLIB};
pub use hash::{fnv1a_32, fnv1a_64};
pub use header::{HeaderError, PackageHeader, HEADER_SIZE};
pub use index::{EntryDefect, IndexEntry, IndexError, IndexFlags};
pub use key::ResourceKey;
pub use lrle::{LrleError, LrleFactory, LrleImage, LrleVersion, LRLE_RESOURCE_TYPE};
pub use package::{ByteSource, OpenOptions, Package, PackageError};
pub use registry::{RawResource, Resource, ResourceFactory};
