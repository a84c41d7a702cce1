//! The package engine — random-access store of (key → entry → payload).
//!
//! # Reader
//! [`Package::open`] parses the 96-byte header and the packed index and
//! registers entries in on-disk order.  No payload is touched until
//! [`Package::read_payload`] seeks to the entry's chunk, reads `file_size`
//! bytes, and decompresses per the entry's compression frame.  Per-entry
//! corruption found while validating the index is recorded on the entry and
//! raised only when that payload is requested; header and index framing
//! errors fail the open.
//!
//! # Writer
//! [`Package::save_to`] reserves a header placeholder, writes every live
//! entry's payload in insertion order (clean entries are stream-copied from
//! the old source, dirty entries come from their in-memory overlays), writes
//! the packed index, then patches the header at offset 0 with the final
//! offsets, sizes, and modified date.  On success the sink becomes the
//! backing source and the package is clean; on any failure the in-memory
//! package is unchanged and the sink's contents are undefined (callers
//! wanting crash safety write to a temp file and rename).
//!
//! # Concurrency
//! A `Package` owns its source cursor, so reads and mutations take
//! `&mut self`; one package is single-threaded, distinct packages are
//! independent.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::Utc;
use log::{debug, warn};
use thiserror::Error;

use crate::codec::{self, CodecError, TAG_DEFLATE};
use crate::header::{HeaderError, PackageHeader, HEADER_SIZE};
use crate::index::{
    self, EntryDefect, IndexEntry, IndexError, CHUNK_OFFSET_UNALLOCATED, ENTRY_COMPRESSED,
};
use crate::key::ResourceKey;
use crate::perf::{compress_batch, CompressJob};

#[derive(Error, Debug)]
pub enum PackageError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Decode(#[from] crate::registry::DecodeError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key {0} is already present (duplicates not permitted)")]
    DuplicateKey(ResourceKey),
    #[error("No entry with key {0}")]
    EntryNotFound(ResourceKey),
    #[error("Entry {key} is corrupt: {defect:?}")]
    CorruptEntry { key: ResourceKey, defect: EntryDefect },
    #[error("Entry {key}: {got} of {expected} payload bytes readable")]
    PayloadTruncated { key: ResourceKey, expected: u32, got: usize },
    #[error("Package has no backing source for on-disk payloads")]
    NoBackingSource,
    #[error("Container grew past the 4 GiB addressable by u32 chunk offsets")]
    TooLarge,
}

// ── Byte source ──────────────────────────────────────────────────────────────

/// The bytes behind a package: a file on disk or an owned memory buffer.
///
/// Reading requires only `Read + Seek`; [`Package::save_to`] additionally
/// writes, so a file sink must be opened writable
/// ([`ByteSource::create_file`]) — saving into a read-only handle surfaces
/// the OS error.
pub enum ByteSource {
    File(File),
    Memory(Cursor<Vec<u8>>),
}

impl ByteSource {
    /// Open an existing file read-only.
    pub fn open_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::File(File::open(path)?))
    }

    /// Create (or truncate) a file readable and writable — a save sink that
    /// can serve as the backing source afterwards.
    pub fn create_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::File(
            File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        ))
    }

    /// An empty in-memory buffer.
    pub fn memory() -> Self {
        Self::Memory(Cursor::new(Vec::new()))
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::Memory(Cursor::new(bytes))
    }

    /// Total container length in bytes.
    pub fn len(&self) -> io::Result<u64> {
        match self {
            Self::File(f) => Ok(f.metadata()?.len()),
            Self::Memory(c) => Ok(c.get_ref().len() as u64),
        }
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File(f) => f.read(buf),
            Self::Memory(c) => c.read(buf),
        }
    }
}

impl Write for ByteSource {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File(f) => f.write(buf),
            Self::Memory(c) => c.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File(f) => f.flush(),
            Self::Memory(c) => c.flush(),
        }
    }
}

impl Seek for ByteSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::File(f) => f.seek(pos),
            Self::Memory(c) => c.seek(pos),
        }
    }
}

/// Read until `buf` is full or the source is exhausted; returns bytes read.
fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Configuration for [`Package::open_with`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Fail the open on the first per-entry defect instead of recording it
    /// and raising it from `read_payload`.
    pub strict: bool,
}

// ── Overlay ──────────────────────────────────────────────────────────────────

/// In-memory payload for a new or modified entry.
///
/// When `already_framed` is set the bytes carry their compression frame and
/// are written verbatim; otherwise the writer frame-compresses on save iff
/// the entry's compression tag says so.
struct Overlay {
    bytes:          Vec<u8>,
    already_framed: bool,
}

// ── Package ──────────────────────────────────────────────────────────────────

pub struct Package {
    source:   Option<ByteSource>,
    header:   PackageHeader,
    entries:  Vec<IndexEntry>,
    /// Key → slot of its first live entry.
    lookup:   HashMap<ResourceKey, usize>,
    overlays: HashMap<usize, Overlay>,
    dirty:    bool,
}

impl Package {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn open(source: ByteSource) -> Result<Self, PackageError> {
        Self::open_with(source, OpenOptions::default())
    }

    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self, PackageError> {
        Self::open(ByteSource::open_file(path)?)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PackageError> {
        Self::open(ByteSource::from_vec(bytes))
    }

    /// Parse the header and the packed index.  Payloads stay on disk.
    pub fn open_with(mut source: ByteSource, options: OpenOptions) -> Result<Self, PackageError> {
        let container_len = source.len()?;

        source.seek(SeekFrom::Start(0))?;
        let mut header_buf = [0u8; HEADER_SIZE];
        let got = read_fully(&mut source, &mut header_buf)?;
        let header = PackageHeader::read(&header_buf[..got])?;

        // Index gating: size and count only.  The position slots are never
        // part of this decision — a zeroed legacy slot is an ordinary file.
        let mut entries = if header.index_size > 0 && header.resource_count > 0 {
            let position = header.index_position();
            index::check_bounds(position, header.index_size, container_len)?;
            source.seek(SeekFrom::Start(position))?;
            let mut blob = vec![0u8; header.index_size as usize];
            source.read_exact(&mut blob)?;
            index::read_index(&blob, header.resource_count)?
        } else {
            Vec::new()
        };

        validate_entries(&mut entries, container_len);
        if options.strict {
            if let Some(bad) = entries.iter().find(|e| e.defect().is_some()) {
                return Err(PackageError::CorruptEntry {
                    key:    bad.key,
                    defect: bad.defect().unwrap(),
                });
            }
        }

        let mut lookup = HashMap::with_capacity(entries.len());
        for (slot, entry) in entries.iter().enumerate() {
            lookup.entry(entry.key).or_insert(slot);
        }

        debug!(
            "opened package: {} entries, index at {:#X} ({} B)",
            entries.len(),
            header.index_position(),
            header.index_size,
        );

        Ok(Self {
            source: Some(source),
            header,
            entries,
            lookup,
            overlays: HashMap::new(),
            dirty: false,
        })
    }

    /// A fresh, dirty, source-less package with a defaulted header.
    pub fn create_empty() -> Self {
        let now = Utc::now().timestamp() as u32;
        let mut header = PackageHeader::new();
        header.created = now;
        header.modified = now;
        Self {
            source:   None,
            header,
            entries:  Vec::new(),
            lookup:   HashMap::new(),
            overlays: HashMap::new(),
            dirty:    true,
        }
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    #[inline]
    pub fn header(&self) -> &PackageHeader {
        &self.header
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Live entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter().filter(|e| !e.is_deleted())
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first live entry under `key`.
    pub fn find(&self, key: ResourceKey) -> Option<&IndexEntry> {
        let slot = *self.lookup.get(&key)?;
        let entry = &self.entries[slot];
        (!entry.is_deleted()).then_some(entry)
    }

    fn live_slot(&self, key: ResourceKey) -> Result<usize, PackageError> {
        match self.lookup.get(&key) {
            Some(&slot) if !self.entries[slot].is_deleted() => Ok(slot),
            _ => Err(PackageError::EntryNotFound(key)),
        }
    }

    // ── Payload reads ────────────────────────────────────────────────────────

    /// Decompressed payload bytes for `key` — exactly `memory_size` bytes.
    pub fn read_payload(&mut self, key: ResourceKey) -> Result<Vec<u8>, PackageError> {
        let slot = self.live_slot(key)?;
        if let Some(defect) = self.entries[slot].defect() {
            return Err(PackageError::CorruptEntry { key, defect });
        }

        if let Some(overlay) = self.overlays.get(&slot) {
            let entry = &self.entries[slot];
            return if overlay.already_framed && entry.is_compressed() {
                Ok(codec::decompress_framed(&overlay.bytes, entry.memory_size as usize)?)
            } else {
                Ok(overlay.bytes.clone())
            };
        }

        let entry = self.entries[slot].clone();
        let raw = self.read_chunk(&entry)?;

        // Equal sizes mean the bytes are stored, whatever the tag claims.
        if !entry.is_compressed() || entry.file_size == entry.memory_size {
            return Ok(raw);
        }
        Ok(codec::decompress_framed(&raw, entry.memory_size as usize)?)
    }

    /// On-disk bytes for `key`, verbatim — compression frame included.
    /// This is how `0x5A42` and other undecodable payloads stay reachable.
    pub fn read_raw_payload(&mut self, key: ResourceKey) -> Result<Vec<u8>, PackageError> {
        let slot = self.live_slot(key)?;
        if let Some(overlay) = self.overlays.get(&slot) {
            return Ok(overlay.bytes.clone());
        }
        let entry = self.entries[slot].clone();
        self.read_chunk(&entry)
    }

    /// Read and decode `key` through the process-wide factory registry.
    /// Types without a registered factory come back as the raw wrapper.
    pub fn read_resource(
        &mut self,
        key: ResourceKey,
    ) -> Result<Box<dyn crate::registry::Resource>, PackageError> {
        let payload = self.read_payload(key)?;
        let factory = crate::registry::get_or_default(key.type_id);
        Ok(factory.decode(&payload, key)?)
    }

    fn read_chunk(&mut self, entry: &IndexEntry) -> Result<Vec<u8>, PackageError> {
        let source = self.source.as_mut().ok_or(PackageError::NoBackingSource)?;
        source.seek(SeekFrom::Start(entry.chunk_offset as u64))?;
        let mut raw = vec![0u8; entry.file_size as usize];
        let got = read_fully(source, &mut raw)?;
        if got < raw.len() {
            return Err(PackageError::PayloadTruncated {
                key:      entry.key,
                expected: entry.file_size,
                got,
            });
        }
        Ok(raw)
    }

    // ── Mutation ─────────────────────────────────────────────────────────────

    /// Add a resource.  `compressed` requests frame compression at save
    /// time; the bytes are held uncompressed until then.
    pub fn add(
        &mut self,
        key: ResourceKey,
        bytes: Vec<u8>,
        compressed: bool,
        allow_duplicate: bool,
    ) -> Result<&IndexEntry, PackageError> {
        if !allow_duplicate && self.find(key).is_some() {
            return Err(PackageError::DuplicateKey(key));
        }

        let len = bytes.len() as u32;
        let tag = if compressed { ENTRY_COMPRESSED } else { 0 };
        let entry = IndexEntry::new(key, CHUNK_OFFSET_UNALLOCATED, len, len, tag);

        let slot = self.entries.len();
        self.entries.push(entry);
        self.overlays.insert(slot, Overlay { bytes, already_framed: false });
        self.lookup.entry(key).or_insert(slot);
        self.dirty = true;
        Ok(&self.entries[slot])
    }

    /// Swap in new payload bytes for an existing entry.
    pub fn replace(&mut self, key: ResourceKey, bytes: Vec<u8>) -> Result<(), PackageError> {
        let slot = self.live_slot(key)?;
        let len = bytes.len() as u32;

        let entry = &mut self.entries[slot];
        entry.compression_tag = if entry.is_compressed() { ENTRY_COMPRESSED } else { 0 };
        entry.chunk_offset = CHUNK_OFFSET_UNALLOCATED;
        entry.file_size = len;
        entry.memory_size = len;
        entry.defect = None;

        self.overlays.insert(slot, Overlay { bytes, already_framed: false });
        self.dirty = true;
        Ok(())
    }

    /// Tombstone the first live entry under `key`.  The entry disappears
    /// from iteration now and from disk at the next save.
    pub fn delete(&mut self, key: ResourceKey) -> bool {
        let Ok(slot) = self.live_slot(key) else {
            return false;
        };
        self.entries[slot].deleted = true;
        self.overlays.remove(&slot);
        self.lookup.remove(&key);
        // A permitted duplicate takes over the key.
        if let Some(next) = self
            .entries
            .iter()
            .position(|e| !e.is_deleted() && e.key == key)
        {
            self.lookup.insert(key, next);
        }
        self.dirty = true;
        true
    }

    /// Force the next save to rewrite and relocate every payload,
    /// eliminating tombstones and inter-chunk gaps.
    pub fn compact(&mut self) {
        self.dirty = true;
    }

    // ── Save ─────────────────────────────────────────────────────────────────

    /// Write the whole container into `sink`.  On success the sink becomes
    /// the backing source and the package is clean; on failure the in-memory
    /// package is unchanged.
    pub fn save_to(&mut self, mut sink: ByteSource) -> Result<(), PackageError> {
        let live: Vec<usize> = (0..self.entries.len())
            .filter(|&slot| !self.entries[slot].is_deleted())
            .collect();

        // Compress dirty payloads up front as one batch.
        let mut job_slots = Vec::new();
        let mut jobs = Vec::new();
        for &slot in &live {
            if let Some(overlay) = self.overlays.get(&slot) {
                if !overlay.already_framed && self.entries[slot].compression_tag != 0 {
                    job_slots.push(slot);
                    jobs.push(CompressJob { tag: TAG_DEFLATE, src: &overlay.bytes });
                }
            }
        }
        let framed: HashMap<usize, Vec<u8>> = job_slots
            .into_iter()
            .zip(compress_batch(&jobs)?)
            .collect();

        sink.seek(SeekFrom::Start(0))?;
        sink.write_all(&[0u8; HEADER_SIZE])?;

        let mut staged: Vec<IndexEntry> = Vec::with_capacity(live.len());
        for &slot in &live {
            let offset = u32::try_from(sink.stream_position()?)
                .map_err(|_| PackageError::TooLarge)?;
            let entry = &self.entries[slot];

            let (file_size, tag) = match self.overlays.get(&slot) {
                Some(overlay) if overlay.already_framed => {
                    sink.write_all(&overlay.bytes)?;
                    (overlay.bytes.len() as u32, entry.compression_tag)
                }
                Some(overlay) if entry.compression_tag != 0 => {
                    let frame = &framed[&slot];
                    if frame.len() < overlay.bytes.len() {
                        sink.write_all(frame)?;
                        (frame.len() as u32, ENTRY_COMPRESSED)
                    } else {
                        // Compression did not pay off; store instead.
                        sink.write_all(&overlay.bytes)?;
                        (overlay.bytes.len() as u32, 0)
                    }
                }
                Some(overlay) => {
                    sink.write_all(&overlay.bytes)?;
                    (overlay.bytes.len() as u32, 0)
                }
                None => {
                    // Clean entry: stream-copy the existing chunk.
                    let source = self.source.as_mut().ok_or(PackageError::NoBackingSource)?;
                    source.seek(SeekFrom::Start(entry.chunk_offset as u64))?;
                    let copied =
                        io::copy(&mut Read::by_ref(source).take(entry.file_size as u64), &mut sink)?;
                    if copied != entry.file_size as u64 {
                        return Err(PackageError::PayloadTruncated {
                            key:      entry.key,
                            expected: entry.file_size,
                            got:      copied as usize,
                        });
                    }
                    (entry.file_size, entry.compression_tag)
                }
            };

            let mut out = IndexEntry::new(entry.key, offset, file_size, entry.memory_size, tag);
            out.aux = entry.aux;
            staged.push(out);
        }

        let index_position = sink.stream_position()?;
        let blob = index::write_index(&staged);
        sink.write_all(&blob)?;

        let mut header = self.header.clone();
        header.resource_count = staged.len() as u32;
        header.index_size = blob.len() as u32;
        header.index_position_low = 0;
        header.index_position_u64 = index_position;
        header.modified = Utc::now().timestamp() as u32;
        if header.created == 0 {
            header.created = header.modified;
        }

        sink.seek(SeekFrom::Start(0))?;
        sink.write_all(&header.to_bytes())?;
        sink.flush()?;

        // Commit: only now does the in-memory model change.
        self.header = header;
        self.entries = staged;
        self.overlays.clear();
        self.lookup = self
            .entries
            .iter()
            .enumerate()
            .fold(HashMap::new(), |mut map, (slot, e)| {
                map.entry(e.key).or_insert(slot);
                map
            });
        self.source = Some(sink);
        self.dirty = false;
        Ok(())
    }

    /// Save into a new file at `path`.
    pub fn save_as<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PackageError> {
        self.save_to(ByteSource::create_file(path)?)
    }

    /// Save into memory and return the container bytes.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, PackageError> {
        self.save_to(ByteSource::memory())?;
        match self.source.as_ref() {
            Some(ByteSource::Memory(cursor)) => Ok(cursor.get_ref().clone()),
            _ => unreachable!("save_to installed the memory sink"),
        }
    }
}

/// Record defects for chunks that overlap the header, overrun the container,
/// or overlap each other.  Defects are per entry and do not fail the open.
fn validate_entries(entries: &mut [IndexEntry], container_len: u64) {
    for entry in entries.iter_mut() {
        if entry.file_size == 0 || entry.chunk_offset == CHUNK_OFFSET_UNALLOCATED {
            continue;
        }
        let start = entry.chunk_offset as u64;
        let end = start + entry.file_size as u64;
        if start < HEADER_SIZE as u64 {
            entry.defect = Some(EntryDefect::OverlapsHeader);
        } else if end > container_len {
            entry.defect = Some(EntryDefect::PastEnd);
        }
    }

    let mut spans: Vec<(u64, u64, usize)> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            e.defect().is_none() && e.file_size > 0 && e.chunk_offset != CHUNK_OFFSET_UNALLOCATED
        })
        .map(|(slot, e)| {
            let start = e.chunk_offset as u64;
            (start, start + e.file_size as u64, slot)
        })
        .collect();
    spans.sort_unstable();

    let mut prev_end = 0u64;
    for (start, end, slot) in spans {
        if start < prev_end {
            entries[slot].defect = Some(EntryDefect::OverlapsEntry);
        } else {
            prev_end = end;
        }
    }

    for entry in entries.iter().filter(|e| e.defect().is_some()) {
        warn!("entry {} is corrupt: {:?}", entry.key, entry.defect().unwrap());
    }
}
