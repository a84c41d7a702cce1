use dbpf::codec::{CodecError, FRAME_HEADER_SIZE, TAG_INTERNAL};
use dbpf::header::{PackageHeader, HEADER_SIZE};
use dbpf::index::{self, IndexEntry, IndexFlags};
use dbpf::package::{ByteSource, OpenOptions, Package, PackageError};
use dbpf::ResourceKey;
use proptest::prelude::*;
use std::io::{Read, Seek, SeekFrom};

fn key(t: u32, g: u32, i: u64) -> ResourceKey {
    ResourceKey::new(t, g, i)
}

// ── S1: empty package ────────────────────────────────────────────────────────

#[test]
fn empty_package_roundtrip() {
    let mut pkg = Package::create_empty();
    let bytes = pkg.to_bytes().unwrap();
    assert!(!pkg.is_dirty());

    let reopened = Package::from_bytes(bytes).unwrap();
    assert_eq!(reopened.header().resource_count, 0);
    assert_eq!(reopened.header().major, 2);
    assert_eq!(reopened.header().minor, 1);
    assert_eq!(reopened.len(), 0);
}

// ── S2: one stored resource ──────────────────────────────────────────────────

#[test]
fn stored_resource_roundtrip() {
    let k = key(0x220557DA, 0, 0x1234);
    let mut pkg = Package::create_empty();
    pkg.add(k, b"Hello".to_vec(), false, false).unwrap();
    let bytes = pkg.to_bytes().unwrap();

    let mut reopened = Package::from_bytes(bytes).unwrap();
    let entry = reopened.find(k).expect("entry survives the round-trip");
    assert_eq!(entry.file_size, 5);
    assert_eq!(entry.memory_size, 5);
    assert_eq!(entry.compression_tag, 0);
    assert!(!entry.is_compressed());
    assert_eq!(reopened.read_payload(k).unwrap(), b"Hello");
}

// ── S3: one compressed resource ──────────────────────────────────────────────

#[test]
fn compressed_resource_roundtrip() {
    let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    let k = key(0x220557DA, 0, 0x1234);

    let mut pkg = Package::create_empty();
    pkg.add(k, payload.clone(), true, false).unwrap();
    let bytes = pkg.to_bytes().unwrap();

    let mut reopened = Package::from_bytes(bytes).unwrap();
    let entry = reopened.find(k).unwrap();
    assert!(entry.file_size < 1000, "repeating bytes must compress");
    assert_eq!(entry.memory_size, 1000);
    assert!(entry.is_compressed());
    assert_eq!(reopened.read_payload(k).unwrap(), payload);
}

#[test]
fn incompressible_payload_falls_back_to_stored() {
    // Six bytes cannot beat the six-byte compression frame.
    let k = key(1, 2, 3);
    let mut pkg = Package::create_empty();
    pkg.add(k, b"abcdef".to_vec(), true, false).unwrap();
    let bytes = pkg.to_bytes().unwrap();

    let mut reopened = Package::from_bytes(bytes).unwrap();
    let entry = reopened.find(k).unwrap();
    assert_eq!(entry.compression_tag, 0);
    assert_eq!(entry.file_size, entry.memory_size);
    assert_eq!(reopened.read_payload(k).unwrap(), b"abcdef");
}

// ── S4: index sharing ────────────────────────────────────────────────────────

#[test]
fn shared_type_and_group_give_24_byte_entries() {
    let mut pkg = Package::create_empty();
    for i in 0..4u64 {
        // Distinct instance-high halves, so only type and group hoist.
        pkg.add(key(0x00B2D882, 0, (i << 32) | (i + 1)), vec![i as u8; 8], false, false)
            .unwrap();
    }
    let bytes = pkg.to_bytes().unwrap();

    let reopened = Package::from_bytes(bytes.clone()).unwrap();
    let header = reopened.header();
    // Shared header: flags + type + group = 12 bytes; 4 entries à 24.
    assert_eq!(header.index_size, 12 + 4 * 24);

    let blob_at = header.index_position() as usize;
    let flags = u32::from_le_bytes(bytes[blob_at..blob_at + 4].try_into().unwrap());
    assert_eq!(
        IndexFlags::from_bits(flags).unwrap(),
        IndexFlags::SHARED_TYPE | IndexFlags::SHARED_GROUP
    );
}

// ── S5: delete + compact ─────────────────────────────────────────────────────

#[test]
fn delete_then_compact_leaves_contiguous_chunks() {
    let (a, b, c) = (key(1, 0, 1), key(1, 0, 2), key(1, 0, 3));
    let mut pkg = Package::create_empty();
    pkg.add(a, vec![0xAA; 40], false, false).unwrap();
    pkg.add(b, vec![0xBB; 40], false, false).unwrap();
    pkg.add(c, vec![0xCC; 40], false, false).unwrap();
    pkg.delete(b);
    let bytes = pkg.to_bytes().unwrap();

    let mut reopened = Package::from_bytes(bytes).unwrap();
    let keys: Vec<ResourceKey> = reopened.entries().map(|e| e.key).collect();
    assert_eq!(keys, vec![a, c]);

    reopened.compact();
    assert!(reopened.is_dirty());
    let bytes = reopened.to_bytes().unwrap();
    let compacted = Package::from_bytes(bytes).unwrap();

    let entries: Vec<&IndexEntry> = compacted.entries().collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].chunk_offset as usize, HEADER_SIZE);
    // No gap: the second chunk begins where the first ends.
    assert_eq!(
        entries[1].chunk_offset,
        entries[0].chunk_offset + entries[0].file_size
    );
    assert_eq!(
        compacted.header().index_position(),
        (entries[1].chunk_offset + entries[1].file_size) as u64
    );
}

// ── Ordering ─────────────────────────────────────────────────────────────────

#[test]
fn insertion_order_survives_roundtrip() {
    let keys: Vec<ResourceKey> = [
        (9u32, 1u32, 5u64),
        (1, 9, 4),
        (5, 5, 9),
        (1, 1, 1),
    ]
    .iter()
    .map(|&(t, g, i)| key(t, g, i))
    .collect();

    let mut pkg = Package::create_empty();
    for (n, &k) in keys.iter().enumerate() {
        pkg.add(k, vec![n as u8; n + 1], false, false).unwrap();
    }
    let bytes = pkg.to_bytes().unwrap();
    let reopened = Package::from_bytes(bytes).unwrap();
    let got: Vec<ResourceKey> = reopened.entries().map(|e| e.key).collect();
    assert_eq!(got, keys);
}

// ── Index gating regression ──────────────────────────────────────────────────

#[test]
fn zero_legacy_position_slot_still_loads_entries() {
    let k = key(7, 7, 7);
    let mut pkg = Package::create_empty();
    pkg.add(k, b"payload".to_vec(), false, false).unwrap();
    let bytes = pkg.to_bytes().unwrap();

    // The writer produces the modern shape: legacy slot zero, u64 slot set.
    // Treating the zero slot as "no index" is the classic shipped bug.
    let header = PackageHeader::read(&bytes).unwrap();
    assert_eq!(header.index_position_low, 0);
    assert!(header.index_position_u64 >= HEADER_SIZE as u64);

    let mut reopened = Package::from_bytes(bytes).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.read_payload(k).unwrap(), b"payload");
}

#[test]
fn legacy_u32_slot_is_honored_when_u64_is_zero() {
    let k = key(7, 7, 8);
    let mut pkg = Package::create_empty();
    pkg.add(k, b"payload".to_vec(), false, false).unwrap();
    let mut bytes = pkg.to_bytes().unwrap();

    // Rewrite into the legacy shape: position in the u32 slot at 40, u64
    // slot zeroed.
    let mut header = PackageHeader::read(&bytes).unwrap();
    header.index_position_low = header.index_position_u64 as u32;
    header.index_position_u64 = 0;
    bytes[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    let mut reopened = Package::from_bytes(bytes).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.read_payload(k).unwrap(), b"payload");
}

#[test]
fn zero_size_or_zero_count_loads_nothing_without_failing() {
    let mut pkg = Package::create_empty();
    pkg.add(key(1, 1, 1), b"x".to_vec(), false, false).unwrap();
    let bytes = pkg.to_bytes().unwrap();

    // index_size = 0.
    let mut header = PackageHeader::read(&bytes).unwrap();
    header.index_size = 0;
    let mut doctored = bytes.clone();
    doctored[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    assert_eq!(Package::from_bytes(doctored).unwrap().len(), 0);

    // resource_count = 0.
    let mut header = PackageHeader::read(&bytes).unwrap();
    header.resource_count = 0;
    let mut doctored = bytes;
    doctored[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    assert_eq!(Package::from_bytes(doctored).unwrap().len(), 0);
}

// ── Open failure modes ───────────────────────────────────────────────────────

#[test]
fn bad_magic_rejected() {
    let mut bytes = Package::create_empty().to_bytes().unwrap();
    bytes[0..4].copy_from_slice(b"PFBD");
    assert!(matches!(
        Package::from_bytes(bytes),
        Err(PackageError::Header(dbpf::HeaderError::BadMagic))
    ));
}

#[test]
fn short_container_rejected() {
    assert!(matches!(
        Package::from_bytes(vec![0u8; 40]),
        Err(PackageError::Header(dbpf::HeaderError::Truncated(40)))
    ));
}

#[test]
fn index_overrunning_container_rejected() {
    let mut pkg = Package::create_empty();
    pkg.add(key(1, 1, 1), b"x".to_vec(), false, false).unwrap();
    let bytes = pkg.to_bytes().unwrap();

    let mut header = PackageHeader::read(&bytes).unwrap();
    header.index_size += 64;
    let mut doctored = bytes;
    doctored[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    assert!(matches!(
        Package::from_bytes(doctored),
        Err(PackageError::Index(dbpf::IndexError::OutOfBounds { .. }))
    ));
}

#[test]
fn corrupt_entry_is_lazy_unless_strict() {
    let k = key(3, 3, 3);
    let mut pkg = Package::create_empty();
    pkg.add(k, vec![0x55; 64], false, false).unwrap();
    let bytes = pkg.to_bytes().unwrap();

    // Point the entry's chunk past the end of the container.
    let header = PackageHeader::read(&bytes).unwrap();
    let blob_at = header.index_position() as usize;
    let mut blob = bytes[blob_at..blob_at + header.index_size as usize].to_vec();
    let mut entries = index::read_index(&blob, 1).unwrap();
    entries[0].chunk_offset = bytes.len() as u32;
    blob = index::write_index(&entries);
    let mut doctored = bytes;
    doctored.splice(blob_at.., blob.iter().copied());

    // Lenient open succeeds; the defect surfaces on read.
    let mut reopened = Package::from_bytes(doctored.clone()).unwrap();
    assert_eq!(reopened.len(), 1);
    assert!(matches!(
        reopened.read_payload(k),
        Err(PackageError::CorruptEntry { .. })
    ));

    // Strict open fails up front.
    assert!(matches!(
        Package::open_with(ByteSource::from_vec(doctored), OpenOptions { strict: true }),
        Err(PackageError::CorruptEntry { .. })
    ));
}

// ── Unsupported legacy compression ───────────────────────────────────────────

/// Hand-assemble a container whose one entry claims the legacy internal
/// codec.  The payload must stay enumerable, unreadable, and byte-stable
/// across a save.
fn internal_codec_container(k: ResourceKey) -> (Vec<u8>, Vec<u8>) {
    let memory_size = 64u32;
    let mut frame = Vec::new();
    frame.extend_from_slice(&TAG_INTERNAL.to_le_bytes());
    frame.extend_from_slice(&memory_size.to_be_bytes());
    frame.extend_from_slice(&[0x5A; 20]); // opaque body, meaning unknown
    assert_eq!(frame.len(), FRAME_HEADER_SIZE + 20);

    let entry = IndexEntry::new(k, HEADER_SIZE as u32, frame.len() as u32, memory_size, TAG_INTERNAL);
    let blob = index::write_index(std::slice::from_ref(&entry));

    let mut header = PackageHeader::new();
    header.resource_count = 1;
    header.index_position_u64 = (HEADER_SIZE + frame.len()) as u64;
    header.index_size = blob.len() as u32;

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(&frame);
    bytes.extend_from_slice(&blob);
    (bytes, frame)
}

#[test]
fn internal_codec_is_unsupported_but_preserved() {
    let k = key(0xDEAD, 0, 1);
    let (bytes, frame) = internal_codec_container(k);

    let mut pkg = Package::from_bytes(bytes).unwrap();
    assert_eq!(pkg.len(), 1);
    assert!(matches!(
        pkg.read_payload(k),
        Err(PackageError::Codec(CodecError::Unsupported { tag: TAG_INTERNAL }))
    ));
    assert_eq!(pkg.read_raw_payload(k).unwrap(), frame);

    // A save must carry the opaque frame through verbatim.
    let saved = pkg.to_bytes().unwrap();
    let mut reopened = Package::from_bytes(saved).unwrap();
    assert_eq!(reopened.find(k).unwrap().compression_tag, TAG_INTERNAL);
    assert_eq!(reopened.read_raw_payload(k).unwrap(), frame);
}

// ── File-backed round-trip ───────────────────────────────────────────────────

#[test]
fn save_as_and_open_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.package");

    let k = key(0x0333_9892, 2, 99);
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    {
        let mut pkg = Package::create_empty();
        pkg.add(k, payload.clone(), true, false).unwrap();
        pkg.save_as(&path).unwrap();
        assert!(!pkg.is_dirty());
        // The saved file is now the backing source.
        assert_eq!(pkg.read_payload(k).unwrap(), payload);
    }

    let mut reopened = Package::open_file(&path).unwrap();
    assert_eq!(reopened.read_payload(k).unwrap(), payload);

    // Clean re-save into a second file stream-copies the payload.
    let path2 = dir.path().join("copy.package");
    reopened.save_as(&path2).unwrap();
    let mut copy = Package::open_file(&path2).unwrap();
    assert_eq!(copy.read_payload(k).unwrap(), payload);
}

#[test]
fn file_reads_are_lazy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lazy.package");

    let mut pkg = Package::create_empty();
    for i in 0..16u64 {
        pkg.add(key(1, 0, i), vec![i as u8; 2048], false, false).unwrap();
    }
    pkg.save_as(&path).unwrap();

    let mut reopened = Package::open_file(&path).unwrap();
    // Only the requested entry's chunk is read.
    assert_eq!(reopened.read_payload(key(1, 0, 9)).unwrap(), vec![9u8; 2048]);

    // Spot-check the chunk really sits where the index says.
    let entry = reopened.find(key(1, 0, 9)).unwrap().clone();
    let mut file = std::fs::File::open(&path).unwrap();
    file.seek(SeekFrom::Start(entry.chunk_offset as u64)).unwrap();
    let mut buf = vec![0u8; entry.file_size as usize];
    file.read_exact(&mut buf).unwrap();
    assert_eq!(buf, vec![9u8; 2048]);
}

// ── Property: arbitrary package round-trip ───────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_package_roundtrips(
        resources in proptest::collection::vec(
            (
                any::<u32>(), any::<u32>(), any::<u64>(),
                proptest::collection::vec(any::<u8>(), 0..512),
                any::<bool>(),
            ),
            0..12,
        )
    ) {
        let mut pkg = Package::create_empty();
        let mut expected: Vec<(ResourceKey, Vec<u8>)> = Vec::new();
        for (t, g, i, payload, compressed) in resources {
            let k = key(t, g, i);
            if pkg.add(k, payload.clone(), compressed, false).is_ok() {
                expected.push((k, payload));
            }
        }

        let bytes = pkg.to_bytes().unwrap();
        let mut reopened = Package::from_bytes(bytes).unwrap();

        let got: Vec<ResourceKey> = reopened.entries().map(|e| e.key).collect();
        let want: Vec<ResourceKey> = expected.iter().map(|(k, _)| *k).collect();
        prop_assert_eq!(got, want);

        for (k, payload) in expected {
            prop_assert_eq!(reopened.read_payload(k).unwrap(), payload);
        }
    }
}
