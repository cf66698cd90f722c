//! End-to-end scenarios and corruption detection on image files

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tempfile::TempDir;
use tevd::header::FOOTER;
use tevd::{
    ByteArray64, ChecksumMismatch, ChecksumScope, Charset, CrcLevel, DiskSkimmer,
    PartialDomBuilder, TevdError, VirtualDisk, ROOT_ID,
};

const CS: Charset = Charset::Utf8;

/// Helper: overwrite bytes of an image file at `offset`
fn corrupt_at(path: &std::path::Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
}

#[test]
fn test_create_serialize_reload() {
    let mut disk = VirtualDisk::new(1_000_000, "TEST", CS).unwrap();
    let a = disk
        .add_file(ROOT_ID, "a.txt", ByteArray64::from_slice(&[b'a'; 100]), CS)
        .unwrap();
    let bin = disk.add_dir(ROOT_ID, "bin", CS).unwrap();
    let b = disk
        .add_file(bin, "b.txt", ByteArray64::from_slice(&[b'b'; 50]), CS)
        .unwrap();

    let loaded = VirtualDisk::deserialize(&disk.serialize(), CrcLevel::Fail, &mut |_| {}).unwrap();
    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded.find("/bin/b.txt", CS).unwrap().entry_id, b);
    assert_eq!(loaded.find("/a.txt", CS).unwrap().entry_id, a);
    assert_eq!(loaded.disk_name(CS), "TEST");

    let entry_sizes: u64 = [a, bin, b]
        .iter()
        .map(|id| loaded.entry(*id).unwrap().entry_size())
        .sum();
    let root_size = loaded.root().unwrap().entry_size();
    assert_eq!(loaded.used_bytes(), 64 + root_size + entry_sizes);
}

#[test]
fn test_oversized_file_rejected() {
    let mut disk = VirtualDisk::new(10_000, "FULL", CS).unwrap();
    disk.add_file(ROOT_ID, "fits", ByteArray64::from_slice(&[0; 5_000]), CS)
        .unwrap();
    let count = disk.len();

    let err = disk
        .add_file(ROOT_ID, "too-big", ByteArray64::from_slice(&[0; 5_000]), CS)
        .unwrap_err();
    assert!(matches!(err, TevdError::CapacityExceeded { .. }));
    assert_eq!(disk.len(), count);
}

#[test]
fn test_delete_tree_leaves_no_orphans() {
    let mut disk = VirtualDisk::new(1_000_000, "TREE", CS).unwrap();
    let top = disk.add_dir(ROOT_ID, "top", CS).unwrap();
    let mut parent = top;
    for depth in 0..5 {
        disk.add_file(parent, "leaf", ByteArray64::from_slice(b"x"), CS)
            .unwrap();
        parent = disk.add_dir(parent, &format!("level{}", depth), CS).unwrap();
    }
    assert_eq!(disk.len(), 12);

    disk.delete_file(top).unwrap();
    assert_eq!(disk.len(), 1);
    assert!(disk.gc_search_orphan().is_empty());
}

#[test]
fn test_corrupted_body_detected_by_level() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("body.tevd");
    let mut disk = VirtualDisk::new(100_000, "BODY", CS).unwrap();
    let f = disk
        .add_file(ROOT_ID, "f", ByteArray64::from_slice(&[7; 64]), CS)
        .unwrap();
    disk.write_to_file(&path).unwrap();

    let location = DiskSkimmer::open(&path).unwrap().location(f).unwrap();
    // last body byte of the file entry
    corrupt_at(&path, location.offset + location.size - 1, &[0xEE]);

    let err = VirtualDisk::read_from_file(&path, CrcLevel::Fail).unwrap_err();
    assert!(matches!(err, TevdError::ChecksumMismatch(m) if m.scope == ChecksumScope::Entry(f)));

    let mut strict = DiskSkimmer::open_with_level(&path, CrcLevel::Fail).unwrap();
    assert!(matches!(
        strict.request_file(f),
        Err(TevdError::ChecksumMismatch(_))
    ));

    let mut lenient = DiskSkimmer::open(&path).unwrap();
    let entry = lenient.request_file(f).unwrap().unwrap();
    assert_eq!(entry.file_bytes().unwrap().get(63).unwrap(), 0xEE);
}

#[test]
fn test_corrupted_body_reaches_warning_callback() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("warn.tevd");
    let mut disk = VirtualDisk::new(100_000, "WARN", CS).unwrap();
    let f = disk
        .add_file(ROOT_ID, "f", ByteArray64::from_slice(&[3; 32]), CS)
        .unwrap();
    let g = disk
        .add_file(ROOT_ID, "g", ByteArray64::from_slice(&[4; 32]), CS)
        .unwrap();
    disk.write_to_file(&path).unwrap();

    let location = DiskSkimmer::open(&path).unwrap().location(f).unwrap();
    corrupt_at(&path, location.offset + location.size - 1, &[0x00]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut skimmer = DiskSkimmer::open_with_callback(
        &path,
        CrcLevel::Warn,
        Box::new(move |m: &ChecksumMismatch| sink.lock().push(*m)),
    )
    .unwrap();
    assert!(seen.lock().is_empty());

    skimmer.request_file(g).unwrap().unwrap();
    assert!(seen.lock().is_empty());
    skimmer.request_file(f).unwrap().unwrap();
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].scope, ChecksumScope::Entry(f));

    // the same sink is used for whole-image reads
    skimmer.read_full_disk().unwrap();
    assert_eq!(seen.lock().len(), 2);

    let mut loaded = Vec::new();
    VirtualDisk::read_from_file_with(&path, CrcLevel::Warn, &mut |m| loaded.push(m.scope))
        .unwrap();
    assert_eq!(loaded, vec![ChecksumScope::Entry(f)]);

    let count = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&count);
    let mut dom = PartialDomBuilder::new(&path)
        .on_checksum_warning(move |_| *counter.lock() += 1)
        .open(CS)
        .unwrap();
    dom.peek_file(f).unwrap().unwrap();
    assert_eq!(*count.lock(), 1);
}

#[test]
fn test_bad_magic_and_version() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("magic.tevd");
    VirtualDisk::new(4096, "M", CS)
        .unwrap()
        .write_to_file(&path)
        .unwrap();

    corrupt_at(&path, 46, &[9]);
    assert!(matches!(
        DiskSkimmer::open(&path),
        Err(TevdError::UnsupportedVersion(9))
    ));

    corrupt_at(&path, 0, b"NOPE");
    assert!(matches!(
        DiskSkimmer::open(&path),
        Err(TevdError::InvalidMagic(m)) if &m == b"NOPE"
    ));
}

#[test]
fn test_missing_footer_is_corrupt() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("footer.tevd");
    VirtualDisk::new(4096, "F", CS)
        .unwrap()
        .write_to_file(&path)
        .unwrap();
    let data = std::fs::read(&path).unwrap();
    std::fs::write(&path, &data[..data.len() - FOOTER.len()]).unwrap();

    assert!(matches!(
        DiskSkimmer::open(&path),
        Err(TevdError::CorruptEntry {
            last_good_offset: 64,
            ..
        })
    ));
}

#[test]
fn test_latin1_names_roundtrip() {
    let cs = Charset::Latin1;
    let mut disk = VirtualDisk::new(100_000, "LATIN", cs).unwrap();
    let id = disk
        .add_file(ROOT_ID, "café", ByteArray64::from_slice(b"au lait"), cs)
        .unwrap();
    let loaded = VirtualDisk::deserialize(&disk.serialize(), CrcLevel::Fail, &mut |_| {}).unwrap();
    assert_eq!(loaded.find("/café", cs).unwrap().entry_id, id);
    assert_eq!(loaded.entry(id).unwrap().filename[3], 0xE9);

    assert!(matches!(
        disk.add_file(ROOT_ID, "日本", ByteArray64::new(), cs),
        Err(TevdError::Unencodable { .. })
    ));
}
