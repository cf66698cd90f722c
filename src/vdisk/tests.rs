use super::*;
use crate::entry::ENTRY_HEADER_SIZE;
use tempfile::TempDir;

const CS: Charset = Charset::Utf8;

fn bytes(len: usize) -> ByteArray64 {
    ByteArray64::from_slice(&vec![0xAB; len])
}

fn sample_disk() -> (VirtualDisk, EntryId, EntryId, EntryId) {
    let mut disk = VirtualDisk::new(1_000_000, "TEST", CS).unwrap();
    let a = disk.add_file(ROOT_ID, "a.txt", bytes(100), CS).unwrap();
    let bin = disk.add_dir(ROOT_ID, "bin", CS).unwrap();
    let b = disk.add_file(bin, "b.txt", bytes(50), CS).unwrap();
    (disk, a, bin, b)
}

#[test]
fn test_new_disk_has_only_root() {
    let disk = VirtualDisk::new(4096, "EMPTY", CS).unwrap();
    assert_eq!(disk.len(), 1);
    assert!(disk.is_empty());
    assert!(disk.root().unwrap().is_directory());
    assert_eq!(disk.disk_name(CS), "EMPTY");
    assert_eq!(disk.used_bytes(), DISK_HEADER_SIZE + ENTRY_HEADER_SIZE + 2);
}

#[test]
fn test_serialize_roundtrip_scenario() {
    let (disk, a, bin, b) = sample_disk();
    let image = disk.serialize();

    let loaded = VirtualDisk::deserialize(&image, CrcLevel::Fail, &mut |_| {}).unwrap();
    assert_eq!(loaded.len(), 4);
    for id in [ROOT_ID, a, bin, b] {
        assert_eq!(loaded.entry(id), disk.entry(id));
    }
    assert_eq!(loaded.find("/bin/b.txt", CS).unwrap().entry_id, b);
    assert_eq!(loaded.find("bin/b.txt", CS).unwrap().entry_id, b);
    assert_eq!(loaded.disk_crc(), disk.disk_crc());
    assert_eq!(loaded.header().crc, disk.header().crc);

    let expected = DISK_HEADER_SIZE
        + [ROOT_ID, a, bin, b]
            .iter()
            .map(|id| disk.entry(*id).unwrap().entry_size())
            .sum::<u64>();
    assert_eq!(loaded.used_bytes(), expected);
    // footer follows the last entry
    assert_eq!(image.len(), expected + FOOTER.len() as u64);
}

#[test]
fn test_serialize_puts_root_first() {
    let (disk, ..) = sample_disk();
    let image = disk.serialize();
    let mut id = [0u8; 4];
    image.copy_to(DISK_HEADER_SIZE, &mut id).unwrap();
    assert_eq!(i32::from_be_bytes(id), ROOT_ID);
}

#[test]
fn test_capacity_exceeded_leaves_disk_unchanged() {
    let mut disk = VirtualDisk::new(2048, "SMALL", CS).unwrap();
    let before = disk.len();
    let used = disk.used_bytes();

    let err = disk.add_file(ROOT_ID, "big.bin", bytes(4096), CS).unwrap_err();
    assert!(matches!(err, TevdError::CapacityExceeded { .. }));
    assert_eq!(disk.len(), before);
    assert_eq!(disk.used_bytes(), used);
    assert!(disk.root().unwrap().children().unwrap().is_empty());
}

#[test]
fn test_read_only_rejects_mutation() {
    let (mut disk, a, ..) = sample_disk();
    disk.set_read_only(true);

    assert!(matches!(
        disk.add_dir(ROOT_ID, "x", CS),
        Err(TevdError::ReadOnly)
    ));
    assert!(matches!(disk.delete_file(a), Err(TevdError::ReadOnly)));
    assert!(matches!(
        disk.rename_file(a, "b", CS),
        Err(TevdError::ReadOnly)
    ));

    disk.set_read_only(false);
    disk.add_dir(ROOT_ID, "x", CS).unwrap();
}

#[test]
fn test_zero_capacity_is_read_only() {
    let disk = VirtualDisk::new(0, "RO", CS).unwrap();
    assert!(disk.is_read_only());
}

#[test]
fn test_duplicate_name_rejected() {
    let (mut disk, ..) = sample_disk();
    assert!(matches!(
        disk.add_file(ROOT_ID, "a.txt", bytes(1), CS),
        Err(TevdError::AlreadyExists(_))
    ));
}

#[test]
fn test_add_into_file_fails() {
    let (mut disk, a, ..) = sample_disk();
    assert!(matches!(
        disk.add_dir(a, "nested", CS),
        Err(TevdError::NotADirectory(id)) if id == a
    ));
}

#[test]
fn test_find_missing_and_through_file() {
    let (disk, ..) = sample_disk();
    assert!(disk.find("/nope", CS).is_none());
    assert!(disk.find("/a.txt/inner", CS).is_none());
    assert_eq!(disk.find("/", CS).unwrap().entry_id, ROOT_ID);
}

#[test]
fn test_path_of() {
    let (disk, _, _, b) = sample_disk();
    assert_eq!(disk.path_of(b, CS).unwrap(), "/bin/b.txt");
    assert_eq!(disk.path_of(ROOT_ID, CS).unwrap(), "/");
}

#[test]
fn test_delete_non_empty_directory() {
    let (mut disk, a, bin, b) = sample_disk();
    let sub = disk.add_dir(bin, "sub", CS).unwrap();
    let deep = disk.add_file(sub, "deep", bytes(3), CS).unwrap();

    disk.delete_file(bin).unwrap();
    for id in [bin, b, sub, deep] {
        assert!(!disk.contains(id));
    }
    assert!(disk.contains(a));
    assert!(disk.gc_search_orphan().is_empty());
    assert!(disk.gc_search_phantom_baby().is_empty());
    assert_eq!(disk.root().unwrap().children().unwrap(), &[a]);
}

#[test]
fn test_delete_root_and_unknown() {
    let (mut disk, ..) = sample_disk();
    assert!(matches!(disk.delete_file(ROOT_ID), Err(TevdError::RootDeletion)));
    assert!(matches!(
        disk.delete_file(12345),
        Err(TevdError::EntryNotFound(12345))
    ));
}

#[test]
fn test_delete_unlinked_entry_fails() {
    let (mut disk, a, ..) = sample_disk();
    disk.entries.get_mut(&ROOT_ID).unwrap().remove_child(a);
    assert!(matches!(
        disk.delete_file(a),
        Err(TevdError::NotLinked { id, parent: ROOT_ID }) if id == a
    ));
}

#[test]
fn test_gc_removes_orphans_and_phantoms() {
    let (mut disk, a, bin, b) = sample_disk();
    // unlink bin without removing it: bin and b.txt become unreachable
    disk.entries.get_mut(&ROOT_ID).unwrap().remove_child(bin);
    // dangling child reference
    disk.entries.get_mut(&ROOT_ID).unwrap().add_child(777).unwrap();

    assert_eq!(disk.gc_search_orphan(), vec![bin]);
    assert_eq!(disk.gc_search_phantom_baby(), vec![(ROOT_ID, 777)]);

    let report = disk.gc_dump_all();
    assert_eq!(report.phantoms_removed, vec![(ROOT_ID, 777)]);
    let mut orphans = report.orphans_removed.clone();
    orphans.sort_unstable();
    let mut expected = vec![bin, b];
    expected.sort_unstable();
    assert_eq!(orphans, expected);
    assert_eq!(disk.len(), 2);
    assert!(disk.contains(a));
    assert!(disk.gc_dump_all().is_clean());
}

#[test]
fn test_rename_file() {
    let (mut disk, a, ..) = sample_disk();
    disk.rename_file(a, "renamed.txt", CS).unwrap();
    assert_eq!(disk.find("/renamed.txt", CS).unwrap().entry_id, a);
    assert!(disk.find("/a.txt", CS).is_none());

    assert!(matches!(
        disk.rename_file(a, "bin", CS),
        Err(TevdError::AlreadyExists(_))
    ));
    let long = "x".repeat(300);
    assert!(matches!(
        disk.rename_file(a, &long, CS),
        Err(TevdError::FilenameTooLong { .. })
    ));
}

#[test]
fn test_move_entry_within_disk() {
    let (mut disk, a, bin, _) = sample_disk();
    disk.move_entry(a, bin, CS).unwrap();
    assert_eq!(disk.find("/bin/a.txt", CS).unwrap().entry_id, a);
    assert!(disk.gc_search_orphan().is_empty());

    assert!(matches!(
        disk.move_entry(bin, bin, CS),
        Err(TevdError::InvalidOperation(_))
    ));
}

#[test]
fn test_move_file_across_disks() {
    let (mut src, _, bin, b) = sample_disk();
    let mut dst = VirtualDisk::new(1_000_000, "DEST", CS).unwrap();

    let mtime = src.entry(b).unwrap().modification_date;

    let moved = VirtualDisk::move_file(&mut src, bin, &mut dst, ROOT_ID, CS).unwrap();
    assert!(!src.contains(bin));
    assert!(!src.contains(b));
    assert_eq!(dst.find("/bin", CS).unwrap().entry_id, moved);
    let copied = dst.find("/bin/b.txt", CS).unwrap();
    assert_eq!(copied.file_bytes().unwrap().len(), 50);
    assert_eq!(copied.modification_date, mtime);
}

#[test]
fn test_move_file_leaves_source_on_destination_failure() {
    let (mut src, a, ..) = sample_disk();
    let mut dst = VirtualDisk::new(600, "TINY", CS).unwrap();

    let err = VirtualDisk::move_file(&mut src, a, &mut dst, ROOT_ID, CS).unwrap_err();
    assert!(matches!(err, TevdError::CapacityExceeded { .. }));
    assert!(src.contains(a));
    assert_eq!(dst.len(), 1);
}

#[test]
fn test_move_file_rolls_back_when_source_delete_fails() {
    let (mut src, a, ..) = sample_disk();
    src.entries.get_mut(&ROOT_ID).unwrap().remove_child(a);
    let mut dst = VirtualDisk::new(1_000_000, "DEST", CS).unwrap();
    let dst_used = dst.used_bytes();

    let err = VirtualDisk::move_file(&mut src, a, &mut dst, ROOT_ID, CS).unwrap_err();
    assert!(matches!(err, TevdError::NotLinked { id, parent: ROOT_ID } if id == a));
    assert!(src.contains(a));
    assert_eq!(dst.len(), 1);
    assert!(dst.root().unwrap().children().unwrap().is_empty());
    assert_eq!(dst.used_bytes(), dst_used);
}

#[test]
fn test_move_directory_with_symlink_discards_partial_copy() {
    let (mut src, a, bin, b) = sample_disk();
    src.add_symlink(bin, "link", a, CS).unwrap();
    let mut dst = VirtualDisk::new(1_000_000, "DEST", CS).unwrap();

    let err = VirtualDisk::move_file(&mut src, bin, &mut dst, ROOT_ID, CS).unwrap_err();
    assert!(matches!(err, TevdError::InvalidOperation(_)));
    assert_eq!(dst.len(), 1);
    assert!(dst.find("/bin", CS).is_none());
    assert!(src.contains(bin));
    assert!(src.contains(b));
}

#[test]
fn test_move_file_rejects_read_only_source() {
    let (mut src, a, ..) = sample_disk();
    src.set_read_only(true);
    let mut dst = VirtualDisk::new(1_000_000, "DEST", CS).unwrap();

    assert!(matches!(
        VirtualDisk::move_file(&mut src, a, &mut dst, ROOT_ID, CS),
        Err(TevdError::ReadOnly)
    ));
    assert_eq!(dst.len(), 1);
}

#[test]
fn test_resolve_symlinks() {
    let (mut disk, a, ..) = sample_disk();
    let l1 = disk.add_symlink(ROOT_ID, "l1", a, CS).unwrap();
    let l2 = disk.add_symlink(ROOT_ID, "l2", l1, CS).unwrap();

    assert_eq!(disk.resolve_if_symlink(a, true).unwrap().entry_id, a);
    assert_eq!(disk.resolve_if_symlink(l2, false).unwrap().entry_id, l1);
    assert_eq!(disk.resolve_if_symlink(l2, true).unwrap().entry_id, a);

    // point l1 at a removed file
    disk.delete_file(a).unwrap();
    assert!(matches!(
        disk.resolve_if_symlink(l2, true),
        Err(TevdError::DanglingSymlink { link, target }) if link == l1 && target == a
    ));
}

#[test]
fn test_symlink_loop_detected() {
    let (mut disk, a, ..) = sample_disk();
    let l1 = disk.add_symlink(ROOT_ID, "l1", a, CS).unwrap();
    let l2 = disk.add_symlink(ROOT_ID, "l2", l1, CS).unwrap();
    disk.entries.get_mut(&l1).unwrap().contents = EntryContent::Symlink(l2);

    assert!(matches!(
        disk.resolve_if_symlink(l1, true),
        Err(TevdError::SymlinkLoop(_))
    ));
}

#[test]
fn test_write_file_checks_capacity() {
    let mut disk = VirtualDisk::new(1024, "W", CS).unwrap();
    let f = disk.add_file(ROOT_ID, "f", bytes(10), CS).unwrap();
    disk.write_file(f, bytes(20)).unwrap();
    assert_eq!(disk.entry(f).unwrap().file_bytes().unwrap().len(), 20);

    assert!(matches!(
        disk.write_file(f, bytes(4096)),
        Err(TevdError::CapacityExceeded { .. })
    ));
    assert_eq!(disk.entry(f).unwrap().file_bytes().unwrap().len(), 20);
    assert!(matches!(
        disk.write_file(ROOT_ID, bytes(1)),
        Err(TevdError::NotAFile(ROOT_ID))
    ));
}

#[test]
fn test_crc_levels_on_corrupt_body() {
    let (disk, a, ..) = sample_disk();
    let image = disk.serialize();

    // a.txt's body follows root; flip its first content byte
    let root_size = disk.root().unwrap().entry_size();
    let mut offset = DISK_HEADER_SIZE + root_size;
    let ordered = disk.ordered_entries();
    for entry in &ordered[1..] {
        if entry.entry_id == a {
            break;
        }
        offset += entry.entry_size();
    }
    let mut corrupted = image.clone();
    let body_start = offset + ENTRY_HEADER_SIZE + 6;
    let byte = corrupted.get(body_start).unwrap();
    corrupted.set(body_start, byte ^ 0xFF);

    let err = VirtualDisk::deserialize(&corrupted, CrcLevel::Fail, &mut |_| {}).unwrap_err();
    assert!(matches!(
        err,
        TevdError::ChecksumMismatch(ChecksumMismatch {
            scope: ChecksumScope::Entry(id),
            ..
        }) if id == a
    ));

    let mut warnings = Vec::new();
    let loaded =
        VirtualDisk::deserialize(&corrupted, CrcLevel::Warn, &mut |m| warnings.push(*m)).unwrap();
    assert_eq!(loaded.len(), 4);
    assert_eq!(warnings.len(), 1);

    VirtualDisk::deserialize(&corrupted, CrcLevel::Ignore, &mut |_| panic!("no warnings"))
        .unwrap();
}

#[test]
fn test_disk_crc_mismatch() {
    let (disk, ..) = sample_disk();
    let mut image = disk.serialize();
    let crc_byte = image.get(42).unwrap();
    image.set(42, crc_byte ^ 0x01);

    let mut warnings = Vec::new();
    VirtualDisk::deserialize(&image, CrcLevel::Warn, &mut |m| warnings.push(*m)).unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].scope, ChecksumScope::Disk);
}

#[test]
fn test_truncated_image_is_fatal() {
    let (disk, ..) = sample_disk();
    let image = disk.serialize();
    let cut = image.slice(0..image.len() - 10).unwrap();
    assert!(matches!(
        VirtualDisk::deserialize(&cut, CrcLevel::Ignore, &mut |_| {}),
        Err(TevdError::CorruptEntry { .. })
    ));

    let short = image.slice(0..20).unwrap();
    assert!(matches!(
        VirtualDisk::deserialize(&short, CrcLevel::Ignore, &mut |_| {}),
        Err(TevdError::Truncated { .. })
    ));

    let mut bad_magic = image.clone();
    bad_magic.set(0, b'X');
    assert!(matches!(
        VirtualDisk::deserialize(&bad_magic, CrcLevel::Ignore, &mut |_| {}),
        Err(TevdError::InvalidMagic(_))
    ));
}

#[test]
fn test_file_roundtrip_and_host_transfer() {
    let tmp = TempDir::new().unwrap();
    let (mut disk, a, ..) = sample_disk();

    let host_in = tmp.path().join("notes.md");
    std::fs::write(&host_in, b"# hello").unwrap();
    let imported = disk.import_file(ROOT_ID, &host_in, CS).unwrap();
    assert_eq!(disk.find("/notes.md", CS).unwrap().entry_id, imported);

    let image_path = tmp.path().join("disk.tevd");
    disk.write_to_file(&image_path).unwrap();
    let loaded = VirtualDisk::read_from_file(&image_path, CrcLevel::Fail).unwrap();
    assert_eq!(loaded.len(), disk.len());

    let host_out = tmp.path().join("a.out");
    loaded.export_file(a, &host_out).unwrap();
    assert_eq!(std::fs::read(&host_out).unwrap(), vec![0xAB; 100]);

    let notes_out = tmp.path().join("notes.out");
    loaded.export_file(imported, &notes_out).unwrap();
    assert_eq!(std::fs::read(&notes_out).unwrap(), b"# hello");
}

#[test]
fn test_rename_disk_and_attributes_persist() {
    let (mut disk, ..) = sample_disk();
    disk.rename_disk("RENAMED", CS).unwrap();
    disk.set_read_only(true);
    let loaded = VirtualDisk::deserialize(&disk.serialize(), CrcLevel::Fail, &mut |_| {}).unwrap();
    assert_eq!(loaded.disk_name(CS), "RENAMED");
    assert!(loaded.is_read_only());

    assert!(matches!(
        disk.rename_disk(&"n".repeat(40), CS),
        Err(TevdError::FilenameTooLong { .. })
    ));
}

#[test]
fn test_list_dir() {
    let (disk, a, bin, b) = sample_disk();
    let mut ids: Vec<EntryId> = disk.list_dir(ROOT_ID).unwrap().iter().map(|e| e.entry_id).collect();
    ids.sort_unstable();
    let mut expected = vec![a, bin];
    expected.sort_unstable();
    assert_eq!(ids, expected);
    assert_eq!(disk.list_dir(bin).unwrap()[0].entry_id, b);
    assert!(matches!(disk.list_dir(a), Err(TevdError::NotADirectory(_))));
}
