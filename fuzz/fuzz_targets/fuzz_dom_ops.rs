#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tevd::{ByteArray64, Charset, CrcLevel, EntryId, VirtualDisk, ROOT_ID};

#[derive(Arbitrary, Debug)]
enum Op {
    AddFile { parent: u8, name: String, data: Vec<u8> },
    AddDir { parent: u8, name: String },
    Delete { target: u8 },
    Rename { target: u8, name: String },
    Symlink { parent: u8, target: u8, name: String },
}

fuzz_target!(|ops: Vec<Op>| {
    let cs = Charset::Utf8;
    let mut disk = match VirtualDisk::new(1 << 20, "FUZZ", cs) {
        Ok(d) => d,
        Err(_) => return,
    };
    let mut ids: Vec<EntryId> = vec![ROOT_ID];
    let pick = |ids: &[EntryId], i: u8| ids[i as usize % ids.len()];

    for op in ops.into_iter().take(64) {
        match op {
            Op::AddFile { parent, name, data } => {
                if let Ok(id) = disk.add_file(pick(&ids, parent), &name, ByteArray64::from(data), cs) {
                    ids.push(id);
                }
            }
            Op::AddDir { parent, name } => {
                if let Ok(id) = disk.add_dir(pick(&ids, parent), &name, cs) {
                    ids.push(id);
                }
            }
            Op::Delete { target } => {
                let _ = disk.delete_file(pick(&ids, target));
            }
            Op::Rename { target, name } => {
                let _ = disk.rename_file(pick(&ids, target), &name, cs);
            }
            Op::Symlink { parent, target, name } => {
                if let Ok(id) = disk.add_symlink(pick(&ids, parent), &name, pick(&ids, target), cs) {
                    ids.push(id);
                }
            }
        }
    }

    let loaded = VirtualDisk::deserialize(&disk.serialize(), CrcLevel::Fail, &mut |_| {})
        .expect("image built through public operations must verify");
    assert_eq!(loaded.len(), disk.len());
    assert_eq!(loaded.used_bytes(), disk.used_bytes());
});
