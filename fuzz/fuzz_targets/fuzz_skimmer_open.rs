#![no_main]
use libfuzzer_sys::fuzz_target;
use tevd::{Charset, DiskSkimmer};

fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(_) => return,
    };
    let path = dir.path().join("fuzz.tevd");
    if std::fs::write(&path, data).is_err() {
        return;
    }

    let mut skimmer = match DiskSkimmer::open(&path) {
        Ok(s) => s,
        Err(_) => return,
    };
    let ids: Vec<_> = skimmer.entry_ids().collect();
    for id in ids {
        let _ = skimmer.request_file(id);
    }
    let _ = skimmer.request_path("/a/b", Charset::Utf8);
});
