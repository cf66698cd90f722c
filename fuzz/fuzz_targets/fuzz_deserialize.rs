#![no_main]
use libfuzzer_sys::fuzz_target;
use tevd::{ByteArray64, CrcLevel, VirtualDisk};

// Arbitrary bytes must parse or fail cleanly, never panic
fuzz_target!(|data: &[u8]| {
    let bytes = ByteArray64::from_slice(data);
    if let Ok(disk) = VirtualDisk::deserialize(&bytes, CrcLevel::Ignore, &mut |_| {}) {
        let reencoded = disk.serialize();
        let again = VirtualDisk::deserialize(&reencoded, CrcLevel::Fail, &mut |_| {})
            .expect("re-serialized image must verify");
        assert_eq!(again.len(), disk.len());
    }
});
