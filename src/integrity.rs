//! Checksum discipline
//!
//! Every entry carries a CRC32 of its body. The disk header carries a
//! CRC32 over the ascending list of all entry hash codes, so the disk
//! checksum does not depend on the order entries are stored in.

use crate::entry::EntryId;
use crate::error::{Result, TevdError};
use std::fmt;

/// How a checksum mismatch found while reading is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcLevel {
    /// Skip verification entirely
    Ignore,
    /// Report through the warning callback and keep going
    #[default]
    Warn,
    /// Abort with [`TevdError::ChecksumMismatch`]
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumScope {
    Entry(EntryId),
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub scope: ChecksumScope,
    pub expected: u32,
    pub computed: u32,
}

impl fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            ChecksumScope::Entry(id) => write!(f, "CRC mismatch on entry {}", id)?,
            ChecksumScope::Disk => write!(f, "Disk CRC mismatch")?,
        }
        write!(
            f,
            ": expected {:08X}, computed {:08X}",
            self.expected, self.computed
        )
    }
}

/// Caller-supplied receiver for mismatches found at [`CrcLevel::Warn`]
pub type WarningSink = Box<dyn FnMut(&ChecksumMismatch) + Send>;

/// Compare a stored checksum against a computed one under `level`
pub fn verify(
    level: CrcLevel,
    scope: ChecksumScope,
    expected: u32,
    computed: u32,
    on_warn: &mut dyn FnMut(&ChecksumMismatch),
) -> Result<()> {
    if level == CrcLevel::Ignore || expected == computed {
        return Ok(());
    }

    let mismatch = ChecksumMismatch {
        scope,
        expected,
        computed,
    };
    match level {
        CrcLevel::Fail => Err(TevdError::ChecksumMismatch(mismatch)),
        _ => {
            tracing::warn!("{}", mismatch);
            on_warn(&mismatch);
            Ok(())
        }
    }
}

/// Disk-level CRC over a set of entry hash codes
pub fn disk_crc<I: IntoIterator<Item = u32>>(hash_codes: I) -> u32 {
    let mut codes: Vec<u32> = hash_codes.into_iter().collect();
    codes.sort_unstable();
    let mut hasher = crc32fast::Hasher::new();
    for code in codes {
        hasher.update(&code.to_be_bytes());
    }
    hasher.finalize()
}
