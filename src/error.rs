use crate::entry::EntryId;
use crate::integrity::ChecksumMismatch;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TevdError {
    #[error("Invalid magic number in disk header: {0:02X?}")]
    InvalidMagic([u8; 4]),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unexpected end of data at offset {offset}: needed {needed} more bytes")]
    Truncated { offset: u64, needed: u64 },

    #[error("Unreadable entry at offset {offset} (last good entry at {last_good_offset}): {reason}")]
    CorruptEntry {
        offset: u64,
        last_good_offset: u64,
        reason: String,
    },

    #[error("Invalid entry type flag: {0}")]
    InvalidEntryType(u8),

    #[error("{0}")]
    ChecksumMismatch(ChecksumMismatch),

    #[error("Disk capacity exceeded: {needed} bytes needed, {available} bytes available")]
    CapacityExceeded { needed: u64, available: u64 },

    #[error("Disk is read-only")]
    ReadOnly,

    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Symlink {link} points to missing entry {target}")]
    DanglingSymlink { link: EntryId, target: EntryId },

    #[error("Symlink loop detected at entry {0}")]
    SymlinkLoop(EntryId),

    #[error("Not a directory: {0}")]
    NotADirectory(EntryId),

    #[error("Not a file: {0}")]
    NotAFile(EntryId),

    #[error("Directory {0} is full")]
    DirectoryFull(EntryId),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("The root directory cannot be deleted")]
    RootDeletion,

    #[error("Entry {id} is not linked from its parent {parent}")]
    NotLinked { id: EntryId, parent: EntryId },

    #[error("Name too long: {len} bytes (max: {max})")]
    FilenameTooLong { len: usize, max: usize },

    #[error("Character {ch:?} cannot be encoded as {charset}")]
    Unencodable { ch: char, charset: &'static str },

    #[error("Index {index} out of range for length {size}")]
    OutOfRange { index: u64, size: u64 },

    #[error("Buffer of {0} bytes does not fit in a flat array")]
    TooLargeForFlatArray(u64),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Swapping in rewritten disk failed ({source}); original restored: {restored}")]
    Rewrite {
        source: std::io::Error,
        restored: bool,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChecksumMismatch> for TevdError {
    fn from(mismatch: ChecksumMismatch) -> Self {
        TevdError::ChecksumMismatch(mismatch)
    }
}

pub type Result<T> = std::result::Result<T, TevdError>;
