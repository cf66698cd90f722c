//! # TEVD - Virtual Disk Images
//!
//! `tevd` reads and writes TEVD disk images: a single file holding a tree
//! of files, directories and symlinks, each addressed by a 32-bit entry id.
//!
//! Three ways to work with an image:
//!
//! - **[`VirtualDisk`]**: the whole image in memory, for bulk edits
//! - **[`DiskSkimmer`]**: an offset index over the file, reading single
//!   entries on demand and rewriting the file for each mutation
//! - **[`PartialDom`]**: a skimmer with a bloom-gated cache and
//!   write-behind changes flushed on commit
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tevd::{ByteArray64, Charset, CrcLevel, VirtualDisk, ROOT_ID, Result};
//!
//! # fn main() -> Result<()> {
//! let cs = Charset::Utf8;
//! let mut disk = VirtualDisk::new(1_000_000, "TEST", cs)?;
//! let bin = disk.add_dir(ROOT_ID, "bin", cs)?;
//! disk.add_file(bin, "hello.txt", ByteArray64::from_slice(b"hello"), cs)?;
//! disk.write_to_file("test.tevd")?;
//!
//! let loaded = VirtualDisk::read_from_file("test.tevd", CrcLevel::Fail)?;
//! assert!(loaded.find("/bin/hello.txt", cs).is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Streaming Access
//!
//! ```rust,no_run
//! use tevd::{ByteArray64, Charset, DiskSkimmer, Result};
//!
//! # fn main() -> Result<()> {
//! let cs = Charset::Utf8;
//! let mut skimmer = DiskSkimmer::open("test.tevd")?;
//! skimmer.create_new_file("/etc/motd", ByteArray64::from_slice(b"hi"), false, cs)?;
//! let motd = skimmer.request_path("/etc/motd", cs)?;
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod buffer;
pub mod charset;
pub mod config;
pub mod entry;
pub mod error;
pub mod header;
pub mod index;
pub mod integrity;
pub mod io;
pub mod partial;
pub mod skimmer;
pub mod vdisk;

pub use bloom::BloomFilter;
pub use buffer::ByteArray64;
pub use charset::Charset;
pub use config::{CacheConfig, PartialDomBuilder};
pub use entry::{DiskEntry, EntryContent, EntryId, EntryType, ROOT_ID};
pub use error::{Result, TevdError};
pub use header::DiskHeader;
pub use index::DirectoryIndex;
pub use integrity::{ChecksumMismatch, ChecksumScope, CrcLevel};
pub use partial::{CacheStats, PartialDom};
pub use skimmer::DiskSkimmer;
pub use vdisk::{GcReport, VirtualDisk};
