//! Disk entries and their binary encoding
//!
//! ```text
//! Entry header (281 bytes)
//!   0   4  entry id
//!   4   4  parent id
//!   8   1  type (1 = file, 2 = directory, 3 = symlink)
//!   9 256  filename, zero padded
//! 265   6  creation time (48-bit unix seconds)
//! 271   6  modification time (48-bit unix seconds)
//! 277   4  CRC32 of the body
//!
//! Body
//!   file       6-byte length + bytes
//!   directory  2-byte child count + 4-byte child ids
//!   symlink    4-byte target id
//! ```

use crate::buffer::ByteArray64;
use crate::charset::Charset;
use crate::error::{Result, TevdError};
use crate::header::{u48_from_bytes, u48_to_bytes, FOOTER_MARKER, MAX_U48};
use rand::Rng;
use std::io::{self, Read, Write};

pub type EntryId = i32;

/// The root directory; its parent is itself
pub const ROOT_ID: EntryId = 0;

/// Reserved id: the footer marker read as an entry id
pub const FOOTER_ID: EntryId = i32::from_be_bytes(FOOTER_MARKER);

pub const FILENAME_LENGTH: usize = 256;
pub const ENTRY_HEADER_SIZE: u64 = 281;

/// Format version 3 fixes this with the 16-bit child count
pub const MAX_DIRECTORY_CHILDREN: usize = 65_535;

/// Bytes a directory body grows by per child
pub const CHILD_ID_SIZE: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    File = 1,
    Directory = 2,
    Symlink = 3,
}

impl EntryType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(EntryType::File),
            2 => Ok(EntryType::Directory),
            3 => Ok(EntryType::Symlink),
            _ => Err(TevdError::InvalidEntryType(value)),
        }
    }

    /// Size of the field that opens the body and determines its length
    fn length_field_size(self) -> usize {
        match self {
            EntryType::File => 6,
            EntryType::Directory => 2,
            EntryType::Symlink => 4,
        }
    }

    /// Total body size given the opening length field
    fn body_size(self, length_field: &[u8]) -> u64 {
        match self {
            EntryType::File => 6 + u48_from_bytes(length_field),
            EntryType::Directory => {
                let count = u16::from_be_bytes([length_field[0], length_field[1]]);
                2 + CHILD_ID_SIZE * u64::from(count)
            }
            EntryType::Symlink => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryContent {
    File(ByteArray64),
    Directory(Vec<EntryId>),
    Symlink(EntryId),
}

impl EntryContent {
    pub fn empty_directory() -> Self {
        EntryContent::Directory(Vec::new())
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryContent::File(_) => EntryType::File,
            EntryContent::Directory(_) => EntryType::Directory,
            EntryContent::Symlink(_) => EntryType::Symlink,
        }
    }

    /// Body size in bytes
    pub fn serialized_size(&self) -> u64 {
        match self {
            EntryContent::File(bytes) => 6 + bytes.len(),
            EntryContent::Directory(children) => 2 + CHILD_ID_SIZE * children.len() as u64,
            EntryContent::Symlink(_) => 4,
        }
    }

    pub fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            EntryContent::File(bytes) => {
                w.write_all(&u48_to_bytes(bytes.len()))?;
                bytes.write_to(w)
            }
            EntryContent::Directory(children) => {
                w.write_all(&(children.len() as u16).to_be_bytes())?;
                for child in children {
                    w.write_all(&child.to_be_bytes())?;
                }
                Ok(())
            }
            EntryContent::Symlink(target) => w.write_all(&target.to_be_bytes()),
        }
    }

    pub fn body_crc(&self) -> u32 {
        let mut hasher = CrcWriter(crc32fast::Hasher::new());
        // writing into a hasher cannot fail
        let _ = self.write_body(&mut hasher);
        hasher.0.finalize()
    }
}

struct CrcWriter(crc32fast::Hasher);

impl Write for CrcWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Pick a random id that is neither reserved nor reported in use
pub fn generate_unique_id<F: Fn(EntryId) -> bool>(in_use: F) -> EntryId {
    let mut rng = rand::thread_rng();
    loop {
        let id: EntryId = rng.gen();
        if id != ROOT_ID && id != FOOTER_ID && !in_use(id) {
            return id;
        }
    }
}

/// Current time as a 48-bit unix timestamp
pub fn now_timestamp() -> u64 {
    (chrono::Utc::now().timestamp().max(0) as u64) & MAX_U48
}

/// Decoded fixed-size entry header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub entry_id: EntryId,
    pub parent_entry_id: EntryId,
    pub entry_type: EntryType,
    pub filename: [u8; FILENAME_LENGTH],
    pub creation_date: u64,
    pub modification_date: u64,
    pub crc: u32,
}

impl EntryHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENTRY_HEADER_SIZE as usize {
            return Err(TevdError::Truncated {
                offset: bytes.len() as u64,
                needed: ENTRY_HEADER_SIZE - bytes.len() as u64,
            });
        }
        let mut filename = [0u8; FILENAME_LENGTH];
        filename.copy_from_slice(&bytes[9..265]);

        Ok(EntryHeader {
            entry_id: i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            parent_entry_id: i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            entry_type: EntryType::from_u8(bytes[8])?,
            filename,
            creation_date: u48_from_bytes(&bytes[265..271]),
            modification_date: u48_from_bytes(&bytes[271..277]),
            crc: u32::from_be_bytes([bytes[277], bytes[278], bytes[279], bytes[280]]),
        })
    }

    /// Entry hash code: CRC32 of the raw header, which embeds the body CRC
    pub fn hash_code(raw: &[u8]) -> u32 {
        crc32fast::hash(&raw[..ENTRY_HEADER_SIZE as usize])
    }

    /// Read the body's length field and return the full body size
    pub fn read_body_size<R: Read>(&self, r: &mut R) -> io::Result<(u64, Vec<u8>)> {
        let mut field = vec![0u8; self.entry_type.length_field_size()];
        r.read_exact(&mut field)?;
        Ok((self.entry_type.body_size(&field), field))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub entry_id: EntryId,
    pub parent_entry_id: EntryId,
    pub filename: [u8; FILENAME_LENGTH],
    pub creation_date: u64,
    pub modification_date: u64,
    pub contents: EntryContent,
}

impl DiskEntry {
    /// Create an entry stamped with the current time
    pub fn new(
        entry_id: EntryId,
        parent_entry_id: EntryId,
        filename: [u8; FILENAME_LENGTH],
        contents: EntryContent,
    ) -> Self {
        let now = now_timestamp();
        DiskEntry {
            entry_id,
            parent_entry_id,
            filename,
            creation_date: now,
            modification_date: now,
            contents,
        }
    }

    pub fn named(
        entry_id: EntryId,
        parent_entry_id: EntryId,
        name: &str,
        charset: Charset,
        contents: EntryContent,
    ) -> Result<Self> {
        let filename = charset.encode_fixed(name)?;
        Ok(Self::new(entry_id, parent_entry_id, filename, contents))
    }

    pub fn root() -> Self {
        Self::new(
            ROOT_ID,
            ROOT_ID,
            [0; FILENAME_LENGTH],
            EntryContent::empty_directory(),
        )
    }

    pub fn filename(&self, charset: Charset) -> String {
        charset.decode(&self.filename)
    }

    pub fn set_filename(&mut self, name: &str, charset: Charset) -> Result<()> {
        self.filename = charset.encode_fixed(name)?;
        Ok(())
    }

    pub fn entry_type(&self) -> EntryType {
        self.contents.entry_type()
    }

    pub fn is_file(&self) -> bool {
        matches!(self.contents, EntryContent::File(_))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.contents, EntryContent::Directory(_))
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.contents, EntryContent::Symlink(_))
    }

    pub fn children(&self) -> Option<&[EntryId]> {
        match &self.contents {
            EntryContent::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn file_bytes(&self) -> Option<&ByteArray64> {
        match &self.contents {
            EntryContent::File(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Link a child into this directory
    pub fn add_child(&mut self, child: EntryId) -> Result<()> {
        let id = self.entry_id;
        match &mut self.contents {
            EntryContent::Directory(children) => {
                if children.len() >= MAX_DIRECTORY_CHILDREN {
                    return Err(TevdError::DirectoryFull(id));
                }
                if !children.contains(&child) {
                    children.push(child);
                }
                Ok(())
            }
            _ => Err(TevdError::NotADirectory(id)),
        }
    }

    /// Unlink a child; returns whether it was listed
    pub fn remove_child(&mut self, child: EntryId) -> bool {
        match &mut self.contents {
            EntryContent::Directory(children) => {
                let before = children.len();
                children.retain(|&c| c != child);
                children.len() != before
            }
            _ => false,
        }
    }

    pub fn touch(&mut self) {
        self.modification_date = now_timestamp();
    }

    /// Body size in bytes
    pub fn serialized_size(&self) -> u64 {
        self.contents.serialized_size()
    }

    /// Header plus body; the unit of offset arithmetic and capacity accounting
    pub fn entry_size(&self) -> u64 {
        ENTRY_HEADER_SIZE + self.serialized_size()
    }

    pub fn header_bytes(&self) -> [u8; ENTRY_HEADER_SIZE as usize] {
        let mut bytes = [0u8; ENTRY_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.entry_id.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.parent_entry_id.to_be_bytes());
        bytes[8] = self.entry_type() as u8;
        bytes[9..265].copy_from_slice(&self.filename);
        bytes[265..271].copy_from_slice(&u48_to_bytes(self.creation_date));
        bytes[271..277].copy_from_slice(&u48_to_bytes(self.modification_date));
        bytes[277..281].copy_from_slice(&self.contents.body_crc().to_be_bytes());
        bytes
    }

    pub fn hash_code(&self) -> u32 {
        EntryHeader::hash_code(&self.header_bytes())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.header_bytes())?;
        self.contents.write_body(w)
    }

    pub fn to_bytes(&self) -> ByteArray64 {
        let mut out = ByteArray64::with_capacity(self.entry_size());
        // writing into a ByteArray64 cannot fail
        let _ = self.write_to(&mut out);
        out
    }

    /// Decode one entry, returning it with its stored body CRC and hash code
    ///
    /// Checksums are not verified here; callers decide how strict to be.
    pub fn read_from<R: Read>(r: &mut R) -> Result<(Self, u32, u32)> {
        let mut raw = [0u8; ENTRY_HEADER_SIZE as usize];
        r.read_exact(&mut raw)?;
        let header = EntryHeader::from_bytes(&raw)?;
        let hash_code = EntryHeader::hash_code(&raw);

        let (_, field) = header.read_body_size(r)?;
        let contents = match header.entry_type {
            EntryType::File => {
                let len = u48_from_bytes(&field);
                EntryContent::File(ByteArray64::read_from(r, len)?)
            }
            EntryType::Directory => {
                let count = u16::from_be_bytes([field[0], field[1]]) as usize;
                let mut ids = vec![0u8; count * CHILD_ID_SIZE as usize];
                r.read_exact(&mut ids)?;
                EntryContent::Directory(
                    ids.chunks_exact(4)
                        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            EntryType::Symlink => {
                EntryContent::Symlink(i32::from_be_bytes([field[0], field[1], field[2], field[3]]))
            }
        };

        let entry = DiskEntry {
            entry_id: header.entry_id,
            parent_entry_id: header.parent_entry_id,
            filename: header.filename,
            creation_date: header.creation_date,
            modification_date: header.modification_date,
            contents,
        };
        Ok((entry, header.crc, hash_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: EntryId, name: &str, data: &[u8]) -> DiskEntry {
        DiskEntry::named(
            id,
            ROOT_ID,
            name,
            Charset::Utf8,
            EntryContent::File(ByteArray64::from_slice(data)),
        )
        .unwrap()
    }

    #[test]
    fn test_footer_id_is_reserved_value() {
        assert_eq!(FOOTER_ID as u32, 0xFEFE_FEFE);
    }

    #[test]
    fn test_entry_type_conversion() {
        assert_eq!(EntryType::from_u8(1).unwrap(), EntryType::File);
        assert_eq!(EntryType::from_u8(2).unwrap(), EntryType::Directory);
        assert_eq!(EntryType::from_u8(3).unwrap(), EntryType::Symlink);
        assert!(matches!(
            EntryType::from_u8(9),
            Err(TevdError::InvalidEntryType(9))
        ));
    }

    #[test]
    fn test_sizes() {
        let f = file(1, "a.txt", &[0u8; 100]);
        assert_eq!(f.serialized_size(), 106);
        assert_eq!(f.entry_size(), 281 + 106);
        assert_eq!(f.to_bytes().len(), f.entry_size());

        let mut dir = DiskEntry::root();
        dir.add_child(1).unwrap();
        dir.add_child(2).unwrap();
        assert_eq!(dir.serialized_size(), 2 + 8);

        let link = DiskEntry::new(3, ROOT_ID, [0; FILENAME_LENGTH], EntryContent::Symlink(1));
        assert_eq!(link.entry_size(), 285);
    }

    #[test]
    fn test_header_layout() {
        let mut f = file(0x0102_0304, "hi", b"xyz");
        f.creation_date = 0x0A0B;
        f.modification_date = 0x0C0D;
        let bytes = f.to_bytes().to_vec().unwrap();

        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..11], b"hi");
        assert_eq!(&bytes[265..271], &[0, 0, 0, 0, 0x0A, 0x0B]);
        assert_eq!(&bytes[271..277], &[0, 0, 0, 0, 0x0C, 0x0D]);
        assert_eq!(&bytes[277..281], &crc32fast::hash(&bytes[281..]).to_be_bytes());
        assert_eq!(&bytes[281..287], &[0, 0, 0, 0, 0, 3]);
        assert_eq!(&bytes[287..], b"xyz");
    }

    #[test]
    fn test_decode_entry() {
        let mut dir = DiskEntry::named(7, ROOT_ID, "bin", Charset::Utf8, EntryContent::empty_directory())
            .unwrap();
        dir.add_child(11).unwrap();
        dir.add_child(-4).unwrap();

        let bytes = dir.to_bytes();
        let (decoded, crc, hash) = DiskEntry::read_from(&mut bytes.reader()).unwrap();
        assert_eq!(decoded, dir);
        assert_eq!(crc, dir.contents.body_crc());
        assert_eq!(hash, dir.hash_code());
        assert_eq!(decoded.filename(Charset::Utf8), "bin");
    }

    #[test]
    fn test_decode_truncated_body() {
        let bytes = file(1, "a", &[1u8; 50]).to_bytes();
        let short = bytes.slice(0..bytes.len() - 10).unwrap();
        assert!(matches!(
            DiskEntry::read_from(&mut short.reader()),
            Err(TevdError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn test_hash_code_tracks_content() {
        let a = file(1, "a", b"one");
        let mut b = a.clone();
        b.contents = EntryContent::File(ByteArray64::from_slice(b"two"));
        assert_ne!(a.hash_code(), b.hash_code());
    }

    #[test]
    fn test_add_child_rules() {
        let mut f = file(1, "a", b"");
        assert!(matches!(f.add_child(2), Err(TevdError::NotADirectory(1))));

        let mut dir = DiskEntry::root();
        dir.add_child(5).unwrap();
        dir.add_child(5).unwrap();
        assert_eq!(dir.children().unwrap(), &[5]);
        assert!(dir.remove_child(5));
        assert!(!dir.remove_child(5));
    }

    #[test]
    fn test_directory_full() {
        let mut dir = DiskEntry::root();
        if let EntryContent::Directory(children) = &mut dir.contents {
            children.extend(1..=MAX_DIRECTORY_CHILDREN as i32);
        }
        assert!(matches!(
            dir.add_child(-1),
            Err(TevdError::DirectoryFull(ROOT_ID))
        ));
    }
}
