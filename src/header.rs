use crate::charset::Charset;
use crate::error::{Result, TevdError};

pub const MAGIC: [u8; 4] = *b"TEVd";
pub const FORMAT_VERSION: u8 = 3;

pub const DISK_HEADER_SIZE: u64 = 64;
pub const DISK_NAME_LENGTH: usize = 32;
pub const EXTRA_ATTRIBUTES_LENGTH: usize = 16;

/// Largest value a 48-bit length or capacity field can hold
pub const MAX_U48: u64 = (1 << 48) - 1;

/// Attribute bit 0: write-protected
pub const ATTR_READ_ONLY: u8 = 0x01;

/// Four 0xFE bytes open the footer; read as an entry id this is the
/// "no more entries" sentinel
pub const FOOTER_MARKER: [u8; 4] = [0xFE; 4];
pub const EOF_MARK: [u8; 2] = [0xFF, 0x19];
pub const FOOTER: [u8; 6] = [0xFE, 0xFE, 0xFE, 0xFE, 0xFF, 0x19];

pub(crate) fn u48_to_bytes(value: u64) -> [u8; 6] {
    let b = value.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

pub(crate) fn u48_from_bytes(bytes: &[u8]) -> u64 {
    bytes[..6]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Disk header (first 64 bytes of the image)
///
/// ```text
/// offset  size  field
///      0     4  magic "TEVd"
///      4     6  capacity (48-bit)
///     10    32  disk name
///     42     4  CRC32 over all entry hash codes
///     46     1  format version
///     47     1  attributes (bit 0 = read-only)
///     48    16  extra attributes (opaque)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskHeader {
    pub capacity: u64,
    pub disk_name: [u8; DISK_NAME_LENGTH],
    pub crc: u32,
    pub version: u8,
    pub attributes: u8,
    pub extra_attributes: [u8; EXTRA_ATTRIBUTES_LENGTH],
}

impl DiskHeader {
    pub fn new(capacity: u64, disk_name: [u8; DISK_NAME_LENGTH]) -> Self {
        DiskHeader {
            capacity: capacity.min(MAX_U48),
            disk_name,
            crc: 0,
            version: FORMAT_VERSION,
            attributes: 0,
            extra_attributes: [0; EXTRA_ATTRIBUTES_LENGTH],
        }
    }

    /// Capacity zero or the write-protect bit both make a disk read-only
    pub fn is_read_only(&self) -> bool {
        self.capacity == 0 || self.attributes & ATTR_READ_ONLY != 0
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        if read_only {
            self.attributes |= ATTR_READ_ONLY;
        } else {
            self.attributes &= !ATTR_READ_ONLY;
        }
    }

    pub fn name(&self, charset: Charset) -> String {
        charset.decode(&self.disk_name)
    }

    pub fn to_bytes(&self) -> [u8; DISK_HEADER_SIZE as usize] {
        let mut bytes = [0u8; DISK_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4..10].copy_from_slice(&u48_to_bytes(self.capacity));
        bytes[10..42].copy_from_slice(&self.disk_name);
        bytes[42..46].copy_from_slice(&self.crc.to_be_bytes());
        bytes[46] = self.version;
        bytes[47] = self.attributes;
        bytes[48..64].copy_from_slice(&self.extra_attributes);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DISK_HEADER_SIZE as usize {
            return Err(TevdError::Truncated {
                offset: bytes.len() as u64,
                needed: DISK_HEADER_SIZE - bytes.len() as u64,
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != MAGIC {
            return Err(TevdError::InvalidMagic(magic));
        }

        let version = bytes[46];
        if version != FORMAT_VERSION {
            return Err(TevdError::UnsupportedVersion(version));
        }

        let mut disk_name = [0u8; DISK_NAME_LENGTH];
        disk_name.copy_from_slice(&bytes[10..42]);
        let mut extra_attributes = [0u8; EXTRA_ATTRIBUTES_LENGTH];
        extra_attributes.copy_from_slice(&bytes[48..64]);

        Ok(DiskHeader {
            capacity: u48_from_bytes(&bytes[4..10]),
            disk_name,
            crc: u32::from_be_bytes([bytes[42], bytes[43], bytes[44], bytes[45]]),
            version,
            attributes: bytes[47],
            extra_attributes,
        })
    }
}
