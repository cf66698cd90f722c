//! Chunked byte buffer addressable by a 64-bit index
//!
//! Disk images and file contents can exceed what a single flat allocation
//! comfortably holds, so [`ByteArray64`] stores its bytes in fixed-size
//! banks that are allocated lazily. Growing doubles the number of bank
//! slots, and at most one partially used bank is ever over-allocated.
//!
//! ```text
//! index:  0 ............ 8191 | 8192 .......... 16383 | 16384 ...
//!         [     bank 0       ] [       bank 1        ] [ bank 2 ...
//! ```

use crate::error::{Result, TevdError};
use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::Path;

/// Default bank size in bytes
pub const DEFAULT_BANK_SIZE: usize = 8192;

/// Largest buffer that [`ByteArray64::to_vec`] will flatten
pub const FLAT_ARRAY_LIMIT: u64 = i32::MAX as u64 - 8;

#[derive(Clone)]
pub struct ByteArray64 {
    /// Bank slots; `None` means the bank was never written and reads as zeros
    banks: Vec<Option<Box<[u8]>>>,
    bank_size: usize,
    size: u64,
}

impl ByteArray64 {
    pub fn new() -> Self {
        Self::with_bank_size(DEFAULT_BANK_SIZE)
    }

    pub fn with_bank_size(bank_size: usize) -> Self {
        ByteArray64 {
            banks: Vec::new(),
            bank_size: bank_size.max(1),
            size: 0,
        }
    }

    /// Create an empty buffer with bank slots reserved for `capacity` bytes
    pub fn with_capacity(capacity: u64) -> Self {
        let mut buf = Self::new();
        if capacity > 0 {
            buf.ensure_capacity(capacity - 1);
        }
        buf
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::with_capacity(bytes.len() as u64);
        buf.extend_from_slice(bytes);
        buf
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bank_size(&self) -> usize {
        self.bank_size
    }

    /// Bytes addressable without growing
    pub fn capacity(&self) -> u64 {
        self.banks.len() as u64 * self.bank_size as u64
    }

    /// Grow the bank table (doubling) until `index` is addressable
    pub fn ensure_capacity(&mut self, index: u64) {
        if index < self.capacity() {
            return;
        }
        let mut slots = self.banks.len().max(1);
        while (slots as u64) * (self.bank_size as u64) <= index {
            slots *= 2;
        }
        self.banks.resize_with(slots, || None);
    }

    fn locate(&self, index: u64) -> (usize, usize) {
        let bank_size = self.bank_size as u64;
        ((index / bank_size) as usize, (index % bank_size) as usize)
    }

    fn bank_mut(&mut self, bank: usize) -> &mut [u8] {
        let bank_size = self.bank_size;
        self.banks[bank].get_or_insert_with(|| vec![0u8; bank_size].into_boxed_slice())
    }

    pub fn get(&self, index: u64) -> Result<u8> {
        if index >= self.size {
            return Err(TevdError::OutOfRange {
                index,
                size: self.size,
            });
        }
        let (bank, offset) = self.locate(index);
        Ok(self.banks[bank].as_ref().map_or(0, |b| b[offset]))
    }

    /// Write a byte, growing the buffer if `index` is past the end
    pub fn set(&mut self, index: u64, value: u8) {
        self.ensure_capacity(index);
        let (bank, offset) = self.locate(index);
        self.bank_mut(bank)[offset] = value;
        self.size = self.size.max(index + 1);
    }

    pub fn push(&mut self, value: u8) {
        self.set(self.size, value);
    }

    pub fn extend_from_slice(&mut self, mut bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.ensure_capacity(self.size + bytes.len() as u64 - 1);
        while !bytes.is_empty() {
            let (bank, offset) = self.locate(self.size);
            let n = (self.bank_size - offset).min(bytes.len());
            self.bank_mut(bank)[offset..offset + n].copy_from_slice(&bytes[..n]);
            self.size += n as u64;
            bytes = &bytes[n..];
        }
    }

    pub fn append(&mut self, other: &ByteArray64) {
        for bank in other.banks() {
            self.extend_from_slice(&bank);
        }
    }

    /// Copy `dst.len()` bytes starting at `start` into `dst`
    pub fn copy_to(&self, start: u64, dst: &mut [u8]) -> Result<()> {
        let end = start + dst.len() as u64;
        if end > self.size {
            return Err(TevdError::OutOfRange {
                index: end.saturating_sub(1),
                size: self.size,
            });
        }
        let mut pos = start;
        let mut written = 0;
        while written < dst.len() {
            let (bank, offset) = self.locate(pos);
            let n = (self.bank_size - offset).min(dst.len() - written);
            match &self.banks[bank] {
                Some(b) => dst[written..written + n].copy_from_slice(&b[offset..offset + n]),
                None => dst[written..written + n].fill(0),
            }
            written += n;
            pos += n as u64;
        }
        Ok(())
    }

    pub fn slice(&self, range: Range<u64>) -> Result<ByteArray64> {
        if range.start > range.end || range.end > self.size {
            return Err(TevdError::OutOfRange {
                index: range.end,
                size: self.size,
            });
        }
        let mut out = ByteArray64::with_bank_size(self.bank_size);
        let mut pos = range.start;
        let mut chunk = vec![0u8; self.bank_size];
        while pos < range.end {
            let n = ((range.end - pos) as usize).min(self.bank_size);
            self.copy_to(pos, &mut chunk[..n])?;
            out.extend_from_slice(&chunk[..n]);
            pos += n as u64;
        }
        Ok(out)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        if self.size > FLAT_ARRAY_LIMIT {
            return Err(TevdError::TooLargeForFlatArray(self.size));
        }
        let mut out = vec![0u8; self.size as usize];
        self.copy_to(0, &mut out)?;
        Ok(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.banks()
            .flat_map(|bank| bank.into_owned().into_iter())
    }

    /// Iterate big-endian 32-bit words; an incomplete trailing word is zero-padded
    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        let count = (self.size + 3) / 4;
        (0..count).map(move |w| {
            let mut word = [0u8; 4];
            for (i, byte) in word.iter_mut().enumerate() {
                *byte = self.get(w * 4 + i as u64).unwrap_or(0);
            }
            u32::from_be_bytes(word)
        })
    }

    /// Iterate the used portion of every bank, in order
    pub fn banks(&self) -> impl Iterator<Item = Cow<'_, [u8]>> + '_ {
        let bank_size = self.bank_size as u64;
        let used_banks = ((self.size + bank_size - 1) / bank_size) as usize;
        (0..used_banks).map(move |i| {
            let start = i as u64 * bank_size;
            let len = (self.size - start).min(bank_size) as usize;
            match &self.banks[i] {
                Some(b) => Cow::Borrowed(&b[..len]),
                None => Cow::Owned(vec![0u8; len]),
            }
        })
    }

    pub fn reader(&self) -> ByteArray64Reader<'_> {
        ByteArray64Reader {
            source: self,
            position: 0,
        }
    }

    pub fn crc32(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for bank in self.banks() {
            hasher.update(&bank);
        }
        hasher.finalize()
    }

    /// Read exactly `len` bytes from a reader
    ///
    /// Bank slots grow as data arrives, so a corrupt length field cannot
    /// trigger a huge up-front allocation.
    pub fn read_from<R: Read>(reader: &mut R, len: u64) -> io::Result<Self> {
        let mut buf = Self::new();
        let mut chunk = vec![0u8; buf.bank_size];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            reader.read_exact(&mut chunk[..n])?;
            buf.extend_from_slice(&chunk[..n]);
            remaining -= n as u64;
        }
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for bank in self.banks() {
            writer.write_all(&bank)?;
        }
        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::read_from(&mut BufReader::new(file), len)?)
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Sequential reader over a [`ByteArray64`]
pub struct ByteArray64Reader<'a> {
    source: &'a ByteArray64,
    position: u64,
}

impl ByteArray64Reader<'_> {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.source.len() - self.position
    }
}

impl Read for ByteArray64Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (buf.len() as u64).min(self.remaining()) as usize;
        self.source
            .copy_to(self.position, &mut buf[..n])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Default for ByteArray64 {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ByteArray64 {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.iter().eq(other.iter())
    }
}

impl Eq for ByteArray64 {}

impl fmt::Debug for ByteArray64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteArray64")
            .field("size", &self.size)
            .field("bank_size", &self.bank_size)
            .field("banks", &self.banks.len())
            .finish()
    }
}

impl From<&[u8]> for ByteArray64 {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

impl From<Vec<u8>> for ByteArray64 {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_slice(&bytes)
    }
}

impl Write for ByteArray64 {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
