//! Disk file access and the copy-rewrite transaction
//!
//! Mutating an image never edits it in place. A replacement is staged next
//! to the original as `<name>_tmp`, then rotated in:
//!
//! ```text
//! 1. stage    write <name>_tmp, flush, fsync
//! 2. rotate   <name> -> <name>_old, <name>_tmp -> <name>
//! 3. cleanup  delete <name>_old
//! ```
//!
//! Renames are not assumed atomic on every platform. A crash between the
//! two renames leaves `<name>_old` behind with no live file;
//! [`recover_interrupted_rewrite`] puts it back.

use crate::error::{Result, TevdError};
use crate::header::{DiskHeader, DISK_HEADER_SIZE};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const COPY_CHUNK: usize = 64 * 1024;

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Where a rewrite of `path` is staged
pub fn staging_path(path: &Path) -> PathBuf {
    sibling(path, "_tmp")
}

/// Where the original of `path` is parked during rotation
pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, "_old")
}

/// Read handle on a disk image
pub struct DiskFile {
    file: File,
    path: PathBuf,
}

impl DiskFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        Ok(DiskFile {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn read_header(&mut self) -> Result<DiskHeader> {
        let mut buffer = [0u8; DISK_HEADER_SIZE as usize];
        self.read_exact_at(0, &mut buffer)?;
        DiskHeader::from_bytes(&buffer)
    }

    /// Fill `buf` from `offset`; a short file is reported as truncation
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(TevdError::Truncated {
                        offset: offset + filled as u64,
                        needed: (buf.len() - filled) as u64,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Position the handle at `offset` and hand it out as a reader
    pub fn reader_at(&mut self, offset: u64) -> Result<&mut File> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(&mut self.file)
    }

    pub fn read_to_end_from(&mut self, offset: u64) -> Result<Vec<u8>> {
        let mut rest = Vec::new();
        self.reader_at(offset)?.read_to_end(&mut rest)?;
        Ok(rest)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Overwrite the header of an existing image in place
///
/// Only used for fixed-size header fields; entry data is never edited in place.
pub fn write_header_in_place(path: &Path, header: &DiskHeader) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// A staged replacement for a disk image
///
/// Dropping the transaction without [`commit`](Self::commit) discards the
/// staging file and leaves the original untouched.
pub struct RewriteTxn {
    target: PathBuf,
    staging: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl RewriteTxn {
    pub fn begin<P: AsRef<Path>>(target: P) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let staging = staging_path(&target);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)?;

        Ok(RewriteTxn {
            target,
            staging,
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    /// Bytes staged so far, i.e. the offset the next write lands at
    pub fn position(&self) -> u64 {
        self.written
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "rewrite already finished"))
    }

    /// Stream `len` bytes of `src` starting at `offset` into the staging file
    pub fn copy_range(&mut self, src: &mut DiskFile, offset: u64, len: u64) -> Result<()> {
        let mut chunk = vec![0u8; COPY_CHUNK];
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let n = ((end - pos) as usize).min(COPY_CHUNK);
            src.read_exact_at(pos, &mut chunk[..n])?;
            self.write_all(&chunk[..n])?;
            pos += n as u64;
        }
        Ok(())
    }

    /// Rotate the staged file in for the target
    pub fn commit(mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }

        if !self.target.exists() {
            fs::rename(&self.staging, &self.target)?;
            return Ok(());
        }

        let backup = backup_path(&self.target);
        if let Err(source) = fs::rename(&self.target, &backup) {
            let _ = fs::remove_file(&self.staging);
            return Err(TevdError::Rewrite {
                source,
                restored: true,
            });
        }

        if let Err(source) = fs::rename(&self.staging, &self.target) {
            let restored = fs::rename(&backup, &self.target).is_ok();
            if !restored {
                tracing::warn!(
                    "Could not restore {} from {}; manual recovery needed",
                    self.target.display(),
                    backup.display()
                );
            }
            return Err(TevdError::Rewrite { source, restored });
        }

        if let Err(e) = fs::remove_file(&backup) {
            tracing::warn!("Could not remove backup {}: {}", backup.display(), e);
        }
        Ok(())
    }
}

impl Write for RewriteTxn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer()?.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl Drop for RewriteTxn {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.staging);
        }
    }
}

/// Outcome of [`recover_interrupted_rewrite`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing was left over
    Clean,
    /// The live file was missing and the backup was moved back
    RestoredBackup,
    /// Stale staging or backup files next to a live image were removed
    RemovedLeftovers,
}

/// Repair the state left by a rewrite that was interrupted mid-rotation
pub fn recover_interrupted_rewrite<P: AsRef<Path>>(path: P) -> Result<Recovery> {
    let path = path.as_ref();
    let backup = backup_path(path);
    let staging = staging_path(path);
    let mut outcome = Recovery::Clean;

    if !path.exists() && backup.exists() {
        tracing::warn!("Restoring {} from {}", path.display(), backup.display());
        fs::rename(&backup, path)?;
        outcome = Recovery::RestoredBackup;
    } else if backup.exists() {
        tracing::warn!("Removing leftover backup {}", backup.display());
        fs::remove_file(&backup)?;
        outcome = Recovery::RemovedLeftovers;
    }

    if staging.exists() {
        tracing::warn!("Removing leftover staging file {}", staging.display());
        fs::remove_file(&staging)?;
        if outcome == Recovery::Clean {
            outcome = Recovery::RemovedLeftovers;
        }
    }

    Ok(outcome)
}
