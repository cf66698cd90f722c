//! Streaming access to a disk image
//!
//! [`DiskSkimmer`] scans an image once to build an `id -> offset` index
//! and afterwards reads single entries by seeking straight to them.
//! Mutations go through the copy-rewrite transaction in [`crate::io`]:
//! the whole image is restaged and swapped in, and the index is only
//! replaced once the swap succeeded.
//!
//! Deleting is O(remaining entries). Bulk edits should load a
//! [`VirtualDisk`] and write it back in one pass instead.

use crate::buffer::ByteArray64;
use crate::charset::Charset;
use crate::entry::{
    generate_unique_id, DiskEntry, EntryContent, EntryHeader, EntryId, ENTRY_HEADER_SIZE,
    FOOTER_ID, ROOT_ID,
};
use crate::error::{Result, TevdError};
use crate::header::{DiskHeader, DISK_HEADER_SIZE, FOOTER_MARKER};
use crate::integrity::{self, ChecksumMismatch, ChecksumScope, CrcLevel, WarningSink};
use crate::io::{write_header_in_place, DiskFile, RewriteTxn};
use crate::vdisk::VirtualDisk;
use std::collections::{HashMap, HashSet};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where an entry lives in the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub offset: u64,
    /// Header plus body
    pub size: u64,
    pub hash_code: u32,
}

pub struct DiskSkimmer {
    file: DiskFile,
    path: PathBuf,
    header: DiskHeader,
    index: HashMap<EntryId, EntryLocation>,
    footer_position: u64,
    crc_level: CrcLevel,
    on_warn: WarningSink,
}

impl DiskSkimmer {
    /// Open and index an image, warning on checksum mismatches
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_level(path, CrcLevel::Warn)
    }

    pub fn open_with_level<P: AsRef<Path>>(path: P, crc_level: CrcLevel) -> Result<Self> {
        Self::open_with_callback(path, crc_level, Box::new(|_: &ChecksumMismatch| {}))
    }

    /// Open with a callback that receives every mismatch found at [`CrcLevel::Warn`]
    pub fn open_with_callback<P: AsRef<Path>>(
        path: P,
        crc_level: CrcLevel,
        on_warn: WarningSink,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = DiskFile::open(&path)?;
        let header = file.read_header()?;
        let (index, footer_position) = Self::scan(&mut file)?;

        let mut skimmer = DiskSkimmer {
            file,
            path,
            header,
            index,
            footer_position,
            crc_level,
            on_warn,
        };
        skimmer.verify_disk_crc()?;
        debug!(
            "Indexed {} entries in {} (footer at {})",
            skimmer.index.len(),
            skimmer.path.display(),
            skimmer.footer_position
        );
        Ok(skimmer)
    }

    /// Re-read the header and rescan the file, keeping level and callback
    pub fn reload(&mut self) -> Result<()> {
        let mut file = DiskFile::open(&self.path)?;
        let header = file.read_header()?;
        let (index, footer_position) = Self::scan(&mut file)?;

        self.file = file;
        self.header = header;
        self.index = index;
        self.footer_position = footer_position;
        self.verify_disk_crc()
    }

    fn verify_disk_crc(&mut self) -> Result<()> {
        let computed = integrity::disk_crc(self.index.values().map(|loc| loc.hash_code));
        integrity::verify(
            self.crc_level,
            ChecksumScope::Disk,
            self.header.crc,
            computed,
            &mut *self.on_warn,
        )
    }

    pub fn set_warning_callback<F>(&mut self, on_warn: F)
    where
        F: FnMut(&ChecksumMismatch) + Send + 'static,
    {
        self.on_warn = Box::new(on_warn);
    }

    /// Create a new image file holding only the root, then open it
    pub fn create<P: AsRef<Path>>(
        path: P,
        capacity: u64,
        disk_name: &str,
        charset: Charset,
    ) -> Result<Self> {
        let disk = VirtualDisk::new(capacity, disk_name, charset)?;
        disk.write_to_file(path.as_ref())?;
        info!(
            "Created disk image {} ({} bytes)",
            path.as_ref().display(),
            capacity
        );
        Self::open(path)
    }

    fn scan(file: &mut DiskFile) -> Result<(HashMap<EntryId, EntryLocation>, u64)> {
        let file_len = file.len()?;
        let mut index = HashMap::new();
        let mut offset = DISK_HEADER_SIZE;
        let mut last_good_offset = DISK_HEADER_SIZE;

        loop {
            let corrupt = |reason: String| TevdError::CorruptEntry {
                offset,
                last_good_offset,
                reason,
            };

            let mut marker = [0u8; 4];
            file.read_exact_at(offset, &mut marker)
                .map_err(|e| corrupt(e.to_string()))?;
            if marker == FOOTER_MARKER {
                return Ok((index, offset));
            }

            let mut raw = [0u8; ENTRY_HEADER_SIZE as usize];
            file.read_exact_at(offset, &mut raw)
                .map_err(|e| corrupt(e.to_string()))?;
            let header = EntryHeader::from_bytes(&raw).map_err(|e| corrupt(e.to_string()))?;
            let (body_size, _) = header
                .read_body_size(file.reader_at(offset + ENTRY_HEADER_SIZE)?)
                .map_err(|e| corrupt(e.to_string()))?;

            let size = ENTRY_HEADER_SIZE + body_size;
            if offset + size > file_len {
                return Err(corrupt(format!(
                    "entry {} claims {} bytes past the end of the file",
                    header.entry_id,
                    offset + size - file_len
                )));
            }

            index.insert(
                header.entry_id,
                EntryLocation {
                    offset,
                    size,
                    hash_code: EntryHeader::hash_code(&raw),
                },
            );
            last_good_offset = offset;
            offset += size;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &DiskHeader {
        &self.header
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    pub fn disk_name(&self, charset: Charset) -> String {
        self.header.name(charset)
    }

    pub fn is_read_only(&self) -> bool {
        self.header.is_read_only()
    }

    pub fn crc_level(&self) -> CrcLevel {
        self.crc_level
    }

    pub fn footer_position(&self) -> u64 {
        self.footer_position
    }

    pub fn used_bytes(&self) -> u64 {
        DISK_HEADER_SIZE + self.index.values().map(|loc| loc.size).sum::<u64>()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn location(&self, id: EntryId) -> Option<EntryLocation> {
        self.index.get(&id).copied()
    }

    pub fn entry_ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.index.keys().copied()
    }

    /// Decode only the fixed-size header of an entry
    pub fn request_header(&mut self, id: EntryId) -> Result<Option<EntryHeader>> {
        let loc = match self.index.get(&id) {
            Some(loc) => *loc,
            None => return Ok(None),
        };
        let mut raw = [0u8; ENTRY_HEADER_SIZE as usize];
        self.file.read_exact_at(loc.offset, &mut raw)?;
        EntryHeader::from_bytes(&raw).map(Some)
    }

    /// Materialize one entry by seeking to its indexed offset
    pub fn request_file(&mut self, id: EntryId) -> Result<Option<DiskEntry>> {
        let loc = match self.index.get(&id) {
            Some(loc) => *loc,
            None => return Ok(None),
        };
        let mut reader = BufReader::new(self.file.reader_at(loc.offset)?);
        let (entry, stored_crc, _) = DiskEntry::read_from(&mut reader)?;
        integrity::verify(
            self.crc_level,
            ChecksumScope::Entry(id),
            stored_crc,
            entry.contents.body_crc(),
            &mut *self.on_warn,
        )?;
        Ok(Some(entry))
    }

    /// Id of the child of `dir` called `name`, reading only child headers
    fn child_named(&mut self, dir: &DiskEntry, name: &str, charset: Charset) -> Result<Option<EntryId>> {
        let children = match dir.children() {
            Some(children) => children.to_vec(),
            None => return Ok(None),
        };
        for child in children {
            if let Some(header) = self.request_header(child)? {
                if charset.decode(&header.filename) == name {
                    return Ok(Some(child));
                }
            }
        }
        Ok(None)
    }

    /// Resolve a slash-separated path one directory level at a time
    ///
    /// A file met before the last segment yields `None`.
    pub fn request_path(&mut self, path: &str, charset: Charset) -> Result<Option<DiskEntry>> {
        let mut current = match self.request_file(ROOT_ID)? {
            Some(root) => root,
            None => return Ok(None),
        };
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let child = match self.child_named(&current, segment, charset)? {
                Some(child) => child,
                None => return Ok(None),
            };
            current = match self.request_file(child)? {
                Some(entry) => entry,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TevdError::ReadOnly);
        }
        Ok(())
    }

    /// Add or replace entries through one copy-rewrite
    ///
    /// An id already on disk has its old copy dropped; a new root is
    /// always written at the first entry position.
    pub fn append_entries(&mut self, entries: &[DiskEntry]) -> Result<()> {
        self.check_writable()?;
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(bad) = entries.iter().find(|e| e.entry_id == FOOTER_ID) {
            return Err(TevdError::InvalidOperation(format!(
                "entry id {:#X} is reserved",
                bad.entry_id
            )));
        }

        let replaced: HashSet<EntryId> = entries
            .iter()
            .map(|e| e.entry_id)
            .filter(|id| self.index.contains_key(id))
            .collect();

        let used = self.used_bytes();
        let freed: u64 = replaced.iter().filter_map(|id| self.index.get(id)).map(|l| l.size).sum();
        let added: u64 = entries.iter().map(DiskEntry::entry_size).sum();
        if used - freed + added > self.capacity() {
            return Err(TevdError::CapacityExceeded {
                needed: added.saturating_sub(freed),
                available: self.capacity().saturating_sub(used),
            });
        }

        self.rewrite(&replaced, entries)?;
        info!(
            "Appended {} entries to {} ({} replaced)",
            entries.len(),
            self.path.display(),
            replaced.len()
        );
        Ok(())
    }

    /// Remove entries through one copy-rewrite
    ///
    /// Parent child lists are not touched; unknown ids are skipped.
    pub fn delete_entries(&mut self, ids: &[EntryId]) -> Result<()> {
        self.check_writable()?;
        if ids.contains(&ROOT_ID) {
            return Err(TevdError::RootDeletion);
        }

        let mut doomed = HashSet::new();
        for &id in ids {
            if self.index.contains_key(&id) {
                doomed.insert(id);
            } else {
                debug!("Skipping delete of unknown entry {}", id);
            }
        }
        if doomed.is_empty() {
            return Ok(());
        }

        self.rewrite(&doomed, &[])?;
        info!("Deleted {} entries from {}", doomed.len(), self.path.display());
        Ok(())
    }

    fn rewrite(&mut self, dropped: &HashSet<EntryId>, new_entries: &[DiskEntry]) -> Result<()> {
        let new_root = new_entries.iter().find(|e| e.entry_id == ROOT_ID);

        let mut hash_codes: Vec<u32> = self
            .index
            .iter()
            .filter(|(id, _)| !dropped.contains(*id))
            .map(|(_, loc)| loc.hash_code)
            .collect();
        hash_codes.extend(new_entries.iter().map(DiskEntry::hash_code));
        let mut header = self.header;
        header.crc = integrity::disk_crc(hash_codes);

        let footer = self.file.read_to_end_from(self.footer_position)?;
        let mut txn = RewriteTxn::begin(&self.path)?;
        txn.write_all(&header.to_bytes())?;

        let mut index = HashMap::with_capacity(self.index.len() + new_entries.len());
        if dropped.is_empty() && new_root.is_none() {
            // nothing moves: copy all existing entries in one block
            txn.copy_range(
                &mut self.file,
                DISK_HEADER_SIZE,
                self.footer_position - DISK_HEADER_SIZE,
            )?;
            index.clone_from(&self.index);
        } else {
            let mut survivors: Vec<(EntryId, EntryLocation)> = self
                .index
                .iter()
                .filter(|(id, _)| !dropped.contains(*id))
                .map(|(id, loc)| (*id, *loc))
                .collect();
            survivors.sort_by_key(|(id, loc)| (*id != ROOT_ID, loc.offset));

            if let Some(root) = new_root {
                index.insert(ROOT_ID, Self::write_entry(&mut txn, root)?);
            }
            for (id, loc) in survivors {
                let offset = txn.position();
                txn.copy_range(&mut self.file, loc.offset, loc.size)?;
                index.insert(id, EntryLocation { offset, ..loc });
            }
        }

        for entry in new_entries.iter().filter(|e| e.entry_id != ROOT_ID) {
            index.insert(entry.entry_id, Self::write_entry(&mut txn, entry)?);
        }

        let footer_position = txn.position();
        txn.write_all(&footer)?;
        txn.commit()?;

        self.file = DiskFile::open(&self.path)?;
        self.index = index;
        self.footer_position = footer_position;
        self.header = header;
        Ok(())
    }

    fn write_entry(txn: &mut RewriteTxn, entry: &DiskEntry) -> Result<EntryLocation> {
        let offset = txn.position();
        entry.write_to(txn)?;
        Ok(EntryLocation {
            offset,
            size: entry.entry_size(),
            hash_code: entry.hash_code(),
        })
    }

    /// Write `bytes` at `path`, creating missing directories on the way
    ///
    /// The new subtree and the updated ancestor are committed in a single
    /// [`append_entries`](Self::append_entries) call.
    pub fn create_new_file(
        &mut self,
        path: &str,
        bytes: ByteArray64,
        overwrite: bool,
        charset: Charset,
    ) -> Result<EntryId> {
        self.check_writable()?;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, dirs)) = segments.split_last() else {
            return Err(TevdError::InvalidOperation(format!(
                "'{}' does not name a file",
                path
            )));
        };

        let mut ancestor = self
            .request_file(ROOT_ID)?
            .ok_or(TevdError::EntryNotFound(ROOT_ID))?;
        let mut depth = 0;
        for segment in dirs {
            let Some(child) = self.child_named(&ancestor, segment, charset)? else {
                break;
            };
            let entry = self
                .request_file(child)?
                .ok_or(TevdError::EntryNotFound(child))?;
            if !entry.is_directory() {
                return Err(TevdError::NotADirectory(child));
            }
            ancestor = entry;
            depth += 1;
        }

        if depth == dirs.len() {
            if let Some(existing) = self.child_named(&ancestor, leaf, charset)? {
                if !overwrite {
                    return Err(TevdError::AlreadyExists(path.to_string()));
                }
                let mut entry = self
                    .request_file(existing)?
                    .ok_or(TevdError::EntryNotFound(existing))?;
                if !entry.is_file() {
                    return Err(TevdError::NotAFile(existing));
                }
                entry.contents = EntryContent::File(bytes);
                entry.touch();
                self.append_entries(&[entry])?;
                return Ok(existing);
            }
        }

        let missing = &segments[depth..];
        let mut ids: Vec<EntryId> = Vec::with_capacity(missing.len());
        for _ in missing {
            let id = generate_unique_id(|id| self.index.contains_key(&id) || ids.contains(&id));
            ids.push(id);
        }

        // build bottom-up so each directory can list its single child
        let mut batch = Vec::with_capacity(missing.len() + 1);
        let mut child: Option<EntryId> = None;
        for (i, name) in missing.iter().enumerate().rev() {
            let parent = if i == 0 { ancestor.entry_id } else { ids[i - 1] };
            let contents = match child {
                None => EntryContent::File(bytes.clone()),
                Some(c) => EntryContent::Directory(vec![c]),
            };
            batch.push(DiskEntry::named(ids[i], parent, name, charset, contents)?);
            child = Some(ids[i]);
        }

        ancestor.add_child(ids[0])?;
        ancestor.touch();
        batch.push(ancestor);
        self.append_entries(&batch)?;

        let file_id = ids[ids.len() - 1];
        debug!("Created {} as entry {}", path, file_id);
        Ok(file_id)
    }

    /// Rename the disk by rewriting the header in place
    pub fn set_disk_name(&mut self, name: &str, charset: Charset) -> Result<()> {
        self.check_writable()?;
        let mut header = self.header;
        header.disk_name = charset.encode_fixed(name)?;
        write_header_in_place(&self.path, &header)?;
        self.header = header;
        Ok(())
    }

    /// Toggle write protection; allowed on protected disks
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        let mut header = self.header;
        header.set_read_only(read_only);
        write_header_in_place(&self.path, &header)?;
        self.header = header;
        Ok(())
    }

    /// Load the whole image as a [`VirtualDisk`]
    pub fn read_full_disk(&mut self) -> Result<VirtualDisk> {
        let bytes = ByteArray64::from_file(&self.path)?;
        VirtualDisk::deserialize(&bytes, self.crc_level, &mut *self.on_warn)
    }
}
