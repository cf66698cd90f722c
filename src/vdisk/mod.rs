//! Full disk object model
//!
//! [`VirtualDisk`] holds every entry of an image in memory, keyed by id.
//! Entries reference each other only by id (parent field, directory child
//! lists), so an image can be re-serialized or merged without fixing up
//! pointers. Preconditions (read-only, capacity, linkage) are checked
//! before anything is mutated; a failed call leaves the disk unchanged.

mod gc;
#[cfg(test)]
mod tests;

pub use gc::GcReport;

use crate::buffer::ByteArray64;
use crate::charset::Charset;
use crate::entry::{
    generate_unique_id, DiskEntry, EntryContent, EntryId, CHILD_ID_SIZE, MAX_DIRECTORY_CHILDREN,
    ROOT_ID,
};
use crate::error::{Result, TevdError};
use crate::header::{DiskHeader, DISK_HEADER_SIZE, DISK_NAME_LENGTH, FOOTER, FOOTER_MARKER};
use crate::integrity::{self, ChecksumMismatch, ChecksumScope, CrcLevel};
use crate::io::RewriteTxn;
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// An entire disk image held in memory
#[derive(Debug, Clone)]
pub struct VirtualDisk {
    header: DiskHeader,
    entries: HashMap<EntryId, DiskEntry>,
}

impl VirtualDisk {
    /// Create an empty disk holding only the root directory
    pub fn new(capacity: u64, disk_name: &str, charset: Charset) -> Result<Self> {
        let name: [u8; DISK_NAME_LENGTH] = charset.encode_fixed(disk_name)?;
        let mut entries = HashMap::new();
        entries.insert(ROOT_ID, DiskEntry::root());

        info!("Created virtual disk '{}' ({} bytes)", disk_name, capacity);
        Ok(VirtualDisk {
            header: DiskHeader::new(capacity, name),
            entries,
        })
    }

    /// Header as it would be written now, CRC included
    pub fn header(&self) -> DiskHeader {
        let mut header = self.header;
        header.crc = self.disk_crc();
        header
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    pub fn disk_name(&self, charset: Charset) -> String {
        self.header.name(charset)
    }

    pub fn rename_disk(&mut self, name: &str, charset: Charset) -> Result<()> {
        self.header.disk_name = charset.encode_fixed(name)?;
        Ok(())
    }

    pub fn extra_attributes(&self) -> &[u8; 16] {
        &self.header.extra_attributes
    }

    pub fn set_extra_attributes(&mut self, extra: [u8; 16]) {
        self.header.extra_attributes = extra;
    }

    pub fn is_read_only(&self) -> bool {
        self.header.is_read_only()
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.header.set_read_only(read_only);
    }

    /// Disk header plus the size of every entry, root included
    pub fn used_bytes(&self) -> u64 {
        DISK_HEADER_SIZE + self.entries.values().map(DiskEntry::entry_size).sum::<u64>()
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity().saturating_sub(self.used_bytes())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn entry(&self, id: EntryId) -> Option<&DiskEntry> {
        self.entries.get(&id)
    }

    pub fn root(&self) -> Option<&DiskEntry> {
        self.entries.get(&ROOT_ID)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DiskEntry> {
        self.entries.values()
    }

    pub fn disk_crc(&self) -> u32 {
        integrity::disk_crc(self.entries.values().map(DiskEntry::hash_code))
    }

    /// Resolve a slash-separated path from the root
    pub fn find(&self, path: &str, charset: Charset) -> Option<&DiskEntry> {
        let mut current = self.entry(ROOT_ID)?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let children = current.children()?;
            current = children
                .iter()
                .filter_map(|id| self.entry(*id))
                .find(|child| child.filename(charset) == segment)?;
        }
        Some(current)
    }

    /// Absolute path of an entry, walking up through parents
    pub fn path_of(&self, id: EntryId, charset: Charset) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = self.entry(id)?;
        let mut steps = 0;
        while current.entry_id != ROOT_ID {
            segments.push(current.filename(charset));
            current = self.entry(current.parent_entry_id)?;
            steps += 1;
            if steps > self.entries.len() {
                return None;
            }
        }
        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }

    pub fn list_dir(&self, id: EntryId) -> Result<Vec<&DiskEntry>> {
        let dir = self.entry(id).ok_or(TevdError::EntryNotFound(id))?;
        let children = dir.children().ok_or(TevdError::NotADirectory(id))?;
        Ok(children.iter().filter_map(|c| self.entry(*c)).collect())
    }

    fn child_named(&self, parent: &DiskEntry, name: &str, charset: Charset) -> Option<EntryId> {
        parent
            .children()?
            .iter()
            .filter_map(|id| self.entry(*id))
            .find(|child| child.filename(charset) == name)
            .map(|child| child.entry_id)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TevdError::ReadOnly);
        }
        Ok(())
    }

    fn check_capacity(&self, extra: u64) -> Result<()> {
        let used = self.used_bytes();
        if used + extra > self.capacity() {
            return Err(TevdError::CapacityExceeded {
                needed: extra,
                available: self.capacity().saturating_sub(used),
            });
        }
        Ok(())
    }

    fn add_entry(
        &mut self,
        parent: EntryId,
        name: &str,
        contents: EntryContent,
        charset: Charset,
    ) -> Result<EntryId> {
        self.check_writable()?;
        let filename = charset.encode_fixed(name)?;

        let parent_entry = self.entry(parent).ok_or(TevdError::EntryNotFound(parent))?;
        let siblings = parent_entry
            .children()
            .ok_or(TevdError::NotADirectory(parent))?;
        if siblings.len() >= MAX_DIRECTORY_CHILDREN {
            return Err(TevdError::DirectoryFull(parent));
        }
        if self.child_named(parent_entry, name, charset).is_some() {
            return Err(TevdError::AlreadyExists(name.to_string()));
        }

        let id = generate_unique_id(|id| self.entries.contains_key(&id));
        let entry = DiskEntry::new(id, parent, filename, contents);
        self.check_capacity(entry.entry_size() + CHILD_ID_SIZE)?;

        if let Some(parent_entry) = self.entries.get_mut(&parent) {
            parent_entry.add_child(id)?;
            parent_entry.touch();
        }
        self.entries.insert(id, entry);
        Ok(id)
    }

    pub fn add_file(
        &mut self,
        parent: EntryId,
        name: &str,
        contents: ByteArray64,
        charset: Charset,
    ) -> Result<EntryId> {
        self.add_entry(parent, name, EntryContent::File(contents), charset)
    }

    pub fn add_dir(&mut self, parent: EntryId, name: &str, charset: Charset) -> Result<EntryId> {
        self.add_entry(parent, name, EntryContent::empty_directory(), charset)
    }

    pub fn add_symlink(
        &mut self,
        parent: EntryId,
        name: &str,
        target: EntryId,
        charset: Charset,
    ) -> Result<EntryId> {
        if !self.contains(target) {
            return Err(TevdError::EntryNotFound(target));
        }
        self.add_entry(parent, name, EntryContent::Symlink(target), charset)
    }

    /// Replace the contents of a file entry
    pub fn write_file(&mut self, id: EntryId, contents: ByteArray64) -> Result<()> {
        self.check_writable()?;
        let entry = self.entry(id).ok_or(TevdError::EntryNotFound(id))?;
        let old_len = entry.file_bytes().ok_or(TevdError::NotAFile(id))?.len();
        if contents.len() > old_len {
            self.check_capacity(contents.len() - old_len)?;
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.contents = EntryContent::File(contents);
            entry.touch();
        }
        Ok(())
    }

    /// Delete an entry; directories are deleted with everything below them
    pub fn delete_file(&mut self, id: EntryId) -> Result<()> {
        if id == ROOT_ID {
            return Err(TevdError::RootDeletion);
        }
        self.check_writable()?;
        let entry = self.entry(id).ok_or(TevdError::EntryNotFound(id))?;
        let parent = entry.parent_entry_id;
        let linked = self
            .entry(parent)
            .and_then(DiskEntry::children)
            .map_or(false, |children| children.contains(&id));
        if !linked {
            return Err(TevdError::NotLinked { id, parent });
        }

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(removed) = self.entries.remove(&current) {
                if let Some(children) = removed.children() {
                    stack.extend(children.iter().copied().filter(|&c| c != ROOT_ID));
                }
            }
        }
        if let Some(parent_entry) = self.entries.get_mut(&parent) {
            parent_entry.remove_child(id);
            parent_entry.touch();
        }

        let report = self.gc_dump_all();
        debug!("Deleted entry {} ({:?})", id, report);
        Ok(())
    }

    pub fn rename_file(&mut self, id: EntryId, new_name: &str, charset: Charset) -> Result<()> {
        self.check_writable()?;
        if id == ROOT_ID {
            return Err(TevdError::InvalidOperation(
                "the root directory has no name".to_string(),
            ));
        }
        let filename = charset.encode_fixed(new_name)?;
        let entry = self.entry(id).ok_or(TevdError::EntryNotFound(id))?;
        if let Some(parent) = self.entry(entry.parent_entry_id) {
            if let Some(existing) = self.child_named(parent, new_name, charset) {
                if existing != id {
                    return Err(TevdError::AlreadyExists(new_name.to_string()));
                }
            }
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.filename = filename;
            entry.touch();
        }
        Ok(())
    }

    /// Relink an entry under another directory of the same disk
    pub fn move_entry(&mut self, id: EntryId, new_parent: EntryId, charset: Charset) -> Result<()> {
        self.check_writable()?;
        if id == ROOT_ID {
            return Err(TevdError::RootDeletion);
        }
        let entry = self.entry(id).ok_or(TevdError::EntryNotFound(id))?;
        let old_parent = entry.parent_entry_id;
        let name = entry.filename(charset);
        let target = self
            .entry(new_parent)
            .ok_or(TevdError::EntryNotFound(new_parent))?;
        let siblings = target.children().ok_or(TevdError::NotADirectory(new_parent))?;
        if siblings.len() >= MAX_DIRECTORY_CHILDREN {
            return Err(TevdError::DirectoryFull(new_parent));
        }
        if self.child_named(target, &name, charset).is_some() {
            return Err(TevdError::AlreadyExists(name));
        }
        // refuse to move a directory below itself
        let mut cursor = new_parent;
        while cursor != ROOT_ID {
            if cursor == id {
                return Err(TevdError::InvalidOperation(format!(
                    "cannot move {} into its own subtree",
                    id
                )));
            }
            cursor = match self.entry(cursor) {
                Some(e) => e.parent_entry_id,
                None => break,
            };
        }

        if let Some(parent) = self.entries.get_mut(&old_parent) {
            parent.remove_child(id);
            parent.touch();
        }
        if let Some(parent) = self.entries.get_mut(&new_parent) {
            parent.add_child(id)?;
            parent.touch();
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.parent_entry_id = new_parent;
        }
        Ok(())
    }

    /// Copy an entry (recursively for directories) from another disk
    ///
    /// Fresh ids are allocated on this disk; timestamps are preserved.
    pub fn import_entry(
        &mut self,
        src: &VirtualDisk,
        src_id: EntryId,
        parent: EntryId,
        charset: Charset,
    ) -> Result<EntryId> {
        let entry = src.entry(src_id).ok_or(TevdError::EntryNotFound(src_id))?;
        let name = entry.filename(charset);

        let new_id = match &entry.contents {
            EntryContent::File(bytes) => self.add_file(parent, &name, bytes.clone(), charset)?,
            EntryContent::Directory(children) => {
                let dir = self.add_dir(parent, &name, charset)?;
                for &child in children {
                    if let Err(e) = self.import_entry(src, child, dir, charset) {
                        if let Err(rollback) = self.delete_file(dir) {
                            tracing::warn!(
                                "Rollback of imported entry {} failed: {}",
                                dir,
                                rollback
                            );
                        }
                        return Err(e);
                    }
                }
                dir
            }
            EntryContent::Symlink(_) => {
                return Err(TevdError::InvalidOperation(
                    "symlinks cannot be copied across disks".to_string(),
                ))
            }
        };

        if let Some(copied) = self.entries.get_mut(&new_id) {
            copied.creation_date = entry.creation_date;
            copied.modification_date = entry.modification_date;
        }
        Ok(new_id)
    }

    /// Move an entry to another disk
    ///
    /// The source is only deleted after the destination write succeeded;
    /// if that delete fails the destination copy is removed again.
    /// Recovery is best-effort, not transactional.
    pub fn move_file(
        src: &mut VirtualDisk,
        id: EntryId,
        dst: &mut VirtualDisk,
        dst_parent: EntryId,
        charset: Charset,
    ) -> Result<EntryId> {
        if id == ROOT_ID {
            return Err(TevdError::RootDeletion);
        }
        src.check_writable()?;

        let new_id = dst.import_entry(src, id, dst_parent, charset)?;
        if let Err(e) = src.delete_file(id) {
            if let Err(rollback) = dst.delete_file(new_id) {
                tracing::warn!("Rollback of moved entry {} failed: {}", new_id, rollback);
            }
            return Err(e);
        }
        Ok(new_id)
    }

    /// Follow a symlink one hop, or until a non-link when `recursive`
    ///
    /// Non-links resolve to themselves.
    pub fn resolve_if_symlink(&self, id: EntryId, recursive: bool) -> Result<&DiskEntry> {
        let mut current = self.entry(id).ok_or(TevdError::EntryNotFound(id))?;
        let mut seen = HashSet::new();
        while let EntryContent::Symlink(target) = current.contents {
            if !seen.insert(current.entry_id) {
                return Err(TevdError::SymlinkLoop(current.entry_id));
            }
            current = self.entry(target).ok_or(TevdError::DanglingSymlink {
                link: current.entry_id,
                target,
            })?;
            if !recursive {
                break;
            }
        }
        Ok(current)
    }

    /// Copy a host file into the disk under `parent`
    pub fn import_file<P: AsRef<Path>>(
        &mut self,
        parent: EntryId,
        host_path: P,
        charset: Charset,
    ) -> Result<EntryId> {
        let host_path = host_path.as_ref();
        let name = host_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TevdError::PathNotFound(host_path.display().to_string()))?;
        let bytes = ByteArray64::from_file(host_path)?;
        self.add_file(parent, &name, bytes, charset)
    }

    /// Write a file entry's contents out to the host
    pub fn export_file<P: AsRef<Path>>(&self, id: EntryId, host_path: P) -> Result<()> {
        let entry = self.resolve_if_symlink(id, true)?;
        let bytes = entry.file_bytes().ok_or(TevdError::NotAFile(id))?;
        bytes.write_to_file(host_path)
    }

    /// Entries in on-disk order: root first, then ascending ids
    fn ordered_entries(&self) -> Vec<&DiskEntry> {
        let mut ordered: Vec<&DiskEntry> = self.entries.values().collect();
        ordered.sort_by_key(|e| (e.entry_id != ROOT_ID, e.entry_id));
        ordered
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.header().to_bytes())?;
        for entry in self.ordered_entries() {
            entry.write_to(w)?;
        }
        w.write_all(&FOOTER)
    }

    pub fn serialize(&self) -> ByteArray64 {
        let mut out = ByteArray64::with_capacity(self.used_bytes() + FOOTER.len() as u64);
        // writing into a ByteArray64 cannot fail
        let _ = self.write_to(&mut out);
        out
    }

    /// Write the image to `path` through the copy-rewrite swap
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut txn = RewriteTxn::begin(path.as_ref())?;
        self.write_to(&mut txn)?;
        txn.commit()?;
        info!(
            "Wrote {} entries ({} bytes) to {}",
            self.entries.len(),
            self.used_bytes(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Parse a whole image, verifying checksums under `level`
    pub fn deserialize(
        bytes: &ByteArray64,
        level: CrcLevel,
        on_warn: &mut dyn FnMut(&ChecksumMismatch),
    ) -> Result<Self> {
        let mut head = [0u8; DISK_HEADER_SIZE as usize];
        if bytes.len() < DISK_HEADER_SIZE {
            return Err(TevdError::Truncated {
                offset: bytes.len(),
                needed: DISK_HEADER_SIZE - bytes.len(),
            });
        }
        bytes.copy_to(0, &mut head)?;
        let header = DiskHeader::from_bytes(&head)?;

        let mut reader = bytes.reader();
        reader.read_exact(&mut head)?;

        let mut entries = HashMap::new();
        let mut hash_codes = Vec::new();
        let mut last_good_offset = DISK_HEADER_SIZE;
        loop {
            let offset = reader.position();
            let mut marker = [0u8; 4];
            if bytes.copy_to(offset, &mut marker).is_err() {
                return Err(TevdError::CorruptEntry {
                    offset,
                    last_good_offset,
                    reason: "missing footer".to_string(),
                });
            }
            if marker == FOOTER_MARKER {
                break;
            }

            let (entry, stored_crc, hash_code) =
                DiskEntry::read_from(&mut reader).map_err(|e| TevdError::CorruptEntry {
                    offset,
                    last_good_offset,
                    reason: e.to_string(),
                })?;
            integrity::verify(
                level,
                ChecksumScope::Entry(entry.entry_id),
                stored_crc,
                entry.contents.body_crc(),
                on_warn,
            )?;
            hash_codes.push(hash_code);
            last_good_offset = offset;
            entries.insert(entry.entry_id, entry);
        }

        integrity::verify(
            level,
            ChecksumScope::Disk,
            header.crc,
            integrity::disk_crc(hash_codes),
            on_warn,
        )?;

        if !entries.contains_key(&ROOT_ID) {
            return Err(TevdError::EntryNotFound(ROOT_ID));
        }

        Ok(VirtualDisk { header, entries })
    }

    /// Load an image file; CRC mismatches at [`CrcLevel::Warn`] are only logged
    pub fn read_from_file<P: AsRef<Path>>(path: P, level: CrcLevel) -> Result<Self> {
        Self::read_from_file_with(path, level, &mut |_| {})
    }

    pub fn read_from_file_with<P: AsRef<Path>>(
        path: P,
        level: CrcLevel,
        on_warn: &mut dyn FnMut(&ChecksumMismatch),
    ) -> Result<Self> {
        let bytes = ByteArray64::from_file(path)?;
        Self::deserialize(&bytes, level, on_warn)
    }
}
