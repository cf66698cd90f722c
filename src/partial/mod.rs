//! Cached, write-behind access to a disk image
//!
//! [`PartialDom`] wraps a [`DiskSkimmer`] and keeps only some entries in
//! memory. Reads go through a bloom-gated cache: an id is only considered
//! for caching the second time it is seen, so one-off scans do not flush
//! useful entries. Writes are collected as pending changes and removals
//! and reach the image on [`PartialDom::commit`].

mod cache;

pub use cache::{CacheStats, FileCache};

use crate::bloom::BloomFilter;
use crate::buffer::ByteArray64;
use crate::charset::Charset;
use crate::config::CacheConfig;
use crate::entry::{
    generate_unique_id, DiskEntry, EntryContent, EntryId, CHILD_ID_SIZE, MAX_DIRECTORY_CHILDREN,
    ROOT_ID,
};
use crate::error::{Result, TevdError};
use crate::index::{normalize_path, DirectoryIndex};
use crate::integrity::CrcLevel;
use crate::skimmer::DiskSkimmer;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

pub struct PartialDom {
    skimmer: DiskSkimmer,
    index: DirectoryIndex,
    bloom: BloomFilter,
    cache: FileCache,
    changed: HashMap<EntryId, DiskEntry>,
    removed: HashSet<EntryId>,
    used_bytes: u64,
    config: CacheConfig,
}

impl PartialDom {
    pub fn open<P: AsRef<Path>>(path: P, config: CacheConfig, charset: Charset) -> Result<Self> {
        Self::open_with(path, config, CrcLevel::default(), charset)
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        config: CacheConfig,
        crc_level: CrcLevel,
        charset: Charset,
    ) -> Result<Self> {
        let skimmer = DiskSkimmer::open_with_level(path, crc_level)?;
        Self::from_skimmer(skimmer, config, charset)
    }

    pub fn from_skimmer(
        mut skimmer: DiskSkimmer,
        config: CacheConfig,
        charset: Charset,
    ) -> Result<Self> {
        config.validate()?;
        let index = DirectoryIndex::build(&mut skimmer, charset)?;
        let used_bytes = skimmer.used_bytes();
        Ok(PartialDom {
            bloom: BloomFilter::new(config.bloom_bits, config.bloom_depth),
            cache: FileCache::new(&config),
            skimmer,
            index,
            changed: HashMap::new(),
            removed: HashSet::new(),
            used_bytes,
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn skimmer(&self) -> &DiskSkimmer {
        &self.skimmer
    }

    pub fn index(&self) -> &DirectoryIndex {
        &self.index
    }

    pub fn capacity(&self) -> u64 {
        self.skimmer.capacity()
    }

    /// Bytes used once pending changes are committed
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn is_read_only(&self) -> bool {
        self.skimmer.is_read_only()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.changed.is_empty() || !self.removed.is_empty()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn largest_cached_body(&self) -> u64 {
        self.cache.largest_body()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Current view of an entry, pending changes included
    pub fn peek_file(&mut self, id: EntryId) -> Result<Option<DiskEntry>> {
        if self.removed.contains(&id) {
            return Ok(None);
        }
        if let Some(entry) = self.changed.get(&id) {
            return Ok(Some(entry.clone()));
        }

        let seen_before = self.bloom.contains(id);
        self.bloom.add(id);
        if let Some(entry) = self.cache.get(id) {
            return Ok(Some(entry));
        }

        let entry = match self.skimmer.request_file(id)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if seen_before && self.cache_file(entry.clone()) {
            debug!("Cached entry {}", id);
        }
        Ok(Some(entry))
    }

    pub fn peek_path(&mut self, path: &str) -> Result<Option<DiskEntry>> {
        match self.index.find(path) {
            Some(id) => self.peek_file(id),
            None => Ok(None),
        }
    }

    /// Offer an entry to the cache; returns whether it was admitted
    pub fn cache_file(&self, entry: DiskEntry) -> bool {
        self.cache.insert(entry)
    }

    pub fn list_dir(&mut self, id: EntryId) -> Result<Vec<DiskEntry>> {
        let dir = self.peek_file(id)?.ok_or(TevdError::EntryNotFound(id))?;
        let children = dir
            .children()
            .ok_or(TevdError::NotADirectory(id))?
            .to_vec();
        let mut listing = Vec::with_capacity(children.len());
        for child in children {
            if let Some(entry) = self.peek_file(child)? {
                listing.push(entry);
            }
        }
        Ok(listing)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TevdError::ReadOnly);
        }
        Ok(())
    }

    fn check_capacity(&self, extra: u64) -> Result<()> {
        if self.used_bytes + extra > self.capacity() {
            return Err(TevdError::CapacityExceeded {
                needed: extra,
                available: self.capacity().saturating_sub(self.used_bytes),
            });
        }
        Ok(())
    }

    fn stage(&mut self, entry: DiskEntry) {
        self.cache.remove(entry.entry_id);
        self.changed.insert(entry.entry_id, entry);
    }

    /// Refresh an entry's modification time
    pub fn touch_file(&mut self, id: EntryId) -> Result<()> {
        self.check_writable()?;
        let mut entry = self.peek_file(id)?.ok_or(TevdError::EntryNotFound(id))?;
        entry.touch();
        self.stage(entry);
        Ok(())
    }

    /// Replace a file's contents
    pub fn write_file(&mut self, id: EntryId, bytes: ByteArray64) -> Result<()> {
        self.check_writable()?;
        let mut entry = self.peek_file(id)?.ok_or(TevdError::EntryNotFound(id))?;
        let old_len = entry.file_bytes().ok_or(TevdError::NotAFile(id))?.len();
        let new_len = bytes.len();
        if new_len > old_len {
            self.check_capacity(new_len - old_len)?;
        }

        entry.contents = EntryContent::File(bytes);
        entry.touch();
        self.stage(entry);
        self.used_bytes = self.used_bytes + new_len - old_len;
        Ok(())
    }

    /// Remove an entry, and everything below it for directories
    pub fn remove_file(&mut self, id: EntryId) -> Result<()> {
        if id == ROOT_ID {
            return Err(TevdError::RootDeletion);
        }
        self.check_writable()?;
        let entry = self.peek_file(id)?.ok_or(TevdError::EntryNotFound(id))?;
        let parent_id = entry.parent_entry_id;
        let mut parent = self
            .peek_file(parent_id)?
            .ok_or(TevdError::EntryNotFound(parent_id))?;
        if !parent.remove_child(id) {
            return Err(TevdError::NotLinked {
                id,
                parent: parent_id,
            });
        }
        parent.touch();
        self.stage(parent);
        self.used_bytes -= CHILD_ID_SIZE;

        let mut stack = vec![entry];
        while let Some(doomed) = stack.pop() {
            if let Some(children) = doomed.children() {
                for &child in children {
                    if let Some(entry) = self.peek_file(child)? {
                        stack.push(entry);
                    }
                }
            }
            let doomed_id = doomed.entry_id;
            self.used_bytes = self.used_bytes.saturating_sub(doomed.entry_size());
            self.changed.remove(&doomed_id);
            self.cache.remove(doomed_id);
            self.index.remove(doomed_id);
            self.removed.insert(doomed_id);
        }
        Ok(())
    }

    fn add_new_entry(
        &mut self,
        path: &str,
        contents: EntryContent,
        charset: Charset,
    ) -> Result<EntryId> {
        self.check_writable()?;
        let path = normalize_path(path);
        if self.index.find(&path).is_some() {
            return Err(TevdError::AlreadyExists(path));
        }
        let (parent_path, name) = match path.rsplit_once('/') {
            Some((parent, name)) if !name.is_empty() => (parent, name),
            _ => {
                return Err(TevdError::InvalidOperation(format!(
                    "'{}' does not name an entry",
                    path
                )))
            }
        };
        let parent_id = self
            .index
            .find(parent_path)
            .ok_or_else(|| TevdError::PathNotFound(normalize_path(parent_path)))?;
        let mut parent = self
            .peek_file(parent_id)?
            .ok_or(TevdError::EntryNotFound(parent_id))?;
        let siblings = parent
            .children()
            .ok_or(TevdError::NotADirectory(parent_id))?;
        if siblings.len() >= MAX_DIRECTORY_CHILDREN {
            return Err(TevdError::DirectoryFull(parent_id));
        }

        let id = generate_unique_id(|id| {
            self.skimmer.contains(id) || self.changed.contains_key(&id) || self.removed.contains(&id)
        });
        let entry = DiskEntry::named(id, parent_id, name, charset, contents)?;
        self.check_capacity(entry.entry_size() + CHILD_ID_SIZE)?;

        parent.add_child(id)?;
        parent.touch();
        self.used_bytes += entry.entry_size() + CHILD_ID_SIZE;
        self.stage(parent);
        self.stage(entry);
        self.index.add(&path, id);
        Ok(id)
    }

    /// Stage a new file; its id and path are reserved immediately
    pub fn add_new_file(
        &mut self,
        path: &str,
        bytes: ByteArray64,
        charset: Charset,
    ) -> Result<EntryId> {
        self.add_new_entry(path, EntryContent::File(bytes), charset)
    }

    pub fn add_new_dir(&mut self, path: &str, charset: Charset) -> Result<EntryId> {
        self.add_new_entry(path, EntryContent::empty_directory(), charset)
    }

    /// Flush pending removals, then pending changes
    pub fn commit(&mut self) -> Result<()> {
        if !self.removed.is_empty() {
            let ids: Vec<EntryId> = self.removed.iter().copied().collect();
            self.skimmer.delete_entries(&ids)?;
            self.removed.clear();
        }
        if !self.changed.is_empty() {
            let entries: Vec<DiskEntry> = self.changed.values().cloned().collect();
            self.skimmer.append_entries(&entries)?;
            self.changed.clear();
        }
        self.used_bytes = self.skimmer.used_bytes();
        Ok(())
    }

    /// Commit, then rebuild the image through the full DOM
    ///
    /// Unreachable entries are collected and the image is rewritten in
    /// canonical order.
    pub fn sync(&mut self, charset: Charset) -> Result<()> {
        self.check_writable()?;
        self.commit()?;
        let mut disk = self.skimmer.read_full_disk()?;
        let report = disk.gc_dump_all();
        disk.write_to_file(self.skimmer.path())?;

        let path = self.skimmer.path().to_path_buf();
        self.skimmer.reload()?;
        self.index.rebuild(&mut self.skimmer, charset)?;
        self.cache.clear();
        self.used_bytes = self.skimmer.used_bytes();
        info!(
            "Synced {} ({} orphans, {} phantom links collected)",
            path.display(),
            report.orphans_removed.len(),
            report.phantoms_removed.len()
        );
        Ok(())
    }
}
