//! Path <-> id lookup table for a skimmed disk
//!
//! The index is not kept in sync automatically. Every structural change
//! made through a [`DiskSkimmer`] must be followed by [`DirectoryIndex::add`]
//! or [`DirectoryIndex::remove`], or by a full [`DirectoryIndex::rebuild`].

use crate::charset::Charset;
use crate::entry::{EntryId, EntryType, ROOT_ID};
use crate::error::Result;
use crate::skimmer::DiskSkimmer;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Canonical form: leading slash, no empty segments, no trailing slash
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryIndex {
    by_path: HashMap<String, EntryId>,
    by_id: HashMap<EntryId, String>,
}

impl DirectoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(skimmer: &mut DiskSkimmer, charset: Charset) -> Result<Self> {
        let mut index = Self::new();
        index.rebuild(skimmer, charset)?;
        Ok(index)
    }

    /// Depth-first walk from the root, reading directory bodies only
    pub fn rebuild(&mut self, skimmer: &mut DiskSkimmer, charset: Charset) -> Result<()> {
        self.by_path.clear();
        self.by_id.clear();

        let mut visited = HashSet::new();
        let mut stack = vec![(ROOT_ID, "/".to_string())];
        while let Some((id, path)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(header) = skimmer.request_header(id)? else {
                continue;
            };
            if header.entry_type == EntryType::Directory {
                if let Some(dir) = skimmer.request_file(id)? {
                    for &child in dir.children().unwrap_or_default() {
                        if let Some(child_header) = skimmer.request_header(child)? {
                            let name = charset.decode(&child_header.filename);
                            stack.push((child, join(&path, &name)));
                        }
                    }
                }
            }
            self.by_id.insert(id, path.clone());
            self.by_path.insert(path, id);
        }

        debug!("Rebuilt directory index with {} paths", self.by_path.len());
        Ok(())
    }

    pub fn find(&self, path: &str) -> Option<EntryId> {
        self.by_path.get(&normalize_path(path)).copied()
    }

    pub fn to_full_path(&self, id: EntryId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Record `path -> id`, replacing any previous path of `id`
    pub fn add(&mut self, path: &str, id: EntryId) {
        let path = normalize_path(path);
        if let Some(old) = self.by_id.insert(id, path.clone()) {
            self.by_path.remove(&old);
        }
        if let Some(previous) = self.by_path.insert(path, id) {
            if previous != id {
                self.by_id.remove(&previous);
            }
        }
    }

    /// Forget `id` and every path below it
    pub fn remove(&mut self, id: EntryId) -> Option<String> {
        let path = self.by_id.remove(&id)?;
        self.by_path.remove(&path);

        let prefix = join(&path, "");
        let nested: Vec<String> = self
            .by_path
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in nested {
            if let Some(child) = self.by_path.remove(&p) {
                self.by_id.remove(&child);
            }
        }
        Some(path)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, EntryId)> {
        self.by_path.iter().map(|(p, id)| (p.as_str(), *id))
    }
}
