//! Garbage collection of unreachable entries
//!
//! Two kinds of damage are repaired: orphans (entries their parent does
//! not list, or whose parent is gone) and phantom babies (child ids listed
//! by a directory that have no entry). Removing phantoms or orphans can
//! expose new orphans, so [`VirtualDisk::gc_dump_all`] runs to a fixpoint.

use super::VirtualDisk;
use crate::entry::{EntryId, ROOT_ID};
use tracing::debug;

/// What a collection pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub orphans_removed: Vec<EntryId>,
    /// (directory, missing child) pairs that were unlisted
    pub phantoms_removed: Vec<(EntryId, EntryId)>,
}

impl GcReport {
    pub fn is_clean(&self) -> bool {
        self.orphans_removed.is_empty() && self.phantoms_removed.is_empty()
    }
}

impl VirtualDisk {
    /// Non-root entries not reachable through their parent's child list
    pub fn gc_search_orphan(&self) -> Vec<EntryId> {
        let mut orphans: Vec<EntryId> = self
            .entries
            .values()
            .filter(|entry| entry.entry_id != ROOT_ID)
            .filter(|entry| {
                self.entries
                    .get(&entry.parent_entry_id)
                    .and_then(|parent| parent.children())
                    .map_or(true, |children| !children.contains(&entry.entry_id))
            })
            .map(|entry| entry.entry_id)
            .collect();
        orphans.sort_unstable();
        orphans
    }

    /// Child ids listed by a directory with no entry behind them
    pub fn gc_search_phantom_baby(&self) -> Vec<(EntryId, EntryId)> {
        let mut phantoms = Vec::new();
        for entry in self.entries.values() {
            if let Some(children) = entry.children() {
                for &child in children {
                    if !self.entries.contains_key(&child) {
                        phantoms.push((entry.entry_id, child));
                    }
                }
            }
        }
        phantoms.sort_unstable();
        phantoms
    }

    pub fn gc_dump_phantoms(&mut self) -> Vec<(EntryId, EntryId)> {
        let phantoms = self.gc_search_phantom_baby();
        for &(dir, child) in &phantoms {
            if let Some(entry) = self.entries.get_mut(&dir) {
                entry.remove_child(child);
            }
        }
        phantoms
    }

    /// Remove orphans until none are left
    pub fn gc_dump_orphans(&mut self) -> Vec<EntryId> {
        let mut removed = Vec::new();
        loop {
            let orphans = self.gc_search_orphan();
            if orphans.is_empty() {
                break;
            }
            for id in orphans {
                self.entries.remove(&id);
                removed.push(id);
            }
        }
        removed
    }

    pub fn gc_dump_all(&mut self) -> GcReport {
        let mut report = GcReport::default();
        loop {
            let phantoms = self.gc_dump_phantoms();
            let orphans = self.gc_dump_orphans();
            if phantoms.is_empty() && orphans.is_empty() {
                break;
            }
            report.phantoms_removed.extend(phantoms);
            report.orphans_removed.extend(orphans);
        }
        if !report.is_clean() {
            debug!(
                "GC removed {} orphans and {} phantom links",
                report.orphans_removed.len(),
                report.phantoms_removed.len()
            );
        }
        report
    }
}
