//! Owning registry of redirection entries.
//!
//! Entries are referenced from several orderings at once (session order,
//! dirty order, segment membership, gc eligibility, active set). Only the
//! arena owns them; every other structure stores [`EntryId`]s, so removing
//! an entry from all orderings is a single auditable step in the tree.

use relog_types::{
    BlockNumber, CommitSeq, EntryId, InodeNumber, LogId, SubBlockMask, TaggedBlock, Tick,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One version of one original block, living in one log slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectionEntry {
    pub id: EntryId,
    pub inode: InodeNumber,
    pub original_block: BlockNumber,
    pub target: TaggedBlock,
    pub log_id: LogId,
    /// Committed data not yet written back to the base store.
    pub dirty: bool,
    /// Newest committed version of its block.
    pub valid: bool,
    /// A newer version became valid, or this version lost a conflict.
    pub superseded: bool,
    pub commit_time: Option<Tick>,
    pub commit_seq: Option<CommitSeq>,
    /// CRC32C of the slot image, stamped when the entry becomes valid.
    pub checksum: u32,
    /// Created while an overlapping version of the block was in flight.
    pub conflict_flag: bool,
    /// A StagingEntry for this version is still live.
    pub staged: bool,
    /// Committed sequence of the block when this version was created.
    pub base_seq: CommitSeq,
    /// When the entry entered the gc-eligible ordering.
    pub eligible_since: Option<Tick>,
    pub mask: SubBlockMask,
}

#[derive(Debug, Default)]
pub struct EntryArena {
    entries: BTreeMap<EntryId, RedirectionEntry>,
    next_id: u64,
}

impl EntryArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry built around a freshly issued id.
    pub fn insert_with(&mut self, build: impl FnOnce(EntryId) -> RedirectionEntry) -> EntryId {
        self.next_id += 1;
        let id = EntryId(self.next_id);
        self.entries.insert(id, build(id));
        id
    }

    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&RedirectionEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut RedirectionEntry> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: EntryId) -> Option<RedirectionEntry> {
        self.entries.remove(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RedirectionEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: EntryId) -> RedirectionEntry {
        RedirectionEntry {
            id,
            inode: InodeNumber(1),
            original_block: BlockNumber(5),
            target: TaggedBlock(0),
            log_id: LogId(0),
            dirty: false,
            valid: false,
            superseded: false,
            commit_time: None,
            commit_seq: None,
            checksum: 0,
            conflict_flag: false,
            staged: true,
            base_seq: CommitSeq(0),
            eligible_since: None,
            mask: SubBlockMask::EMPTY,
        }
    }

    #[test]
    fn ids_are_never_reused() {
        let mut arena = EntryArena::new();
        let a = arena.insert_with(entry);
        let b = arena.insert_with(entry);
        assert_ne!(a, b);
        assert_eq!(arena.get(a).map(|e| e.id), Some(a));
        arena.remove(b).expect("present");
        let c = arena.insert_with(entry);
        assert!(c > b);
        assert_eq!(arena.len(), 2);
    }
}
