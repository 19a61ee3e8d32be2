//! In-flight versions and their block images.

use parking_lot::Mutex;
use relog_error::{RelogError, Result};
use relog_types::{BlockNumber, CommitSeq, EntryId, SessionId, SubBlockMask, TaggedBlock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// In-memory copy of a version's slot image, plus what each contributing
/// session overwrote so a shared version can be rolled back per session.
#[derive(Debug, Clone)]
pub struct BlockImage {
    bytes: Vec<u8>,
    undo: BTreeMap<SessionId, Vec<u8>>,
}

impl BlockImage {
    #[must_use]
    pub fn new(seed: Vec<u8>) -> Self {
        Self {
            bytes: seed,
            undo: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Overwrite `data.len()` bytes at `offset` on behalf of `session`.
    /// The first patch by a session captures the pre-image.
    pub fn patch(&mut self, session: SessionId, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                RelogError::InvalidArgument(format!(
                    "patch of {} bytes at {offset} overruns a {}-byte block",
                    data.len(),
                    self.bytes.len()
                ))
            })?;
        if !self.undo.contains_key(&session) {
            self.undo.insert(session, self.bytes.clone());
        }
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Put back the granules of `mask` from `session`'s pre-image.
    ///
    /// Contributors of one version own disjoint granules, so restoring a
    /// session's granules never clobbers another contributor's bytes.
    /// Returns whether any other session still has patches in the image.
    pub fn restore(&mut self, session: SessionId, mask: SubBlockMask) -> bool {
        if let Some(before) = self.undo.remove(&session) {
            let granule = self.bytes.len() / 64;
            for bit in mask.bits() {
                let start = bit as usize * granule;
                let end = start + granule;
                self.bytes[start..end].copy_from_slice(&before[start..end]);
            }
        }
        !self.undo.is_empty()
    }

    /// Drop the undo capture of a session whose contribution committed.
    pub fn forget(&mut self, session: SessionId) {
        self.undo.remove(&session);
    }

    #[must_use]
    pub fn checksum(&self) -> u32 {
        crc32c::crc32c(&self.bytes)
    }
}

/// One session's share of an in-flight version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contribution {
    pub mask: SubBlockMask,
    /// Highest byte (exclusive, inode-relative) the session wrote here.
    pub end: u64,
    pub committed: bool,
}

/// A version that has slot space but is not yet valid.
#[derive(Debug)]
pub struct StagingEntry {
    pub original_block: BlockNumber,
    pub target: TaggedBlock,
    pub owning_entry: EntryId,
    /// OR of every contribution's mask.
    pub dirty_bitmap: SubBlockMask,
    pub contributors: BTreeMap<SessionId, Contribution>,
    /// Another version of the block reserved a commit sequence first.
    pub doomed: bool,
    /// Commit sequence reserved by the first contributor to commit.
    pub reserved: Option<CommitSeq>,
    pub image: Arc<Mutex<BlockImage>>,
}

impl StagingEntry {
    #[must_use]
    pub fn new(
        original_block: BlockNumber,
        target: TaggedBlock,
        owning_entry: EntryId,
        seed: Vec<u8>,
    ) -> Self {
        Self {
            original_block,
            target,
            owning_entry,
            dirty_bitmap: SubBlockMask::EMPTY,
            contributors: BTreeMap::new(),
            doomed: false,
            reserved: None,
            image: Arc::new(Mutex::new(BlockImage::new(seed))),
        }
    }

    /// Union of every contributor's mask except `session`'s.
    #[must_use]
    pub fn others_mask(&self, session: SessionId) -> SubBlockMask {
        self.contributors
            .iter()
            .filter(|(id, _)| **id != session)
            .fold(SubBlockMask::EMPTY, |acc, (_, c)| acc.union(c.mask))
    }

    /// Whether `session` may add `mask` to this version.
    #[must_use]
    pub fn admits(&self, session: SessionId, mask: SubBlockMask) -> bool {
        if self.doomed || mask.intersects(self.others_mask(session)) {
            return false;
        }
        // A committed share is closed; a sealing version still takes disjoint
        // bytes from newcomers and pending contributors, and seals once they
        // commit too.
        self.contributors
            .get(&session)
            .is_none_or(|c| !c.committed)
    }

    pub fn contribute(&mut self, session: SessionId, mask: SubBlockMask, end: u64) {
        let slot = self.contributors.entry(session).or_insert(Contribution {
            mask: SubBlockMask::EMPTY,
            end: 0,
            committed: false,
        });
        slot.mask = slot.mask.union(mask);
        slot.end = slot.end.max(end);
        self.dirty_bitmap = self.dirty_bitmap.union(mask);
    }

    #[must_use]
    pub fn is_pending(&self, session: SessionId) -> bool {
        self.contributors.get(&session).is_some_and(|c| !c.committed)
    }

    #[must_use]
    pub fn all_committed(&self) -> bool {
        !self.contributors.is_empty() && self.contributors.values().all(|c| c.committed)
    }

    #[must_use]
    pub fn any_committed(&self) -> bool {
        self.contributors.values().any(|c| c.committed)
    }

    fn recompute_bitmap(&mut self) {
        self.dirty_bitmap = self
            .contributors
            .values()
            .fold(SubBlockMask::EMPTY, |acc, c| acc.union(c.mask));
    }

    /// Remove `session`'s contribution, returning it.
    pub fn withdraw(&mut self, session: SessionId) -> Option<Contribution> {
        let removed = self.contributors.remove(&session);
        self.recompute_bitmap();
        removed
    }
}

/// In-flight versions of an inode, keyed by owning entry.
#[derive(Debug, Default)]
pub struct StagingTable {
    entries: BTreeMap<EntryId, StagingEntry>,
    by_block: BTreeMap<BlockNumber, Vec<EntryId>>,
}

impl StagingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: StagingEntry) {
        self.by_block
            .entry(entry.original_block)
            .or_default()
            .push(entry.owning_entry);
        self.entries.insert(entry.owning_entry, entry);
    }

    pub fn remove(&mut self, id: EntryId) -> Option<StagingEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(ids) = self.by_block.get_mut(&entry.original_block) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_block.remove(&entry.original_block);
            }
        }
        Some(entry)
    }

    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&StagingEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut StagingEntry> {
        self.entries.get_mut(&id)
    }

    /// In-flight versions of `block`, oldest first.
    #[must_use]
    pub fn for_block(&self, block: BlockNumber) -> Vec<EntryId> {
        self.by_block.get(&block).cloned().unwrap_or_default()
    }

    /// The in-flight version of `block` that `session` has a pending
    /// contribution in.
    #[must_use]
    pub fn pending_for(&self, block: BlockNumber, session: SessionId) -> Option<EntryId> {
        self.by_block.get(&block)?.iter().copied().find(|id| {
            self.entries
                .get(id)
                .is_some_and(|entry| entry.is_pending(session))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relog_types::LogId;

    fn staging(id: u64, block: u64) -> StagingEntry {
        StagingEntry::new(
            BlockNumber(block),
            TaggedBlock::new(LogId(0), id).expect("tag"),
            EntryId(id),
            vec![0; 64],
        )
    }

    #[test]
    fn image_restore_only_touches_session_granules() {
        let mut image = BlockImage::new(vec![0; 64]);
        let a = SessionId(1);
        let b = SessionId(2);
        image.patch(a, 0, &[b'A'; 32]).expect("a");
        image.patch(b, 32, &[b'B'; 32]).expect("b");
        let shared = image.restore(a, SubBlockMask((1 << 32) - 1));
        assert!(shared);
        assert_eq!(&image.bytes()[..32], &[0; 32]);
        assert_eq!(&image.bytes()[32..], &[b'B'; 32]);
        assert!(!image.restore(b, SubBlockMask(!((1 << 32) - 1))));
        assert_eq!(image.bytes(), &[0; 64]);
    }

    #[test]
    fn image_patch_bounds() {
        let mut image = BlockImage::new(vec![0; 64]);
        assert!(image.patch(SessionId(1), 60, &[1; 8]).is_err());
        assert!(image.patch(SessionId(1), usize::MAX, &[1]).is_err());
    }

    #[test]
    fn admits_respects_other_contributors_and_closed_shares() {
        let mut entry = staging(1, 7);
        let a = SessionId(1);
        let b = SessionId(2);
        entry.contribute(a, SubBlockMask(0b0011), 2);
        assert!(entry.admits(b, SubBlockMask(0b1100)));
        assert!(!entry.admits(b, SubBlockMask(0b0110)));
        assert!(entry.admits(a, SubBlockMask(0b0110)), "own bits never conflict");

        entry.reserved = Some(CommitSeq(3));
        entry.contributors.get_mut(&a).expect("a").committed = true;
        assert!(entry.admits(b, SubBlockMask(0b1100)), "disjoint newcomer joins");
        assert!(!entry.admits(b, SubBlockMask(0b0110)), "still checked against committed bits");
        assert!(!entry.admits(a, SubBlockMask(0b1000)), "committed share is closed");

        entry.reserved = None;
        entry.doomed = true;
        assert!(!entry.admits(b, SubBlockMask(0b1100)));
    }

    #[test]
    fn withdraw_recomputes_bitmap() {
        let mut entry = staging(1, 7);
        entry.contribute(SessionId(1), SubBlockMask(0b01), 1);
        entry.contribute(SessionId(2), SubBlockMask(0b10), 2);
        assert_eq!(entry.dirty_bitmap, SubBlockMask(0b11));
        entry.withdraw(SessionId(1));
        assert_eq!(entry.dirty_bitmap, SubBlockMask(0b10));
        assert!(!entry.any_committed());
    }

    #[test]
    fn table_indexes_by_block() {
        let mut table = StagingTable::new();
        table.insert(staging(1, 7));
        table.insert(staging(2, 7));
        table.insert(staging(3, 9));
        table
            .get_mut(EntryId(2))
            .expect("two")
            .contribute(SessionId(5), SubBlockMask(1), 1);
        assert_eq!(table.for_block(BlockNumber(7)), vec![EntryId(1), EntryId(2)]);
        assert_eq!(table.pending_for(BlockNumber(7), SessionId(5)), Some(EntryId(2)));
        table.remove(EntryId(1)).expect("one");
        table.remove(EntryId(2)).expect("two");
        assert!(table.for_block(BlockNumber(7)).is_empty());
        assert_eq!(table.len(), 1);
    }
}
