//! Version chains: original block → versions, newest first.

use relog_types::{BlockNumber, CommitSeq, EntryId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionChain {
    /// Every live version of the block, newest first.
    pub entries: Vec<EntryId>,
    /// The single valid version, if any.
    pub valid: Option<EntryId>,
    /// Commit sequence of the newest version that became valid.
    pub committed_seq: CommitSeq,
    /// Highest commit sequence any version of the block has reserved.
    pub reserved_seq: CommitSeq,
}

impl VersionChain {
    /// A reservation exists that has not yet turned into a valid version.
    #[must_use]
    pub fn is_sealing(&self) -> bool {
        self.reserved_seq > self.committed_seq
    }
}

#[derive(Debug, Default)]
pub struct RedirectionIndex {
    chains: BTreeMap<BlockNumber, VersionChain>,
}

impl RedirectionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest valid version of `block`; `None` means fall through to the
    /// base store.
    #[must_use]
    pub fn resolve(&self, block: BlockNumber) -> Option<EntryId> {
        self.chains.get(&block).and_then(|chain| chain.valid)
    }

    #[must_use]
    pub fn chain(&self, block: BlockNumber) -> Option<&VersionChain> {
        self.chains.get(&block)
    }

    pub fn chain_mut(&mut self, block: BlockNumber) -> &mut VersionChain {
        self.chains.entry(block).or_default()
    }

    #[must_use]
    pub fn committed_seq(&self, block: BlockNumber) -> CommitSeq {
        self.chains
            .get(&block)
            .map_or(CommitSeq(0), |chain| chain.committed_seq)
    }

    /// Chain `id` ahead of every existing version of `block`.
    pub fn push_newest(&mut self, block: BlockNumber, id: EntryId) {
        self.chain_mut(block).entries.insert(0, id);
    }

    /// Make `id` the valid version, returning the version it supersedes.
    pub fn promote(&mut self, block: BlockNumber, id: EntryId, seq: CommitSeq) -> Option<EntryId> {
        let chain = self.chain_mut(block);
        let previous = chain.valid.replace(id).filter(|prev| *prev != id);
        chain.committed_seq = chain.committed_seq.max(seq);
        chain.reserved_seq = chain.reserved_seq.max(seq);
        previous
    }

    /// Unlink `id` from its chain. The chain itself is dropped once it
    /// holds no versions; its sequence watermarks go with it.
    pub fn unlink(&mut self, block: BlockNumber, id: EntryId) {
        let Some(chain) = self.chains.get_mut(&block) else {
            return;
        };
        chain.entries.retain(|other| *other != id);
        if chain.valid == Some(id) {
            chain.valid = None;
        }
        if chain.entries.is_empty() && !chain.is_sealing() {
            self.chains.remove(&block);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.chains.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_keeps_one_valid_version() {
        let mut index = RedirectionIndex::new();
        let block = BlockNumber(42);
        index.push_newest(block, EntryId(1));
        assert_eq!(index.resolve(block), None);
        assert_eq!(index.promote(block, EntryId(1), CommitSeq(4)), None);
        index.push_newest(block, EntryId(2));
        assert_eq!(index.promote(block, EntryId(2), CommitSeq(9)), Some(EntryId(1)));
        assert_eq!(index.resolve(block), Some(EntryId(2)));
        assert_eq!(index.committed_seq(block), CommitSeq(9));
        assert_eq!(
            index.chain(block).expect("chain").entries,
            vec![EntryId(2), EntryId(1)]
        );
    }

    #[test]
    fn unlink_falls_through_and_drops_empty_chains() {
        let mut index = RedirectionIndex::new();
        let block = BlockNumber(3);
        index.push_newest(block, EntryId(1));
        index.promote(block, EntryId(1), CommitSeq(1));
        index.unlink(block, EntryId(1));
        assert_eq!(index.resolve(block), None);
        assert!(index.is_empty());
    }

    #[test]
    fn sealing_chain_survives_unlink() {
        let mut index = RedirectionIndex::new();
        let block = BlockNumber(3);
        index.push_newest(block, EntryId(1));
        index.chain_mut(block).reserved_seq = CommitSeq(5);
        index.unlink(block, EntryId(1));
        assert!(index.chain(block).expect("kept").is_sealing());
    }
}
