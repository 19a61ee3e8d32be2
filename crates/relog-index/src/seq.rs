use relog_types::CommitSeq;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pool-wide commit sequence source.
///
/// Commit sequences order versions of the same block across every inode
/// and segment, so recovery can tell which descriptor is newest.
#[derive(Debug)]
pub struct SeqAllocator {
    last: AtomicU64,
}

impl SeqAllocator {
    /// Allocator whose first issued value is `last + 1`.
    #[must_use]
    pub fn starting_after(last: CommitSeq) -> Self {
        Self {
            last: AtomicU64::new(last.0),
        }
    }

    pub fn next_value(&self) -> CommitSeq {
        CommitSeq(self.last.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Make sure later values are greater than `seq` (used while replaying).
    pub fn observe(&self, seq: CommitSeq) {
        self.last.fetch_max(seq.0, Ordering::AcqRel);
    }

    #[must_use]
    pub fn current(&self) -> CommitSeq {
        CommitSeq(self.last.load(Ordering::Acquire))
    }
}

impl Default for SeqAllocator {
    fn default() -> Self {
        Self::starting_after(CommitSeq(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_increasing_values_and_respects_observed() {
        let seq = SeqAllocator::default();
        assert_eq!(seq.next_value(), CommitSeq(1));
        assert_eq!(seq.next_value(), CommitSeq(2));
        seq.observe(CommitSeq(10));
        seq.observe(CommitSeq(4));
        assert_eq!(seq.current(), CommitSeq(10));
        assert_eq!(seq.next_value(), CommitSeq(11));
    }
}
