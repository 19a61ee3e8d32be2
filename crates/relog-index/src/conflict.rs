//! Per-block sub-range write history.
//!
//! Each [`ConflictEntry`] sits behind its own mutex so concurrent writers
//! to different blocks of one inode never serialize on the inode lock just
//! to update history bits.

use parking_lot::{Mutex, RwLock};
use relog_types::{BlockNumber, SubBlockMask};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictEntry {
    pub original_block: BlockNumber,
    pub dirty_bitmap: SubBlockMask,
}

#[derive(Debug, Default)]
pub struct ConflictTracker {
    entries: RwLock<HashMap<BlockNumber, Arc<Mutex<ConflictEntry>>>>,
}

impl ConflictTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, block: BlockNumber) -> Arc<Mutex<ConflictEntry>> {
        if let Some(entry) = self.entries.read().get(&block) {
            return Arc::clone(entry);
        }
        Arc::clone(self.entries.write().entry(block).or_insert_with(|| {
            Arc::new(Mutex::new(ConflictEntry {
                original_block: block,
                dirty_bitmap: SubBlockMask::EMPTY,
            }))
        }))
    }

    /// OR `mask` into the history of `block`, returning the history as it
    /// was before.
    ///
    /// Every mask is recorded here before it is staged, so an empty
    /// intersection with the returned history proves no staged version of
    /// the block overlaps `mask`.
    pub fn record(&self, block: BlockNumber, mask: SubBlockMask) -> SubBlockMask {
        let entry = self.entry(block);
        let mut guard = entry.lock();
        let before = guard.dirty_bitmap;
        guard.dirty_bitmap = before.union(mask);
        before
    }

    #[must_use]
    pub fn history(&self, block: BlockNumber) -> SubBlockMask {
        self.entries
            .read()
            .get(&block)
            .map_or(SubBlockMask::EMPTY, |entry| entry.lock().dirty_bitmap)
    }

    #[must_use]
    pub fn tracked_blocks(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn record_accumulates_history() {
        let tracker = ConflictTracker::new();
        let block = BlockNumber(7);
        assert_eq!(tracker.record(block, SubBlockMask(0b0011)), SubBlockMask::EMPTY);
        assert_eq!(tracker.record(block, SubBlockMask(0b1100)), SubBlockMask(0b0011));
        assert_eq!(tracker.history(block), SubBlockMask(0b1111));
        assert_eq!(tracker.history(BlockNumber(8)), SubBlockMask::EMPTY);
    }

    #[test]
    fn concurrent_disjoint_records_keep_every_bit() {
        let tracker = Arc::new(ConflictTracker::new());
        let handles: Vec<_> = (0..8_u32)
            .map(|bit_group| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for bit in 0..8 {
                        tracker.record(BlockNumber(1), SubBlockMask(1 << (bit_group * 8 + bit)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(tracker.history(BlockNumber(1)), SubBlockMask::FULL);
        assert_eq!(tracker.tracked_blocks(), 1);
    }
}
