#![forbid(unsafe_code)]
//! Property tests for concurrent sub-block writers of one block.

use proptest::prelude::*;
use relog_block::ManualClock;
use relog_core::{EngineConfig, MemoryStore};
use relog_error::RelogError;
use relog_types::{BlockNumber, InodeNumber};
use std::sync::Arc;

const INODE: InodeNumber = InodeNumber(1);
const BLOCK: BlockNumber = BlockNumber(7);
/// 512-byte blocks: 64 granules of 8 bytes; each writer owns a band of 8.
const BAND: u32 = 64;

/// One writer: a byte range inside its own band and the fill byte.
fn writer() -> impl Strategy<Value = (u32, u32, u8)> {
    (0_u32..BAND, 1_u32..=BAND, any::<u8>())
        .prop_map(|(start, len, fill)| (start, len.min(BAND - start), fill))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Disjoint writers all commit, in any order, and the block ends up as
    /// the union of their writes.
    #[test]
    fn disjoint_writers_union(
        (writers, order) in proptest::collection::vec(writer(), 2..8)
            .prop_flat_map(|writers| {
                let n = writers.len();
                (Just(writers), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
            })
    ) {
        let config = EngineConfig::small(2, 64);
        let store = MemoryStore::new(&config, 16).expect("store");
        let engine = store.open(config, Arc::new(ManualClock::new(0))).expect("open");

        let sessions: Vec<_> = writers.iter().map(|_| engine.open_session(INODE)).collect();
        let mut expected = vec![0_u8; 512];
        for (band, (session, (start, len, fill))) in sessions.iter().zip(&writers).enumerate() {
            let offset = u32::try_from(band).expect("band") * BAND + start;
            let data = vec![*fill; usize::try_from(*len).expect("len")];
            session.write(BLOCK, offset, &data).expect("disjoint write");
            let at = usize::try_from(offset).expect("offset");
            expected[at..at + data.len()].copy_from_slice(&data);
        }
        for index in order {
            sessions[index].commit().expect("disjoint commit");
        }

        prop_assert_eq!(engine.read_block(INODE, BLOCK).expect("read"), expected);
        let stats = engine.stats();
        prop_assert_eq!(stats.trees[0].entries, 1);
        prop_assert_eq!(stats.trees[0].superseded, 0);
    }

    /// Two writers that share a granule: exactly one commits, the other
    /// aborts, and the block holds exactly the winner's bytes.
    #[test]
    fn overlapping_writers_exactly_one_wins(
        first_start in 0_u32..256,
        overlap in 1_u32..8,
        first_commits_first in any::<bool>(),
    ) {
        let config = EngineConfig::small(2, 64);
        let store = MemoryStore::new(&config, 16).expect("store");
        let engine = store.open(config, Arc::new(ManualClock::new(0))).expect("open");

        let a = engine.open_session(INODE);
        let b = engine.open_session(INODE);
        let second_start = first_start + 64 - overlap;
        a.write(BLOCK, first_start, &[0xA; 64]).expect("a");
        b.write(BLOCK, second_start, &[0xB; 64]).expect("b");

        let (winner, loser, fill, start) = if first_commits_first {
            (&a, &b, 0xA_u8, first_start)
        } else {
            (&b, &a, 0xB_u8, second_start)
        };
        winner.commit().expect("winner");
        let err = loser.commit().expect_err("loser");
        let is_conflict = matches!(err, RelogError::ConflictAborted { inode: 1, block: 7 });
        prop_assert!(is_conflict);

        let mut expected = vec![0_u8; 512];
        let at = usize::try_from(start).expect("start");
        expected[at..at + 64].fill(fill);
        prop_assert_eq!(engine.read_block(INODE, BLOCK).expect("read"), expected);
        prop_assert_eq!(engine.stats().trees[0].superseded, 1);
    }
}
