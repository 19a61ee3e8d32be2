#![forbid(unsafe_code)]
//! Randomized concurrent allocators against one segment.
//!
//! Every thread records the cursor it observes after each successful
//! allocation; the recorded sequence per thread must be strictly
//! increasing, handed-out ranges must never overlap, and the cursor must
//! never cross into the guard region.

use proptest::prelude::*;
use relog_block::MemByteDevice;
use relog_error::RelogError;
use relog_segment::{LogSegment, SegmentLayout};
use relog_types::{LogId, Tick};
use std::sync::{Arc, Barrier};
use std::thread;

fn open_segment(blocks: u64, guard_blocks: u64) -> Arc<LogSegment> {
    let layout = SegmentLayout::new(512, blocks).expect("layout");
    let media = MemByteDevice::new(usize::try_from(layout.media_len()).expect("len"));
    let (segment, _) =
        LogSegment::open(LogId(0), layout, guard_blocks * 512, Arc::new(media)).expect("open");
    Arc::new(segment)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn cursor_is_monotonic_and_bounded(
        threads in 2_usize..6,
        blocks in 16_u64..128,
        guard_blocks in 0_u64..4,
        sizes in proptest::collection::vec(1_u64..1500, 8..48),
    ) {
        let segment = open_segment(blocks, guard_blocks);
        let limit = segment.layout().capacity_bytes() - segment.guard_bytes();
        let start = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|worker| {
                let segment = Arc::clone(&segment);
                let start = Arc::clone(&start);
                let sizes = sizes.clone();
                thread::spawn(move || {
                    start.wait();
                    let mut granted = Vec::new();
                    let mut observed = Vec::new();
                    for (i, size) in sizes.iter().enumerate() {
                        let result = if (i + worker) % 3 == 0 {
                            segment.allocate_slot(Tick(1)).map(|slot| (slot.slot * 512, 512))
                        } else {
                            segment.allocate(*size, Tick(1)).map(|offset| (offset, *size))
                        };
                        match result {
                            Ok(range) => {
                                granted.push(range);
                                observed.push(segment.write_cursor());
                            }
                            Err(RelogError::OutOfSpace { .. }) => {}
                            Err(other) => panic!("unexpected allocation error: {other}"),
                        }
                    }
                    (granted, observed)
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let (granted, observed) = handle.join().expect("worker");
            for pair in observed.windows(2) {
                prop_assert!(pair[0] < pair[1], "cursor went backwards: {pair:?}");
            }
            for cursor in &observed {
                prop_assert!(*cursor <= limit);
            }
            all.extend(granted);
        }

        all.sort_unstable();
        for pair in all.windows(2) {
            let (a_off, a_len) = pair[0];
            let (b_off, _) = pair[1];
            prop_assert!(a_off + a_len <= b_off, "overlap: {:?}", pair);
        }
        if let Some((off, len)) = all.last() {
            prop_assert!(off + len <= limit);
        }
        prop_assert!(segment.write_cursor() <= limit);
    }
}

#[test]
fn exhausted_segment_reports_remaining_space() {
    let segment = open_segment(32, 2);
    let mut count = 0;
    while segment.allocate_slot(Tick(0)).is_ok() {
        count += 1;
    }
    assert_eq!(
        count * 512,
        segment.layout().capacity_bytes() - segment.guard_bytes()
    );
    match segment.allocate(1, Tick(0)) {
        Err(RelogError::OutOfSpace { needed, remaining }) => {
            assert_eq!(needed, 1);
            assert_eq!(remaining, 0);
        }
        other => panic!("expected OutOfSpace, got {other:?}"),
    }
    assert_eq!(segment.remaining_space(), segment.guard_bytes());
}
