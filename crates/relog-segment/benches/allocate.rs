//! Benchmark: segment cursor allocation.
//!
//! Measures the cost of the cursor bump alone and of allocating a slot and
//! writing its image, single-threaded and under contention.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use relog_block::MemByteDevice;
use relog_segment::{LogSegment, SegmentLayout};
use relog_types::{LogId, Tick};
use std::sync::Arc;
use std::thread;

const BLOCK: u32 = 4096;
const BLOCKS: u64 = 16_384;

fn fresh_segment() -> LogSegment {
    let layout = SegmentLayout::new(BLOCK, BLOCKS).expect("layout");
    let media = MemByteDevice::new(usize::try_from(layout.media_len()).expect("len"));
    LogSegment::open(LogId(0), layout, 0, Arc::new(media))
        .expect("open")
        .0
}

fn bench_slot_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_slot");

    group.bench_function("cursor_only", |b| {
        let mut segment = fresh_segment();
        b.iter(|| {
            if segment.allocate_slot(Tick(0)).is_err() {
                segment = fresh_segment();
            }
        });
    });

    group.bench_function("with_image_write", |b| {
        let mut segment = fresh_segment();
        let image = vec![0xA5_u8; BLOCK as usize];
        b.iter(|| match segment.allocate_slot(Tick(0)) {
            Ok(slot) => segment
                .write_slot(slot.target, black_box(&image))
                .expect("write"),
            Err(_) => segment = fresh_segment(),
        });
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_contended");
    for threads in [2_usize, 4, 8] {
        group.bench_function(format!("{threads}_threads"), |b| {
            b.iter(|| {
                let segment = Arc::new(fresh_segment());
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let segment = Arc::clone(&segment);
                        thread::spawn(move || {
                            let mut granted = 0_u32;
                            while segment.allocate(black_box(512), Tick(0)).is_ok() {
                                granted += 1;
                            }
                            granted
                        })
                    })
                    .collect();
                let total: u32 = handles.into_iter().map(|h| h.join().expect("join")).sum();
                black_box(total)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_slot_allocation, bench_contended);
criterion_main!(benches);
