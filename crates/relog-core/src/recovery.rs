//! Startup recovery.
//!
//! Every segment header is read (blank media is formatted), then every
//! sealed descriptor of each segment's current generation is replayed in
//! global commit order. Segments caught mid-reclamation come back `Active`
//! with their surviving entries still dirty, so the interrupted write-back
//! simply runs again.

use crate::config::EngineConfig;
use crate::pool::LogPool;
use relog_block::{BlockDevice, ByteDevice, TickSource};
use relog_error::{RelogError, Result};
use relog_index::ReplayRecord;
use relog_segment::{LogSegment, SegmentState, SlotDescriptor};
use relog_types::LogId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// What recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Segments whose blank media was formatted.
    pub formatted: Vec<u8>,
    /// Segments whose header recorded an unfinished reclamation.
    pub interrupted: Vec<u8>,
    /// Descriptors replayed into commit trees.
    pub replayed: usize,
    /// Highest commit sequence seen.
    pub last_commit_seq: u64,
}

pub(crate) fn recover(
    config: EngineConfig,
    base: Arc<dyn BlockDevice>,
    media: Vec<Arc<dyn ByteDevice>>,
    clock: Arc<dyn TickSource>,
) -> Result<(LogPool, RecoveryReport)> {
    config.validate()?;
    if media.len() != config.log_count {
        return Err(RelogError::InvalidConfig(format!(
            "{} segment media supplied for log_count {}",
            media.len(),
            config.log_count
        )));
    }
    if base.block_size() != config.block_size {
        return Err(RelogError::InvalidConfig(format!(
            "base store block size {} differs from configured {}",
            base.block_size(),
            config.block_size
        )));
    }
    let layout = config.layout()?;
    let mut report = RecoveryReport::default();
    let mut segments = Vec::with_capacity(media.len());
    let mut recorded = Vec::with_capacity(media.len());
    for (index, device) in media.into_iter().enumerate() {
        let id = LogId::from_index(index)
            .map_err(|err| RelogError::InvalidConfig(err.to_string()))?;
        let (segment, opened) = LogSegment::open(id, layout, config.guard_bytes, device)?;
        if opened.formatted {
            report.formatted.push(id.0);
        }
        if matches!(
            opened.recorded_state,
            SegmentState::Remapping | SegmentState::RemapReady
        ) {
            report.interrupted.push(id.0);
        }
        recorded.push(opened.recorded_state);
        segments.push(Arc::new(segment));
    }

    let now = clock.now();
    let mut descriptors: Vec<SlotDescriptor> = Vec::new();
    for (segment, state) in segments.iter().zip(&recorded) {
        let found = segment.scan_descriptors()?;
        let start = segment.layout().data_start();
        let slots = found
            .iter()
            .map(|desc| desc.target.offset() - start + 1)
            .max()
            .unwrap_or(0);
        segment.restore_cursors(slots, found.len() as u64, now);
        if *state != SegmentState::Active {
            segment.persist_header()?;
        }
        descriptors.extend(found);
    }
    descriptors.sort_by_key(|desc| desc.commit_seq);

    let pool = LogPool::new(config, layout, segments, base, clock);
    for desc in &descriptors {
        let tree = pool.tree_or_create(desc.inode);
        tree.replay(
            &ReplayRecord {
                block: desc.original_block,
                target: desc.target,
                commit_seq: desc.commit_seq,
                mask: desc.dirty_mask,
                checksum: desc.data_crc,
            },
            now,
        );
        pool.seq.observe(desc.commit_seq);
    }
    report.replayed = descriptors.len();
    report.last_commit_seq = pool.seq.current().0;
    if let Some(start) = pool
        .segments
        .iter()
        .position(|segment| segment.usable_space() > 0)
    {
        pool.current.store(start, Ordering::Release);
    }

    if !report.interrupted.is_empty() {
        warn!(
            target: "relog::recovery",
            segments = ?report.interrupted,
            "interrupted_reclaim_resumed"
        );
    }
    info!(
        target: "relog::recovery",
        segments = pool.segments.len(),
        formatted = report.formatted.len(),
        replayed = report.replayed,
        last_commit_seq = report.last_commit_seq,
        "recovery_complete"
    );
    Ok((pool, report))
}
