#![forbid(unsafe_code)]
//! Log segments: fixed-capacity, append-only regions of backing media.
//!
//! A [`LogSegment`] owns a monotonic allocation cursor over its data slots,
//! a guard region at the tail, the reclamation state machine and the I/O
//! barrier that keeps reclamation away from in-flight transactions. The
//! on-media layout is described in [`format`].

pub mod barrier;
pub mod format;

pub use barrier::{BarrierToken, IoBarrier};
pub use format::{
    DESCRIPTOR_LEN, HEADER_LEN, HeaderProbe, SegmentHeader, SegmentState, SlotDescriptor,
};

use parking_lot::Mutex;
use relog_block::ByteDevice;
use relog_error::{RelogError, Result};
use relog_types::{LogId, MAX_SEGMENT_BLOCKS, TaggedBlock, Tick};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

// ── Layout ──────────────────────────────────────────────────────────────────

/// Geometry of one segment's media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLayout {
    block_size: u32,
    segment_blocks: u64,
    descriptor_blocks: u64,
    data_slots: u64,
}

impl SegmentLayout {
    /// Split `segment_blocks` into header, descriptor area and data slots.
    pub fn new(block_size: u32, segment_blocks: u64) -> Result<Self> {
        let descriptor_len = u32::try_from(DESCRIPTOR_LEN)
            .map_err(|_| RelogError::InvalidConfig("descriptor length overflow".to_owned()))?;
        if block_size < descriptor_len || block_size % descriptor_len != 0 {
            return Err(RelogError::InvalidConfig(format!(
                "block_size {block_size} must be a multiple of {DESCRIPTOR_LEN}"
            )));
        }
        if segment_blocks > MAX_SEGMENT_BLOCKS {
            return Err(RelogError::InvalidConfig(format!(
                "segment of {segment_blocks} blocks exceeds the 28-bit offset field"
            )));
        }
        let per_block = u64::from(block_size / descriptor_len);
        let usable = segment_blocks.saturating_sub(1);
        let data_slots = usable * per_block / (per_block + 1);
        if data_slots == 0 {
            return Err(RelogError::InvalidConfig(format!(
                "segment of {segment_blocks} blocks has no room for data slots"
            )));
        }
        Ok(Self {
            block_size,
            segment_blocks,
            descriptor_blocks: data_slots.div_ceil(per_block),
            data_slots,
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn segment_blocks(&self) -> u64 {
        self.segment_blocks
    }

    #[must_use]
    pub fn data_slots(&self) -> u64 {
        self.data_slots
    }

    /// First media block of the data area.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        1 + self.descriptor_blocks
    }

    /// Bytes addressable by the allocator.
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.data_slots * u64::from(self.block_size)
    }

    #[must_use]
    pub fn media_len(&self) -> u64 {
        self.segment_blocks * u64::from(self.block_size)
    }

    fn slot_byte_offset(&self, slot: u64) -> u64 {
        (self.data_start() + slot) * u64::from(self.block_size)
    }

    fn descriptor_byte_offset(&self, slot: u64) -> u64 {
        u64::from(self.block_size) + slot * DESCRIPTOR_LEN as u64
    }
}

// ── Segment ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct Cursors {
    /// Bytes consumed in the data area.
    write: u64,
    /// Data slots handed out (descriptor slots reserved).
    meta: u64,
    /// Descriptors sealed.
    index: u64,
    first_alloc: Option<Tick>,
}

/// A freshly allocated data slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub slot: u64,
    pub target: TaggedBlock,
}

/// What [`LogSegment::open`] found on the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenReport {
    /// The header was blank and a fresh one was written.
    pub formatted: bool,
    /// State recorded in the header before recovery normalised it.
    pub recorded_state: SegmentState,
    pub generation: u64,
}

/// Serializable point-in-time view of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub log: u8,
    pub state: SegmentState,
    pub generation: u64,
    pub write_cursor: u64,
    pub meta_cursor: u64,
    pub index_cursor: u64,
    pub capacity_bytes: u64,
    pub guard_bytes: u64,
    pub inflight: u32,
    pub first_allocation: Option<u64>,
}

#[derive(Debug)]
pub struct LogSegment {
    id: LogId,
    layout: SegmentLayout,
    guard_bytes: u64,
    media: Arc<dyn ByteDevice>,
    // Lock order: state before cursors.
    state: Mutex<SegmentState>,
    cursors: Mutex<Cursors>,
    generation: AtomicU64,
    barrier: Arc<IoBarrier>,
}

impl LogSegment {
    /// Open the segment stored on `media`, formatting blank media.
    ///
    /// A header with a bad magic, version or CRC, or one describing a
    /// different geometry, fails with `RecoveryFailed`. Cursors come from
    /// the header; callers that replay descriptors raise them afterwards
    /// with [`restore_cursors`](Self::restore_cursors).
    pub fn open(
        id: LogId,
        layout: SegmentLayout,
        guard_bytes: u64,
        media: Arc<dyn ByteDevice>,
    ) -> Result<(Self, OpenReport)> {
        let fail = |detail: String| RelogError::RecoveryFailed {
            log: id.0,
            detail,
        };
        if guard_bytes >= layout.capacity_bytes() {
            return Err(RelogError::InvalidConfig(format!(
                "guard of {guard_bytes} bytes leaves no usable space in {id}"
            )));
        }
        if media.len_bytes() < layout.media_len() {
            return Err(fail(format!(
                "media holds {} bytes, layout needs {}",
                media.len_bytes(),
                layout.media_len()
            )));
        }

        let mut raw = [0_u8; HEADER_LEN];
        media.read_exact_at(0, &mut raw)?;
        let probe = format::decode_header(&raw).map_err(|err| fail(err.to_string()))?;

        let segment = Self {
            id,
            layout,
            guard_bytes,
            media,
            state: Mutex::new(SegmentState::Active),
            cursors: Mutex::new(Cursors::default()),
            generation: AtomicU64::new(1),
            barrier: IoBarrier::new(),
        };

        match probe {
            HeaderProbe::Blank => {
                segment.persist_header()?;
                info!(target: "relog::segment", log = id.0, "segment_formatted");
                Ok((
                    segment,
                    OpenReport {
                        formatted: true,
                        recorded_state: SegmentState::Active,
                        generation: 1,
                    },
                ))
            }
            HeaderProbe::Valid(header) => {
                if header.log_id != id {
                    return Err(fail(format!("header names {}", header.log_id)));
                }
                if header.block_size != layout.block_size()
                    || header.segment_blocks != layout.segment_blocks()
                {
                    return Err(fail(format!(
                        "geometry mismatch: header {}x{} bytes, configured {}x{} bytes",
                        header.segment_blocks,
                        header.block_size,
                        layout.segment_blocks(),
                        layout.block_size()
                    )));
                }
                let block = u64::from(layout.block_size());
                let write = header.write_cursor.min(layout.capacity_bytes());
                segment.generation.store(header.generation, Ordering::Release);
                *segment.cursors.lock() = Cursors {
                    write: write - write % block,
                    meta: header.meta_cursor.min(layout.data_slots()),
                    index: header.index_cursor,
                    first_alloc: None,
                };
                if matches!(
                    header.state,
                    SegmentState::Remapping | SegmentState::RemapReady
                ) {
                    warn!(
                        target: "relog::segment",
                        log = id.0,
                        state = ?header.state,
                        generation = header.generation,
                        "segment_reclaim_interrupted"
                    );
                }
                debug!(
                    target: "relog::segment",
                    log = id.0,
                    generation = header.generation,
                    state = ?header.state,
                    write_cursor = header.write_cursor,
                    "segment_opened"
                );
                Ok((
                    segment,
                    OpenReport {
                        formatted: false,
                        recorded_state: header.state,
                        generation: header.generation,
                    },
                ))
            }
        }
    }

    #[must_use]
    pub fn id(&self) -> LogId {
        self.id
    }

    #[must_use]
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    #[must_use]
    pub fn guard_bytes(&self) -> u64 {
        self.guard_bytes
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> SegmentState {
        *self.state.lock()
    }

    #[must_use]
    pub fn barrier(&self) -> &Arc<IoBarrier> {
        &self.barrier
    }

    /// Admit a transaction to this segment (shared barrier token).
    #[must_use]
    pub fn enter(&self) -> Option<BarrierToken> {
        self.barrier.try_enter()
    }

    /// `inflight_tx_count`.
    #[must_use]
    pub fn inflight(&self) -> u32 {
        self.barrier.inflight()
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Reserve `size` bytes at the write cursor, returning their offset in
    /// the data area.
    pub fn allocate(&self, size: u64, now: Tick) -> Result<u64> {
        let state = self.state.lock();
        let mut cursors = self.cursors.lock();
        let offset = self.bump(*state, &mut cursors, size, now)?;
        cursors.meta = cursors
            .write
            .div_ceil(u64::from(self.layout.block_size()))
            .max(cursors.meta);
        drop(cursors);
        drop(state);
        Ok(offset)
    }

    /// Reserve one block-sized data slot.
    pub fn allocate_slot(&self, now: Tick) -> Result<SlotRef> {
        let block = u64::from(self.layout.block_size());
        let state = self.state.lock();
        let mut cursors = self.cursors.lock();
        // Slots are block aligned even if byte allocations were mixed in.
        let pad = (block - cursors.write % block) % block;
        let offset = self.bump(*state, &mut cursors, pad + block, now)? + pad;
        let slot = offset / block;
        cursors.meta = cursors.meta.max(slot + 1);
        drop(cursors);
        drop(state);
        let target = TaggedBlock::new(self.id, self.layout.data_start() + slot)
            .map_err(|err| RelogError::Format(err.to_string()))?;
        trace!(target: "relog::segment", log = self.id.0, slot, %target, "slot_allocated");
        Ok(SlotRef { slot, target })
    }

    fn bump(
        &self,
        state: SegmentState,
        cursors: &mut Cursors,
        size: u64,
        now: Tick,
    ) -> Result<u64> {
        let limit = self.layout.capacity_bytes() - self.guard_bytes;
        let remaining = limit.saturating_sub(cursors.write);
        if state != SegmentState::Active || size > remaining {
            trace!(
                target: "relog::segment",
                log = self.id.0,
                ?state,
                size,
                remaining,
                "segment_allocate_out_of_space"
            );
            return Err(RelogError::OutOfSpace {
                needed: size,
                remaining,
            });
        }
        let offset = cursors.write;
        cursors.write += size;
        cursors.first_alloc.get_or_insert(now);
        Ok(offset)
    }

    /// Bytes between the write cursor and the end of the data area.
    #[must_use]
    pub fn remaining_space(&self) -> u64 {
        self.layout.capacity_bytes() - self.cursors.lock().write
    }

    /// Bytes still allocatable before the guard region.
    #[must_use]
    pub fn usable_space(&self) -> u64 {
        (self.layout.capacity_bytes() - self.guard_bytes).saturating_sub(self.cursors.lock().write)
    }

    /// Whether the usable space has dropped below the guard threshold (or
    /// can no longer fit a single slot).
    #[must_use]
    pub fn is_low_space(&self) -> bool {
        self.usable_space() < self.guard_bytes.max(u64::from(self.layout.block_size()))
    }

    #[must_use]
    pub fn write_cursor(&self) -> u64 {
        self.cursors.lock().write
    }

    /// Number of data slots handed out since the last reset.
    #[must_use]
    pub fn allocated_slots(&self) -> u64 {
        self.cursors.lock().meta
    }

    #[must_use]
    pub fn first_allocation(&self) -> Option<Tick> {
        self.cursors.lock().first_alloc
    }

    /// Age of the oldest allocation since the last reset.
    #[must_use]
    pub fn age(&self, now: Tick) -> Option<u64> {
        self.first_allocation().map(|first| now.since(first))
    }

    /// Raise cursors so that every slot up to `slot_count` counts as used.
    /// Used by recovery after replaying descriptors.
    pub fn restore_cursors(&self, slot_count: u64, sealed: u64, now: Tick) {
        let block = u64::from(self.layout.block_size());
        let mut cursors = self.cursors.lock();
        let slots = slot_count.min(self.layout.data_slots());
        cursors.write = cursors.write.max(slots * block);
        cursors.meta = cursors.meta.max(slots);
        cursors.index = cursors.index.max(sealed);
        if cursors.meta > 0 {
            cursors.first_alloc.get_or_insert(now);
        }
    }

    // ── Slot I/O ────────────────────────────────────────────────────────

    /// Data slot index of `target`, checked against this segment's
    /// allocated range.
    pub fn slot_of(&self, target: TaggedBlock) -> Result<u64> {
        let start = self.layout.data_start();
        let allocated = self.cursors.lock().meta;
        if target.log_id() != self.id
            || target.offset() < start
            || target.offset() - start >= allocated
        {
            return Err(RelogError::InvalidArgument(format!(
                "{target} is outside the allocated range of {}",
                self.id
            )));
        }
        Ok(target.offset() - start)
    }

    pub fn write_slot(&self, target: TaggedBlock, data: &[u8]) -> Result<()> {
        self.check_block_len(data.len())?;
        let slot = self.slot_of(target)?;
        self.media
            .write_all_at(self.layout.slot_byte_offset(slot), data)
    }

    pub fn read_slot(&self, target: TaggedBlock, buf: &mut [u8]) -> Result<()> {
        self.check_block_len(buf.len())?;
        let slot = self.slot_of(target)?;
        self.media
            .read_exact_at(self.layout.slot_byte_offset(slot), buf)
    }

    fn check_block_len(&self, len: usize) -> Result<()> {
        if u64::try_from(len).ok() != Some(u64::from(self.layout.block_size())) {
            return Err(RelogError::InvalidArgument(format!(
                "slot buffer of {len} bytes, block size is {}",
                self.layout.block_size()
            )));
        }
        Ok(())
    }

    // ── Descriptors ─────────────────────────────────────────────────────

    /// Persist the descriptor of a version that just became valid.
    pub fn seal_descriptor(&self, desc: &SlotDescriptor) -> Result<()> {
        let slot = self.slot_of(desc.target)?;
        let generation = self.generation();
        if desc.generation != generation {
            return Err(RelogError::InvalidArgument(format!(
                "descriptor generation {} does not match {} generation {generation}",
                desc.generation, self.id
            )));
        }
        self.media.write_all_at(
            self.layout.descriptor_byte_offset(slot),
            &format::encode_descriptor(desc),
        )?;
        self.cursors.lock().index += 1;
        Ok(())
    }

    /// Zero the descriptor of `target` so recovery never replays it.
    pub fn tombstone_descriptor(&self, target: TaggedBlock) -> Result<()> {
        let slot = self.slot_of(target)?;
        self.media.write_all_at(
            self.layout.descriptor_byte_offset(slot),
            &[0_u8; DESCRIPTOR_LEN],
        )
    }

    /// Every trustworthy descriptor of the current generation.
    pub fn scan_descriptors(&self) -> Result<Vec<SlotDescriptor>> {
        let block = usize::try_from(self.layout.block_size())
            .map_err(|_| RelogError::Format("block_size overflows usize".to_owned()))?;
        let generation = self.generation();
        let mut found = Vec::new();
        let mut buf = vec![0_u8; block];
        let mut slot = 0_u64;
        for area_block in 0..self.layout.descriptor_blocks {
            let offset = (1 + area_block) * u64::from(self.layout.block_size());
            self.media.read_exact_at(offset, &mut buf)?;
            for chunk in buf.chunks_exact(DESCRIPTOR_LEN) {
                if slot >= self.layout.data_slots() {
                    break;
                }
                if let Some(desc) = format::decode_descriptor(chunk) {
                    let expected = self.layout.data_start() + slot;
                    if desc.generation == generation
                        && desc.target.log_id() == self.id
                        && desc.target.offset() == expected
                    {
                        found.push(desc);
                    }
                }
                slot += 1;
            }
        }
        Ok(found)
    }

    // ── State machine ───────────────────────────────────────────────────

    /// Move `from → to`; fails if the segment is not in `from` or the edge
    /// does not exist.
    pub fn transition(&self, from: SegmentState, to: SegmentState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from || !from.can_transition_to(to) {
            return Err(RelogError::InvalidArgument(format!(
                "{} cannot move {from:?} -> {to:?} (currently {:?})",
                self.id, *state
            )));
        }
        *state = to;
        drop(state);
        debug!(target: "relog::segment", log = self.id.0, ?from, ?to, "segment_transition");
        Ok(())
    }

    /// Recycle a fully reclaimed segment: bump the generation, zero the
    /// cursors and atomically rewrite the header in state `Free`.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SegmentState::RemapReady {
            return Err(RelogError::InvalidArgument(format!(
                "{} cannot reset from {:?}",
                self.id, *state
            )));
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.cursors.lock() = Cursors::default();
        *state = SegmentState::Free;
        let header = self.header_locked(*state);
        drop(state);
        self.write_header(&header)?;
        info!(target: "relog::segment", log = self.id.0, generation, "segment_reset");
        Ok(())
    }

    // ── Header ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn header(&self) -> SegmentHeader {
        let state = self.state.lock();
        self.header_locked(*state)
    }

    fn header_locked(&self, state: SegmentState) -> SegmentHeader {
        let cursors = *self.cursors.lock();
        SegmentHeader {
            log_id: self.id,
            generation: self.generation(),
            state,
            write_cursor: cursors.write,
            meta_cursor: cursors.meta,
            index_cursor: cursors.index,
            segment_blocks: self.layout.segment_blocks(),
            block_size: self.layout.block_size(),
        }
    }

    /// Rewrite the header from in-memory state in one 64-byte write.
    pub fn persist_header(&self) -> Result<()> {
        self.write_header(&self.header())
    }

    fn write_header(&self, header: &SegmentHeader) -> Result<()> {
        self.media.write_all_at(0, &format::encode_header(header))
    }

    pub fn sync(&self) -> Result<()> {
        self.media.sync()
    }

    #[must_use]
    pub fn stats(&self) -> SegmentStats {
        let header = self.header();
        SegmentStats {
            log: self.id.0,
            state: header.state,
            generation: header.generation,
            write_cursor: header.write_cursor,
            meta_cursor: header.meta_cursor,
            index_cursor: header.index_cursor,
            capacity_bytes: self.layout.capacity_bytes(),
            guard_bytes: self.guard_bytes,
            inflight: self.inflight(),
            first_allocation: self.first_allocation().map(|tick| tick.0),
        }
    }
}
