#![forbid(unsafe_code)]
//! Shared newtypes for the relog engine.
//!
//! Everything that crosses a crate boundary is wrapped in a unit-carrying
//! newtype so block numbers, inode numbers, log ids and commit sequences
//! cannot be mixed up. This crate also owns the two bit-level encodings the
//! rest of the workspace depends on:
//!
//! - [`TaggedBlock`]: a physical log address that packs a 4-bit log id and
//!   a 28-bit in-segment block offset into one integer.
//! - [`SubBlockMask`]: a 64-bit bitmap over the 64 equal sub-ranges of a
//!   block, used for fine-grained conflict detection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Number of high bits of a [`TaggedBlock`] that hold the log id.
pub const LOG_ID_BITS: u32 = 4;

/// Number of low bits of a [`TaggedBlock`] that hold the in-segment offset.
pub const OFFSET_BITS: u32 = 28;

/// Largest number of segments a pool can address.
pub const MAX_LOGS: usize = 1 << LOG_ID_BITS;

/// Largest number of blocks a single segment can address.
pub const MAX_SEGMENT_BLOCKS: u64 = 1 << OFFSET_BITS;

const OFFSET_MASK: u64 = MAX_SEGMENT_BLOCKS - 1;

/// Number of sub-ranges tracked per block.
pub const SUB_BLOCKS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Index of a log segment within the pool (`0..MAX_LOGS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub u8);

/// Opaque id of a redirection entry in a commit tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Global commit order. `CommitSeq(0)` means "nothing committed yet".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CommitSeq(pub u64);

/// Logical clock reading used for age-based reclamation thresholds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Ticks elapsed from `earlier` to `self`, saturating at zero.
    #[must_use]
    pub fn since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl LogId {
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Build a log id from a pool index, rejecting indices outside the
    /// 4-bit tag field.
    pub fn from_index(index: usize) -> Result<Self, ParseError> {
        if index >= MAX_LOGS {
            return Err(ParseError::InvalidField {
                field: "log_id",
                reason: "exceeds 4-bit tag field",
            });
        }
        u8::try_from(index)
            .map(Self)
            .map_err(|_| ParseError::IntegerConversion { field: "log_id" })
    }
}

// ── Tagged physical address ─────────────────────────────────────────────────

/// Physical log address: `log_id << 28 | offset`.
///
/// The offset is a block index inside the segment's media. Both bounds are
/// validated once when the engine is configured; after that every address
/// built by the allocator is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaggedBlock(pub u64);

impl TaggedBlock {
    pub fn new(log: LogId, offset: u64) -> Result<Self, ParseError> {
        if log.index() >= MAX_LOGS {
            return Err(ParseError::InvalidField {
                field: "log_id",
                reason: "exceeds 4-bit tag field",
            });
        }
        if offset > OFFSET_MASK {
            return Err(ParseError::InvalidField {
                field: "offset",
                reason: "exceeds 28-bit segment offset",
            });
        }
        Ok(Self((u64::from(log.0) << OFFSET_BITS) | offset))
    }

    #[must_use]
    pub fn log_id(self) -> LogId {
        // Masked to LOG_ID_BITS, always fits in u8.
        #[expect(clippy::cast_possible_truncation)]
        let id = ((self.0 >> OFFSET_BITS) & ((1 << LOG_ID_BITS) - 1)) as u8;
        LogId(id)
    }

    #[must_use]
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

// ── Sub-block bitmap ────────────────────────────────────────────────────────

/// Which of the 64 sub-ranges of a block a write touches.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubBlockMask(pub u64);

impl SubBlockMask {
    pub const EMPTY: Self = Self(0);
    pub const FULL: Self = Self(u64::MAX);

    /// Mask covering the byte range `range` of a block of `block_size` bytes.
    ///
    /// `block_size` must be a multiple of 64. The range is rounded outward
    /// to whole sub-ranges.
    pub fn for_range(range: &Range<u32>, block_size: u32) -> Result<Self, ParseError> {
        if block_size == 0 || block_size % SUB_BLOCKS != 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a non-zero multiple of 64",
            });
        }
        if range.start >= range.end || range.end > block_size {
            return Err(ParseError::InvalidField {
                field: "byte_range",
                reason: "must be non-empty and inside the block",
            });
        }
        let granule = block_size / SUB_BLOCKS;
        let first = range.start / granule;
        let last = (range.end - 1) / granule;
        let width = last - first + 1;
        let bits = if width == SUB_BLOCKS {
            u64::MAX
        } else {
            ((1_u64 << width) - 1) << first
        };
        Ok(Self(bits))
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Indices of the set bits, lowest first.
    pub fn bits(self) -> impl Iterator<Item = u32> {
        (0..SUB_BLOCKS).filter(move |bit| self.0 & (1_u64 << bit) != 0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log{}", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for TaggedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_id(), self.offset())
    }
}

impl fmt::Display for SubBlockMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tagged_block_packs_log_and_offset() {
        let tag = TaggedBlock::new(LogId(3), 0x00AB_CDEF).expect("tag");
        assert_eq!(tag.0, 0x30AB_CDEF);
        assert_eq!(tag.log_id(), LogId(3));
        assert_eq!(tag.offset(), 0x00AB_CDEF);
        assert_eq!(tag.to_string(), "log3:11259375");
    }

    #[test]
    fn tagged_block_rejects_out_of_range_parts() {
        assert!(TaggedBlock::new(LogId(16), 0).is_err());
        assert!(TaggedBlock::new(LogId(0), MAX_SEGMENT_BLOCKS).is_err());
        assert!(TaggedBlock::new(LogId(15), MAX_SEGMENT_BLOCKS - 1).is_ok());
    }

    #[test]
    fn log_id_from_index_bounds() {
        assert_eq!(LogId::from_index(15).expect("15 fits"), LogId(15));
        assert!(LogId::from_index(16).is_err());
    }

    #[test]
    fn mask_for_range_rounds_outward() {
        // 4096-byte block: 64-byte granules.
        let m = SubBlockMask::for_range(&(0..32), 4096).expect("mask");
        assert_eq!(m, SubBlockMask(0b1));
        let m = SubBlockMask::for_range(&(60..70), 4096).expect("mask");
        assert_eq!(m, SubBlockMask(0b11));
        let m = SubBlockMask::for_range(&(0..4096), 4096).expect("mask");
        assert_eq!(m, SubBlockMask::FULL);
        let m = SubBlockMask::for_range(&(4032..4096), 4096).expect("mask");
        assert_eq!(m, SubBlockMask(1 << 63));
    }

    #[test]
    fn mask_on_small_block_uses_byte_granules() {
        // 64-byte block: one byte per sub-range.
        let a = SubBlockMask::for_range(&(0..32), 64).expect("a");
        let b = SubBlockMask::for_range(&(32..64), 64).expect("b");
        let c = SubBlockMask::for_range(&(16..48), 64).expect("c");
        assert!(!a.intersects(b));
        assert!(a.intersects(c));
        assert!(b.intersects(c));
        assert_eq!(a.union(b), SubBlockMask::FULL);
    }

    #[test]
    fn mask_rejects_bad_input() {
        assert!(SubBlockMask::for_range(&(10..10), 4096).is_err());
        assert!(SubBlockMask::for_range(&(0..4097), 4096).is_err());
        assert!(SubBlockMask::for_range(&(0..10), 100).is_err());
    }

    #[test]
    fn mask_bits_and_difference() {
        let m = SubBlockMask(0b1011);
        assert_eq!(m.bits().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!(m.difference(SubBlockMask(0b0011)), SubBlockMask(0b1000));
    }

    #[test]
    fn le_readers_check_bounds() {
        let data = [1_u8, 0, 0, 0, 2, 0];
        assert_eq!(read_le_u32(&data, 0).expect("u32"), 1);
        assert_eq!(read_le_u16(&data, 4).expect("u16"), 2);
        assert!(matches!(
            read_le_u64(&data, 0),
            Err(ParseError::InsufficientData { needed: 8, .. })
        ));
    }

    proptest! {
        #[test]
        fn tagged_block_round_trips(log in 0_u8..16, offset in 0_u64..MAX_SEGMENT_BLOCKS) {
            let tag = TaggedBlock::new(LogId(log), offset).expect("in range");
            prop_assert_eq!(tag.log_id(), LogId(log));
            prop_assert_eq!(tag.offset(), offset);
        }

        #[test]
        fn disjoint_byte_ranges_on_granule_boundaries_never_intersect(
            split in 1_u32..64,
        ) {
            let block = 4096_u32;
            let cut = split * (block / SUB_BLOCKS);
            let left = SubBlockMask::for_range(&(0..cut), block).expect("left");
            let right = SubBlockMask::for_range(&(cut..block), block).expect("right");
            prop_assert!(!left.intersects(right));
            prop_assert_eq!(left.union(right), SubBlockMask::FULL);
        }
    }
}
