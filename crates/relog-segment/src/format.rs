//! On-media format of a log segment.
//!
//! # Layout
//!
//! ```text
//! Segment media (segment_blocks * block_size bytes):
//! +----------------------+ block 0
//! | Segment Header       |  (64 bytes, rest of the block reserved)
//! +----------------------+ block 1
//! | Descriptor Area      |  (one 64-byte descriptor per data slot)
//! +----------------------+ block data_start
//! | Data Slots           |  (one block-sized image per redirection)
//! +----------------------+
//!
//! Segment Header:
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x474F_4C52 ("RLOG" little-endian)
//! | version          | 2 bytes| = 1
//! | state            | 1 byte |
//! | log_id           | 1 byte |
//! | generation       | 8 bytes|
//! | write_cursor     | 8 bytes| bytes consumed in the data area
//! | meta_cursor      | 8 bytes| descriptor slots reserved
//! | index_cursor     | 8 bytes| descriptors sealed
//! | segment_blocks   | 8 bytes|
//! | block_size       | 4 bytes|
//! | reserved         | 8 bytes| = 0
//! | header_crc       | 4 bytes| CRC32c of bytes 0..60
//! +------------------+--------+
//!
//! Slot Descriptor:
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x4353_4452 ("RDSC" little-endian)
//! | reserved         | 4 bytes| = 0
//! | generation       | 8 bytes| segment generation that wrote it
//! | inode            | 8 bytes|
//! | original_block   | 8 bytes|
//! | target           | 8 bytes| tagged block address
//! | commit_seq       | 8 bytes|
//! | dirty_mask       | 8 bytes|
//! | data_crc         | 4 bytes| CRC32c of the slot image
//! | record_crc       | 4 bytes| CRC32c of bytes 0..60
//! +------------------+--------+
//! ```
//!
//! # Invariants
//!
//! - The header is rewritten in a single 64-byte write; a torn or stale
//!   header fails its CRC and halts recovery.
//! - A descriptor is only trusted when its magic, CRC and generation all
//!   match; descriptors from an earlier generation are ignored, so a reset
//!   never has to clear the descriptor area.
//! - A tombstoned descriptor is all zeros.

use relog_error::{RelogError, Result};
use relog_types::{
    BlockNumber, CommitSeq, InodeNumber, LogId, ParseError, SubBlockMask, TaggedBlock,
    read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Segment header magic ("RLOG" scrambled in little-endian).
pub const SEGMENT_MAGIC: u32 = 0x474F_4C52;

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 64;

/// Slot descriptor magic ("RDSC" scrambled in little-endian).
pub const DESCRIPTOR_MAGIC: u32 = 0x4353_4452;

/// Encoded descriptor size in bytes.
pub const DESCRIPTOR_LEN: usize = 64;

const CRC_OFFSET: usize = 60;

/// Reclamation state of a segment.
///
/// `Active → RemapPending → Remapping → RemapReady → Free → Active`, with
/// `RemapPending → Active` when reclamation is called off before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    Active,
    RemapPending,
    Remapping,
    RemapReady,
    Free,
}

impl SegmentState {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::RemapPending => 1,
            Self::Remapping => 2,
            Self::RemapReady => 3,
            Self::Free => 4,
        }
    }

    pub fn from_raw(raw: u8) -> std::result::Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Active),
            1 => Ok(Self::RemapPending),
            2 => Ok(Self::Remapping),
            3 => Ok(Self::RemapReady),
            4 => Ok(Self::Free),
            _ => Err(ParseError::InvalidField {
                field: "state",
                reason: "unknown segment state",
            }),
        }
    }

    /// Whether `self → next` is an edge of the state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::RemapPending)
                | (Self::RemapPending, Self::Remapping | Self::Active)
                | (Self::Remapping, Self::RemapReady)
                | (Self::RemapReady, Self::Free)
                | (Self::Free, Self::Active)
        )
    }
}

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub log_id: LogId,
    pub generation: u64,
    pub state: SegmentState,
    pub write_cursor: u64,
    pub meta_cursor: u64,
    pub index_cursor: u64,
    pub segment_blocks: u64,
    pub block_size: u32,
}

/// Encode a segment header to bytes.
#[must_use]
pub fn encode_header(header: &SegmentHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0_u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    buf[6] = header.state.to_raw();
    buf[7] = header.log_id.0;
    buf[8..16].copy_from_slice(&header.generation.to_le_bytes());
    buf[16..24].copy_from_slice(&header.write_cursor.to_le_bytes());
    buf[24..32].copy_from_slice(&header.meta_cursor.to_le_bytes());
    buf[32..40].copy_from_slice(&header.index_cursor.to_le_bytes());
    buf[40..48].copy_from_slice(&header.segment_blocks.to_le_bytes());
    buf[48..52].copy_from_slice(&header.block_size.to_le_bytes());
    // bytes 52..60 are reserved (zeros)
    let crc = crc32c::crc32c(&buf[..CRC_OFFSET]);
    buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Outcome of probing the first bytes of a segment's media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProbe {
    /// Never formatted: the header region is all zeros.
    Blank,
    Valid(SegmentHeader),
}

/// Decode a segment header, distinguishing blank media from corruption.
pub fn decode_header(bytes: &[u8]) -> Result<HeaderProbe> {
    if bytes.len() < HEADER_LEN {
        return Err(RelogError::Format(format!(
            "segment header too short: {} bytes, need {HEADER_LEN}",
            bytes.len()
        )));
    }
    let bytes = &bytes[..HEADER_LEN];
    if bytes.iter().all(|b| *b == 0) {
        return Ok(HeaderProbe::Blank);
    }

    let magic = read_le_u32(bytes, 0).map_err(parse_to_format)?;
    if magic != SEGMENT_MAGIC {
        return Err(RelogError::Format(format!(
            "segment magic mismatch: expected {SEGMENT_MAGIC:#010x}, got {magic:#010x}"
        )));
    }
    let version = read_le_u16(bytes, 4).map_err(parse_to_format)?;
    if version != SEGMENT_FORMAT_VERSION {
        return Err(RelogError::Format(format!(
            "unsupported segment format version: {version} (expected {SEGMENT_FORMAT_VERSION})"
        )));
    }
    let stored_crc = read_le_u32(bytes, CRC_OFFSET).map_err(parse_to_format)?;
    let actual_crc = crc32c::crc32c(&bytes[..CRC_OFFSET]);
    if stored_crc != actual_crc {
        return Err(RelogError::Format(format!(
            "segment header crc mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
        )));
    }

    Ok(HeaderProbe::Valid(SegmentHeader {
        state: SegmentState::from_raw(bytes[6]).map_err(parse_to_format)?,
        log_id: LogId(bytes[7]),
        generation: read_le_u64(bytes, 8).map_err(parse_to_format)?,
        write_cursor: read_le_u64(bytes, 16).map_err(parse_to_format)?,
        meta_cursor: read_le_u64(bytes, 24).map_err(parse_to_format)?,
        index_cursor: read_le_u64(bytes, 32).map_err(parse_to_format)?,
        segment_blocks: read_le_u64(bytes, 40).map_err(parse_to_format)?,
        block_size: read_le_u32(bytes, 48).map_err(parse_to_format)?,
    }))
}

/// Record sealed into the descriptor area when a redirection becomes valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub generation: u64,
    pub inode: InodeNumber,
    pub original_block: BlockNumber,
    pub target: TaggedBlock,
    pub commit_seq: CommitSeq,
    pub dirty_mask: SubBlockMask,
    pub data_crc: u32,
}

#[must_use]
pub fn encode_descriptor(desc: &SlotDescriptor) -> [u8; DESCRIPTOR_LEN] {
    let mut buf = [0_u8; DESCRIPTOR_LEN];
    buf[0..4].copy_from_slice(&DESCRIPTOR_MAGIC.to_le_bytes());
    // bytes 4..8 are reserved (zeros)
    buf[8..16].copy_from_slice(&desc.generation.to_le_bytes());
    buf[16..24].copy_from_slice(&desc.inode.0.to_le_bytes());
    buf[24..32].copy_from_slice(&desc.original_block.0.to_le_bytes());
    buf[32..40].copy_from_slice(&desc.target.0.to_le_bytes());
    buf[40..48].copy_from_slice(&desc.commit_seq.0.to_le_bytes());
    buf[48..56].copy_from_slice(&desc.dirty_mask.0.to_le_bytes());
    buf[56..60].copy_from_slice(&desc.data_crc.to_le_bytes());
    let crc = crc32c::crc32c(&buf[..CRC_OFFSET]);
    buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decode a descriptor. Returns `None` for empty, tombstoned, torn or
/// otherwise untrustworthy records; recovery simply skips those.
#[must_use]
pub fn decode_descriptor(bytes: &[u8]) -> Option<SlotDescriptor> {
    if bytes.len() < DESCRIPTOR_LEN {
        return None;
    }
    let bytes = &bytes[..DESCRIPTOR_LEN];
    if read_le_u32(bytes, 0).ok()? != DESCRIPTOR_MAGIC {
        return None;
    }
    let stored_crc = read_le_u32(bytes, CRC_OFFSET).ok()?;
    if stored_crc != crc32c::crc32c(&bytes[..CRC_OFFSET]) {
        return None;
    }
    Some(SlotDescriptor {
        generation: read_le_u64(bytes, 8).ok()?,
        inode: InodeNumber(read_le_u64(bytes, 16).ok()?),
        original_block: BlockNumber(read_le_u64(bytes, 24).ok()?),
        target: TaggedBlock(read_le_u64(bytes, 32).ok()?),
        commit_seq: CommitSeq(read_le_u64(bytes, 40).ok()?),
        dirty_mask: SubBlockMask(read_le_u64(bytes, 48).ok()?),
        data_crc: read_le_u32(bytes, 56).ok()?,
    })
}

fn parse_to_format(err: ParseError) -> RelogError {
    RelogError::Format(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> SegmentHeader {
        SegmentHeader {
            log_id: LogId(2),
            generation: 7,
            state: SegmentState::Remapping,
            write_cursor: 8192,
            meta_cursor: 2,
            index_cursor: 1,
            segment_blocks: 64,
            block_size: 4096,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let bytes = encode_header(&header);
        assert_eq!(
            decode_header(&bytes).expect("decode"),
            HeaderProbe::Valid(header)
        );
    }

    #[test]
    fn blank_header_is_not_an_error() {
        assert_eq!(
            decode_header(&[0_u8; HEADER_LEN]).expect("blank"),
            HeaderProbe::Blank
        );
    }

    #[test]
    fn header_corruption_is_detected() {
        let mut bytes = encode_header(&sample_header());
        bytes[20] ^= 0xFF;
        let err = decode_header(&bytes).expect_err("crc mismatch");
        assert!(err.to_string().contains("crc mismatch"), "{err}");

        let mut bytes = encode_header(&sample_header());
        bytes[0] = 0;
        let err = decode_header(&bytes).expect_err("bad magic");
        assert!(err.to_string().contains("magic"), "{err}");

        let mut bytes = encode_header(&sample_header());
        bytes[4] = 9;
        assert!(decode_header(&bytes).is_err());
    }

    #[test]
    fn descriptor_round_trip_and_tombstone() {
        let desc = SlotDescriptor {
            generation: 3,
            inode: InodeNumber(11),
            original_block: BlockNumber(42),
            target: TaggedBlock::new(LogId(1), 17).expect("tag"),
            commit_seq: CommitSeq(99),
            dirty_mask: SubBlockMask(0b1010),
            data_crc: 0xAABB_CCDD,
        };
        let bytes = encode_descriptor(&desc);
        assert_eq!(decode_descriptor(&bytes), Some(desc));
        assert_eq!(decode_descriptor(&[0_u8; DESCRIPTOR_LEN]), None);

        let mut torn = bytes;
        torn[30] ^= 1;
        assert_eq!(decode_descriptor(&torn), None);
    }

    #[test]
    fn state_machine_edges() {
        use SegmentState::*;
        let allowed = [
            (Active, RemapPending),
            (RemapPending, Active),
            (RemapPending, Remapping),
            (Remapping, RemapReady),
            (RemapReady, Free),
            (Free, Active),
        ];
        let all = [Active, RemapPending, Remapping, RemapReady, Free];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn state_raw_round_trip() {
        for state in [
            SegmentState::Active,
            SegmentState::RemapPending,
            SegmentState::Remapping,
            SegmentState::RemapReady,
            SegmentState::Free,
        ] {
            assert_eq!(SegmentState::from_raw(state.to_raw()), Ok(state));
        }
        assert!(SegmentState::from_raw(9).is_err());
    }
}
