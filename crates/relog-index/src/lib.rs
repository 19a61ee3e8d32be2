#![forbid(unsafe_code)]
//! Redirection bookkeeping for the relog engine.
//!
//! Per inode, a [`CommitTree`] maps original blocks to version chains of
//! [`RedirectionEntry`]s, tracks in-flight versions in a [`StagingTable`]
//! and accumulates sub-block write history in a [`ConflictTracker`].
//!
//! ## Conflict protocol
//!
//! - A write joins an in-flight version of its block when its sub-block
//!   mask is disjoint from every *other* contributor of that version, so
//!   disjoint concurrent writers end up in one version and nothing is lost.
//! - An overlapping write starts a new version chained ahead of the
//!   existing ones, flagged as conflicting.
//! - First committer wins: the first commit into a version reserves a
//!   global [`CommitSeq`](relog_types::CommitSeq) and dooms every other in-flight version of the
//!   block. Doomed versions, and versions based on an older committed
//!   sequence, fail to commit with [`CommitError`].
//! - A version turns valid once all its contributors committed; the
//!   previously valid version becomes superseded, so each block has at
//!   most one valid version.

pub mod arena;
pub mod chain;
pub mod conflict;
pub mod seq;
pub mod staging;
pub mod tree;

pub use arena::{EntryArena, RedirectionEntry};
pub use chain::{RedirectionIndex, VersionChain};
pub use conflict::{ConflictEntry, ConflictTracker};
pub use seq::SeqAllocator;
pub use staging::{BlockImage, Contribution, StagingEntry, StagingTable};
pub use tree::{
    CommitError, CommitReport, CommitTree, InsertOutcome, MemberSnapshot, NewVersionTicket,
    ReplayRecord, Resolution, ResolvedVersion, SealedVersion, SeedSource, StagedVersion,
    TreeStats, WritePlan,
};
