//! Per-inode commit tree.
//!
//! The tree aggregates the redirection index, the staging table, the
//! conflict tracker and the membership orderings used by reclamation.
//! Index structures sit behind one per-inode `RwLock`; conflict history
//! has its own finer locks. Nothing here performs media I/O: callers
//! allocate slots, write images and seal descriptors around these calls.

use crate::arena::{EntryArena, RedirectionEntry};
use crate::chain::RedirectionIndex;
use crate::conflict::ConflictTracker;
use crate::seq::SeqAllocator;
use crate::staging::{BlockImage, Contribution, StagingEntry, StagingTable};
use parking_lot::{Mutex, RwLock};
use relog_types::{
    BlockNumber, CommitSeq, EntryId, InodeNumber, LogId, SessionId, SubBlockMask, TaggedBlock,
    Tick,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error(
        "first-committer-wins conflict on block {block}: base={base:?}, observed={observed:?}"
    )]
    Conflict {
        block: BlockNumber,
        base: CommitSeq,
        observed: CommitSeq,
    },
    #[error("block {block} has a version sealing under another transaction")]
    Sealing { block: BlockNumber },
    #[error("version {entry} of block {block} lost to a concurrent commit")]
    Doomed { block: BlockNumber, entry: EntryId },
    #[error("write to block {block} overlaps another transaction's share of version {entry}")]
    Overlap { block: BlockNumber, entry: EntryId },
}

impl CommitError {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        match self {
            Self::Conflict { block, .. }
            | Self::Sealing { block }
            | Self::Doomed { block, .. }
            | Self::Overlap { block, .. } => *block,
        }
    }
}

/// An in-flight version a session may patch.
#[derive(Debug, Clone)]
pub struct StagedVersion {
    pub entry: EntryId,
    pub block: BlockNumber,
    pub target: TaggedBlock,
    pub image: Arc<Mutex<BlockImage>>,
}

/// Where a new version's image is seeded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedSource {
    Base,
    Log {
        entry: EntryId,
        target: TaggedBlock,
        checksum: u32,
    },
}

/// Everything needed to create a version once a slot has been allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewVersionTicket {
    pub block: BlockNumber,
    pub seed: SeedSource,
    /// Committed sequence of the block the seed corresponds to.
    pub seen_seq: CommitSeq,
}

#[derive(Debug, Clone)]
pub enum WritePlan {
    Join(StagedVersion),
    NewVersion(NewVersionTicket),
}

#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(StagedVersion),
    /// A joinable version appeared meanwhile; the allocated slot is unused.
    Joined(StagedVersion),
    /// The block committed a new version since the seed was read.
    Reseed(NewVersionTicket),
}

/// A version that just became valid and needs its descriptor sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedVersion {
    pub entry: EntryId,
    pub block: BlockNumber,
    pub target: TaggedBlock,
    pub commit_seq: CommitSeq,
    pub mask: SubBlockMask,
    pub checksum: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub sealed: Vec<SealedVersion>,
    /// Sequences reserved by this commit, in program order.
    pub reserved: Vec<CommitSeq>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub entry: EntryId,
    pub target: TaggedBlock,
    pub checksum: u32,
    pub commit_seq: CommitSeq,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Base,
    Log(ResolvedVersion),
    /// The caller's own in-flight version.
    Staged(StagedVersion),
    /// Write-back of the block failed permanently.
    Failed(String),
}

/// What reclamation needs to know about one member entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub entry: EntryId,
    pub block: BlockNumber,
    pub target: TaggedBlock,
    pub dirty: bool,
    pub valid: bool,
    pub superseded: bool,
    pub staged: bool,
    pub commit_seq: Option<CommitSeq>,
    pub checksum: u32,
    pub eligible_since: Option<Tick>,
}

impl MemberSnapshot {
    fn of(entry: &RedirectionEntry) -> Self {
        Self {
            entry: entry.id,
            block: entry.original_block,
            target: entry.target,
            dirty: entry.dirty,
            valid: entry.valid,
            superseded: entry.superseded,
            staged: entry.staged,
            commit_seq: entry.commit_seq,
            checksum: entry.checksum,
            eligible_since: entry.eligible_since,
        }
    }
}

/// A committed version rebuilt from an on-media descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRecord {
    pub block: BlockNumber,
    pub target: TaggedBlock,
    pub commit_seq: CommitSeq,
    pub mask: SubBlockMask,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    pub inode: u64,
    /// Total entries (`length`).
    pub entries: usize,
    /// Valid entries awaiting write-back (`remap_length`).
    pub pending_remap: usize,
    /// Entries written back so far (`written_length`).
    pub written_back: u64,
    pub staged: usize,
    pub superseded: usize,
    pub failed_blocks: usize,
    pub logical_size: u64,
    pub sessions: usize,
    pub tracked_blocks: usize,
}

#[derive(Debug, Default)]
struct TreeState {
    arena: EntryArena,
    index: RedirectionIndex,
    staging: StagingTable,
    per_log: BTreeMap<LogId, BTreeSet<EntryId>>,
    dirty: BTreeSet<EntryId>,
    active: BTreeSet<EntryId>,
    gc: BTreeSet<(Tick, EntryId)>,
    written_back: u64,
    failed: BTreeMap<BlockNumber, String>,
    logical_size: u64,
    sessions: BTreeSet<SessionId>,
    evicted: bool,
}

impl TreeState {
    fn joinable(
        &self,
        block: BlockNumber,
        session: SessionId,
        mask: SubBlockMask,
    ) -> Option<EntryId> {
        if let Some(own) = self.staging.pending_for(block, session) {
            return Some(own);
        }
        self.staging
            .for_block(block)
            .into_iter()
            .find(|id| self.staging.get(*id).is_some_and(|s| s.admits(session, mask)))
    }

    fn join(
        &mut self,
        id: EntryId,
        session: SessionId,
        mask: SubBlockMask,
        end: u64,
    ) -> Option<StagedVersion> {
        let staging = self.staging.get_mut(id)?;
        staging.contribute(session, mask, end);
        let staged = StagedVersion {
            entry: id,
            block: staging.original_block,
            target: staging.target,
            image: Arc::clone(&staging.image),
        };
        let bitmap = staging.dirty_bitmap;
        if let Some(entry) = self.arena.get_mut(id) {
            entry.mask = bitmap;
        }
        Some(staged)
    }

    fn ticket(&self, block: BlockNumber) -> Result<NewVersionTicket, CommitError> {
        let chain = self.index.chain(block);
        if chain.is_some_and(crate::chain::VersionChain::is_sealing) {
            return Err(CommitError::Sealing { block });
        }
        let seed = chain
            .and_then(|chain| chain.valid)
            .and_then(|id| self.arena.get(id))
            .map_or(SeedSource::Base, |entry| SeedSource::Log {
                entry: entry.id,
                target: entry.target,
                checksum: entry.checksum,
            });
        Ok(NewVersionTicket {
            block,
            seed,
            seen_seq: self.index.committed_seq(block),
        })
    }

    fn supersede(&mut self, id: EntryId) {
        if let Some(entry) = self.arena.get_mut(id) {
            entry.valid = false;
            entry.superseded = true;
            self.active.remove(&id);
            self.dirty.remove(&id);
        }
    }

    fn seal(&mut self, id: EntryId, now: Tick) -> Option<SealedVersion> {
        let staging = self.staging.remove(id)?;
        let seq = staging.reserved?;
        let checksum = staging.image.lock().checksum();
        let block = staging.original_block;
        let entry = self.arena.get_mut(id)?;
        entry.valid = true;
        entry.dirty = true;
        entry.staged = false;
        entry.commit_time = Some(now);
        entry.commit_seq = Some(seq);
        entry.checksum = checksum;
        entry.mask = staging.dirty_bitmap;
        entry.eligible_since = Some(now);
        let sealed = SealedVersion {
            entry: id,
            block,
            target: entry.target,
            commit_seq: seq,
            mask: entry.mask,
            checksum,
        };
        if let Some(previous) = self.index.promote(block, id, seq) {
            self.supersede(previous);
        }
        self.dirty.insert(id);
        self.active.insert(id);
        self.gc.insert((now, id));
        self.failed.remove(&block);
        Some(sealed)
    }

    /// Every contributor of a doomed version withdrew: keep it as a
    /// superseded loser until its segment is reclaimed.
    fn lose(&mut self, id: EntryId, now: Tick) {
        self.staging.remove(id);
        if let Some(entry) = self.arena.get_mut(id) {
            entry.staged = false;
            entry.superseded = true;
            entry.eligible_since = Some(now);
            self.gc.insert((now, id));
        }
    }

    fn unlink_everywhere(&mut self, id: EntryId) -> Option<RedirectionEntry> {
        let entry = self.arena.remove(id)?;
        self.staging.remove(id);
        self.index.unlink(entry.original_block, id);
        if let Some(members) = self.per_log.get_mut(&entry.log_id) {
            members.remove(&id);
            if members.is_empty() {
                self.per_log.remove(&entry.log_id);
            }
        }
        self.dirty.remove(&id);
        self.active.remove(&id);
        if let Some(since) = entry.eligible_since {
            self.gc.remove(&(since, id));
        }
        Some(entry)
    }
}

#[derive(Debug)]
pub struct CommitTree {
    inode: InodeNumber,
    block_size: u32,
    conflicts: ConflictTracker,
    state: RwLock<TreeState>,
    epoch: AtomicU64,
}

impl CommitTree {
    #[must_use]
    pub fn new(inode: InodeNumber, block_size: u32) -> Self {
        Self {
            inode,
            block_size,
            conflicts: ConflictTracker::new(),
            state: RwLock::new(TreeState::default()),
            epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        self.inode
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn conflicts(&self) -> &ConflictTracker {
        &self.conflicts
    }

    /// Bumped whenever the valid version of any block changes.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Decide where a write of `mask` to `block` goes.
    ///
    /// Joins the session's own in-flight version, or any in-flight version
    /// whose other contributors are disjoint from `mask`; otherwise asks
    /// the caller to allocate a slot for a new version.
    pub fn plan_write(
        &self,
        session: SessionId,
        block: BlockNumber,
        mask: SubBlockMask,
        end: u64,
    ) -> Result<WritePlan, CommitError> {
        self.conflicts.record(block, mask);
        let mut state = self.state.write();
        if let Some(own) = state.staging.pending_for(block, session) {
            let staging = state.staging.get(own);
            if let Some(staging) = staging.filter(|s| !s.admits(session, mask)) {
                return Err(if staging.doomed {
                    CommitError::Doomed { block, entry: own }
                } else {
                    CommitError::Overlap { block, entry: own }
                });
            }
        }
        if let Some(id) = state.joinable(block, session, mask) {
            if let Some(staged) = state.join(id, session, mask, end) {
                trace!(
                    target: "relog::index",
                    inode = self.inode.0,
                    block = block.0,
                    entry = id.0,
                    "version_joined"
                );
                return Ok(WritePlan::Join(staged));
            }
        }
        state.ticket(block).map(WritePlan::NewVersion)
    }

    /// Create the version planned by `ticket` in the freshly allocated
    /// `slot`, seeded with `seed`.
    pub fn insert_version(
        &self,
        session: SessionId,
        ticket: &NewVersionTicket,
        mask: SubBlockMask,
        end: u64,
        slot: TaggedBlock,
        seed: Vec<u8>,
    ) -> Result<InsertOutcome, CommitError> {
        let block = ticket.block;
        let history = self.conflicts.history(block);
        let mut state = self.state.write();
        if let Some(id) = state.joinable(block, session, mask) {
            if let Some(staged) = state.join(id, session, mask, end) {
                trace!(
                    target: "relog::index",
                    inode = self.inode.0,
                    block = block.0,
                    %slot,
                    "slot_abandoned"
                );
                return Ok(InsertOutcome::Joined(staged));
            }
        }
        let fresh = state.ticket(block)?;
        if fresh.seen_seq != ticket.seen_seq {
            return Ok(InsertOutcome::Reseed(fresh));
        }

        // History covers every staged mask, so a miss proves no overlap.
        let conflict_flag = history.intersects(mask)
            && state.staging.for_block(block).iter().any(|id| {
                state
                    .staging
                    .get(*id)
                    .is_some_and(|s| s.dirty_bitmap.intersects(mask))
            });
        let inode = self.inode;
        let id = state.arena.insert_with(|id| RedirectionEntry {
            id,
            inode,
            original_block: block,
            target: slot,
            log_id: slot.log_id(),
            dirty: false,
            valid: false,
            superseded: false,
            commit_time: None,
            commit_seq: None,
            checksum: 0,
            conflict_flag,
            staged: true,
            base_seq: ticket.seen_seq,
            eligible_since: None,
            mask,
        });
        state.index.push_newest(block, id);
        state.per_log.entry(slot.log_id()).or_default().insert(id);
        let mut staging = StagingEntry::new(block, slot, id, seed);
        staging.contribute(session, mask, end);
        let staged = StagedVersion {
            entry: id,
            block,
            target: slot,
            image: Arc::clone(&staging.image),
        };
        state.staging.insert(staging);
        drop(state);
        debug!(
            target: "relog::index",
            inode = self.inode.0,
            block = block.0,
            entry = id.0,
            %slot,
            conflict_flag,
            "version_staged"
        );
        Ok(InsertOutcome::Created(staged))
    }

    // ── Commit / abort ──────────────────────────────────────────────────

    /// Commit every pending contribution of `session` among `entries`
    /// (program order). Either all of them commit or none do.
    pub fn commit_session(
        &self,
        session: SessionId,
        entries: &[EntryId],
        seq: &SeqAllocator,
        now: Tick,
    ) -> Result<CommitReport, CommitError> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        for id in entries {
            let Some(staging) = state.staging.get(*id).filter(|s| s.is_pending(session)) else {
                continue;
            };
            let block = staging.original_block;
            if staging.doomed {
                return Err(CommitError::Doomed { block, entry: *id });
            }
            if staging.reserved.is_none() {
                let base = state.arena.get(*id).map_or(CommitSeq(0), |e| e.base_seq);
                let observed = state
                    .index
                    .chain(block)
                    .map_or(CommitSeq(0), |chain| chain.reserved_seq);
                if observed > base {
                    return Err(CommitError::Conflict {
                        block,
                        base,
                        observed,
                    });
                }
            }
        }

        let mut report = CommitReport::default();
        let mut changed = false;
        for id in entries {
            let Some(staging) = state.staging.get_mut(*id).filter(|s| s.is_pending(session))
            else {
                continue;
            };
            let block = staging.original_block;
            if staging.reserved.is_none() {
                let reserved = seq.next_value();
                staging.reserved = Some(reserved);
                report.reserved.push(reserved);
                state.index.chain_mut(block).reserved_seq = reserved;
                for other in state.staging.for_block(block) {
                    if other == *id {
                        continue;
                    }
                    if let Some(rival) = state.staging.get_mut(other) {
                        if rival.reserved.is_none() && !rival.doomed {
                            rival.doomed = true;
                            debug!(
                                target: "relog::index",
                                inode = self.inode.0,
                                block = block.0,
                                entry = other.0,
                                "version_doomed"
                            );
                        }
                    }
                }
            }
            let Some(staging) = state.staging.get_mut(*id) else {
                continue;
            };
            if let Some(share) = staging.contributors.get_mut(&session) {
                share.committed = true;
                state.logical_size = state.logical_size.max(share.end);
            }
            staging.image.lock().forget(session);
            if staging.all_committed() {
                if let Some(sealed) = state.seal(*id, now) {
                    report.sealed.push(sealed);
                    changed = true;
                }
            }
        }
        drop(guard);
        if changed {
            self.bump_epoch();
        }
        debug!(
            target: "relog::index",
            inode = self.inode.0,
            session = session.0,
            sealed = report.sealed.len(),
            "session_committed"
        );
        Ok(report)
    }

    /// Withdraw every pending contribution of `session` among `entries`.
    ///
    /// Shared images must already have been restored by the caller. A
    /// version left without pending contributors is sealed when someone
    /// committed to it, kept as a loser when it was doomed, and discarded
    /// otherwise. Returns versions that became valid as a result.
    pub fn abort_session(
        &self,
        session: SessionId,
        entries: &[EntryId],
        now: Tick,
    ) -> Vec<SealedVersion> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut sealed = Vec::new();
        for id in entries {
            let Some(staging) = state.staging.get_mut(*id).filter(|s| s.is_pending(session)) else {
                continue;
            };
            staging.withdraw(session);
            staging.image.lock().forget(session);
            let bitmap = staging.dirty_bitmap;
            let empty = staging.contributors.is_empty();
            let doomed = staging.doomed;
            let complete = staging.all_committed();
            if let Some(entry) = state.arena.get_mut(*id) {
                entry.mask = bitmap;
            }
            if empty && doomed {
                state.lose(*id, now);
                debug!(target: "relog::index", inode = self.inode.0, entry = id.0, "version_lost");
            } else if empty {
                state.unlink_everywhere(*id);
                trace!(
                    target: "relog::index",
                    inode = self.inode.0,
                    entry = id.0,
                    "version_discarded"
                );
            } else if complete {
                if let Some(version) = state.seal(*id, now) {
                    sealed.push(version);
                }
            }
        }
        drop(guard);
        if !sealed.is_empty() {
            self.bump_epoch();
        }
        sealed
    }

    // ── Read path ───────────────────────────────────────────────────────

    #[must_use]
    pub fn resolve(&self, block: BlockNumber) -> Resolution {
        let state = self.state.read();
        Self::resolve_locked(&state, block)
    }

    /// Like [`resolve`](Self::resolve), but a session sees its own
    /// in-flight version first.
    #[must_use]
    pub fn resolve_for(&self, session: SessionId, block: BlockNumber) -> Resolution {
        let state = self.state.read();
        if let Some(id) = state.staging.pending_for(block, session) {
            if let Some(staging) = state.staging.get(id) {
                return Resolution::Staged(StagedVersion {
                    entry: id,
                    block,
                    target: staging.target,
                    image: Arc::clone(&staging.image),
                });
            }
        }
        Self::resolve_locked(&state, block)
    }

    fn resolve_locked(state: &TreeState, block: BlockNumber) -> Resolution {
        if let Some(detail) = state.failed.get(&block) {
            return Resolution::Failed(detail.clone());
        }
        state
            .index
            .resolve(block)
            .and_then(|id| state.arena.get(id))
            .map_or(Resolution::Base, |entry| {
                Resolution::Log(ResolvedVersion {
                    entry: entry.id,
                    target: entry.target,
                    checksum: entry.checksum,
                    commit_seq: entry.commit_seq.unwrap_or_default(),
                })
            })
    }

    /// Whether `id` is still the valid version of `block`.
    #[must_use]
    pub fn is_current(&self, block: BlockNumber, id: EntryId) -> bool {
        self.state.read().index.resolve(block) == Some(id)
    }

    #[must_use]
    pub fn entry(&self, id: EntryId) -> Option<RedirectionEntry> {
        self.state.read().arena.get(id).cloned()
    }

    /// The uncommitted share `session` holds in staged version `id`, with
    /// the version's image.
    #[must_use]
    pub fn pending_share(
        &self,
        session: SessionId,
        id: EntryId,
    ) -> Option<(Contribution, StagedVersion)> {
        let state = self.state.read();
        let staging = state.staging.get(id).filter(|s| s.is_pending(session))?;
        let share = *staging.contributors.get(&session)?;
        Some((
            share,
            StagedVersion {
                entry: id,
                block: staging.original_block,
                target: staging.target,
                image: Arc::clone(&staging.image),
            },
        ))
    }

    // ── Reclamation ─────────────────────────────────────────────────────

    /// Members of segment `log`, in entry order.
    #[must_use]
    pub fn members_of(&self, log: LogId) -> Vec<MemberSnapshot> {
        let state = self.state.read();
        state
            .per_log
            .get(&log)
            .into_iter()
            .flatten()
            .filter_map(|id| state.arena.get(*id))
            .map(MemberSnapshot::of)
            .collect()
    }

    #[must_use]
    pub fn member_count(&self, log: LogId) -> usize {
        self.state.read().per_log.get(&log).map_or(0, BTreeSet::len)
    }

    /// Superseded, committed versions of `block` older than `than`; their
    /// descriptors must not outlive a write-back of a newer version.
    #[must_use]
    pub fn older_committed(&self, block: BlockNumber, than: CommitSeq) -> Vec<MemberSnapshot> {
        let state = self.state.read();
        state
            .index
            .chain(block)
            .map(|chain| chain.entries.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| state.arena.get(id))
            .filter(|entry| entry.superseded && entry.commit_seq.is_some_and(|seq| seq < than))
            .map(MemberSnapshot::of)
            .collect()
    }

    /// Dirty valid entries whose gc eligibility is at least `min_age` old.
    #[must_use]
    pub fn force_copy_candidates(&self, now: Tick, min_age: u64) -> Vec<MemberSnapshot> {
        let state = self.state.read();
        state
            .gc
            .iter()
            .take_while(|(since, _)| now.since(*since) >= min_age)
            .filter_map(|(_, id)| state.arena.get(*id))
            .filter(|entry| entry.valid && entry.dirty)
            .map(MemberSnapshot::of)
            .collect()
    }

    /// Record that `id`'s data reached the base store.
    pub fn mark_written_back(&self, id: EntryId) -> bool {
        let mut state = self.state.write();
        let Some(entry) = state.arena.get_mut(id) else {
            return false;
        };
        if !entry.dirty {
            return false;
        }
        entry.dirty = false;
        state.dirty.remove(&id);
        state.written_back += 1;
        true
    }

    /// Remove `id` from the arena and every ordering in one step.
    pub fn retire(&self, id: EntryId) -> bool {
        let removed = self.state.write().unlink_everywhere(id);
        match removed {
            Some(entry) => {
                if entry.valid {
                    self.bump_epoch();
                }
                trace!(
                    target: "relog::index",
                    inode = self.inode.0,
                    entry = id.0,
                    block = entry.original_block.0,
                    "entry_retired"
                );
                true
            }
            None => false,
        }
    }

    /// Reads of `block` fail with `detail` until a new version commits.
    pub fn mark_failed(&self, block: BlockNumber, detail: String) {
        self.state.write().failed.insert(block, detail);
        self.bump_epoch();
    }

    #[must_use]
    pub fn failed_blocks(&self) -> Vec<BlockNumber> {
        self.state.read().failed.keys().copied().collect()
    }

    // ── Recovery ────────────────────────────────────────────────────────

    /// Rebuild a committed version. Records must arrive in commit order.
    pub fn replay(&self, record: &ReplayRecord, now: Tick) -> EntryId {
        let inode = self.inode;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let base_seq = state.index.committed_seq(record.block);
        let id = state.arena.insert_with(|id| RedirectionEntry {
            id,
            inode,
            original_block: record.block,
            target: record.target,
            log_id: record.target.log_id(),
            dirty: true,
            valid: true,
            superseded: false,
            commit_time: Some(now),
            commit_seq: Some(record.commit_seq),
            checksum: record.checksum,
            conflict_flag: false,
            staged: false,
            base_seq,
            eligible_since: Some(now),
            mask: record.mask,
        });
        state.index.push_newest(record.block, id);
        if let Some(previous) = state.index.promote(record.block, id, record.commit_seq) {
            state.supersede(previous);
        }
        state
            .per_log
            .entry(record.target.log_id())
            .or_default()
            .insert(id);
        state.dirty.insert(id);
        state.active.insert(id);
        state.gc.insert((now, id));
        let end = (record.block.0 + 1) * u64::from(self.block_size);
        state.logical_size = state.logical_size.max(end);
        drop(guard);
        self.conflicts.record(record.block, record.mask);
        self.bump_epoch();
        id
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn register_session(&self, session: SessionId) {
        self.state.write().sessions.insert(session);
    }

    pub fn unregister_session(&self, session: SessionId) {
        self.state.write().sessions.remove(&session);
    }

    pub fn mark_evicted(&self) {
        self.state.write().evicted = true;
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.state.read().evicted
    }

    /// No entries, no staged writes and no open sessions.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.read();
        state.arena.is_empty() && state.staging.is_empty() && state.sessions.is_empty()
    }

    #[must_use]
    pub fn logical_size(&self) -> u64 {
        self.state.read().logical_size
    }

    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let state = self.state.read();
        TreeStats {
            inode: self.inode.0,
            entries: state.arena.len(),
            pending_remap: state.dirty.len(),
            written_back: state.written_back,
            staged: state.staging.len(),
            superseded: state.arena.iter().filter(|e| e.superseded).count(),
            failed_blocks: state.failed.len(),
            logical_size: state.logical_size,
            sessions: state.sessions.len(),
            tracked_blocks: self.conflicts.tracked_blocks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u32 = 64;

    fn tree() -> CommitTree {
        CommitTree::new(InodeNumber(1), BS)
    }

    fn slot(n: u64) -> TaggedBlock {
        TaggedBlock::new(LogId(0), n).expect("tag")
    }

    /// Stage a write, allocating `slot_no` if a new version is needed.
    fn stage(
        tree: &CommitTree,
        session: u64,
        block: u64,
        mask: SubBlockMask,
        slot_no: u64,
    ) -> Result<StagedVersion, CommitError> {
        let session = SessionId(session);
        match tree.plan_write(session, BlockNumber(block), mask, 64)? {
            WritePlan::Join(staged) => Ok(staged),
            WritePlan::NewVersion(ticket) => {
                match tree.insert_version(session, &ticket, mask, 64, slot(slot_no), vec![0; 64])? {
                    InsertOutcome::Created(staged) | InsertOutcome::Joined(staged) => Ok(staged),
                    InsertOutcome::Reseed(_) => panic!("unexpected reseed"),
                }
            }
        }
    }

    #[test]
    fn single_writer_commit_becomes_valid() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let staged = stage(&tree, 1, 42, SubBlockMask(0b11), 10).expect("stage");
        staged
            .image
            .lock()
            .patch(SessionId(1), 0, &[7; 2])
            .expect("patch");
        assert!(matches!(tree.resolve(BlockNumber(42)), Resolution::Base));
        assert!(matches!(
            tree.resolve_for(SessionId(1), BlockNumber(42)),
            Resolution::Staged(_)
        ));

        let epoch = tree.epoch();
        let report = tree
            .commit_session(SessionId(1), &[staged.entry], &seq, Tick(5))
            .expect("commit");
        assert_eq!(report.sealed.len(), 1);
        assert_eq!(report.sealed[0].commit_seq, CommitSeq(1));
        assert!(tree.epoch() > epoch);
        let Resolution::Log(found) = tree.resolve(BlockNumber(42)) else {
            panic!("expected log resolution");
        };
        assert_eq!(found.target, slot(10));
        assert_eq!(found.checksum, report.sealed[0].checksum);
        let stats = tree.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.pending_remap, 1);
        assert_eq!(stats.staged, 0);
        assert_eq!(stats.logical_size, 64);
    }

    #[test]
    fn disjoint_sessions_share_one_version() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let a = stage(&tree, 1, 7, SubBlockMask(0x0000_0000_FFFF_FFFF), 1).expect("a");
        let b = stage(&tree, 2, 7, SubBlockMask(0xFFFF_FFFF_0000_0000), 2).expect("b");
        assert_eq!(a.entry, b.entry, "disjoint writes coalesce");

        tree.commit_session(SessionId(1), &[a.entry], &seq, Tick(1))
            .expect("a commits");
        assert!(
            matches!(tree.resolve(BlockNumber(7)), Resolution::Base),
            "not valid until every contributor committed"
        );
        let report = tree
            .commit_session(SessionId(2), &[b.entry], &seq, Tick(2))
            .expect("b commits");
        assert_eq!(report.sealed.len(), 1);
        assert_eq!(report.sealed[0].mask, SubBlockMask::FULL);
        assert!(tree.entry(a.entry).expect("entry").valid);
    }

    #[test]
    fn overlapping_sessions_first_committer_wins() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let a = stage(&tree, 1, 7, SubBlockMask(0x0000_0000_FFFF_FFFF), 1).expect("a");
        let b = stage(&tree, 2, 7, SubBlockMask(0x0000_FFFF_FFFF_0000), 2).expect("b");
        assert_ne!(a.entry, b.entry);
        assert!(tree.entry(b.entry).expect("b").conflict_flag);

        tree.commit_session(SessionId(2), &[b.entry], &seq, Tick(1))
            .expect("b wins");
        let err = tree
            .commit_session(SessionId(1), &[a.entry], &seq, Tick(1))
            .expect_err("a loses");
        assert_eq!(err.block(), BlockNumber(7));
        assert!(matches!(err, CommitError::Doomed { .. }));

        assert!(tree.abort_session(SessionId(1), &[a.entry], Tick(2)).is_empty());
        let loser = tree.entry(a.entry).expect("loser retained");
        assert!(loser.superseded && !loser.valid);
        let winner = tree.entry(b.entry).expect("winner");
        assert!(winner.valid);
        assert_eq!(tree.members_of(LogId(0)).len(), 2);
    }

    #[test]
    fn stale_base_conflicts_even_without_doom() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let a = stage(&tree, 1, 3, SubBlockMask::FULL, 1).expect("a");
        // Reserve a newer sequence on the chain behind the tree's back.
        {
            let mut state = tree.state.write();
            state.index.chain_mut(BlockNumber(3)).reserved_seq = CommitSeq(9);
            state.index.chain_mut(BlockNumber(3)).committed_seq = CommitSeq(9);
        }
        let err = tree
            .commit_session(SessionId(1), &[a.entry], &seq, Tick(0))
            .expect_err("stale");
        assert!(matches!(err, CommitError::Conflict { observed: CommitSeq(9), .. }));
    }

    #[test]
    fn disjoint_writer_joins_a_sealing_version() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let a = stage(&tree, 1, 7, SubBlockMask(0b001), 1).expect("a");
        let b = stage(&tree, 2, 7, SubBlockMask(0b010), 1).expect("b");
        tree.commit_session(SessionId(1), &[a.entry], &seq, Tick(0))
            .expect("a");

        let c = stage(&tree, 3, 7, SubBlockMask(0b100), 5).expect("newcomer joins");
        assert_eq!(c.entry, a.entry);
        let err = stage(&tree, 3, 7, SubBlockMask(0b001), 5).expect_err("committed bits");
        assert!(matches!(err, CommitError::Overlap { .. }));
        let err = stage(&tree, 1, 7, SubBlockMask(0b1000), 5).expect_err("closed share");
        assert!(matches!(err, CommitError::Sealing { .. }));

        let report = tree
            .commit_session(SessionId(2), &[b.entry], &seq, Tick(1))
            .expect("b");
        assert!(report.sealed.is_empty());
        assert!(matches!(tree.resolve(BlockNumber(7)), Resolution::Base));

        let report = tree
            .commit_session(SessionId(3), &[c.entry], &seq, Tick(2))
            .expect("c");
        assert_eq!(report.sealed.len(), 1);
        assert_eq!(report.sealed[0].mask, SubBlockMask(0b111));
        assert_eq!(report.sealed[0].commit_seq, CommitSeq(1));
        assert!(tree.entry(a.entry).expect("entry").valid);
        assert_eq!(tree.stats().entries, 1);
    }

    #[test]
    fn voluntary_abort_discards_sole_version() {
        let tree = tree();
        let a = stage(&tree, 1, 9, SubBlockMask::FULL, 1).expect("a");
        assert!(tree.abort_session(SessionId(1), &[a.entry], Tick(0)).is_empty());
        assert!(tree.entry(a.entry).is_none());
        assert_eq!(tree.stats().entries, 0);
        assert!(tree.members_of(LogId(0)).is_empty());
    }

    #[test]
    fn abort_of_last_pending_contributor_seals_shared_version() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let a = stage(&tree, 1, 7, SubBlockMask(0b01), 1).expect("a");
        let b = stage(&tree, 2, 7, SubBlockMask(0b10), 2).expect("b");
        tree.commit_session(SessionId(1), &[a.entry], &seq, Tick(0))
            .expect("a");
        let sealed = tree.abort_session(SessionId(2), &[b.entry], Tick(1));
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].mask, SubBlockMask(0b01));
    }

    #[test]
    fn newer_commit_supersedes_and_retire_falls_through() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let first = stage(&tree, 1, 4, SubBlockMask::FULL, 1).expect("first");
        tree.commit_session(SessionId(1), &[first.entry], &seq, Tick(0))
            .expect("first");
        let plan = tree
            .plan_write(SessionId(2), BlockNumber(4), SubBlockMask::FULL, 64)
            .expect("plan");
        let WritePlan::NewVersion(ticket) = plan else {
            panic!("committed version cannot be joined");
        };
        assert!(matches!(ticket.seed, SeedSource::Log { entry, .. } if entry == first.entry));
        let InsertOutcome::Created(second) = tree
            .insert_version(SessionId(2), &ticket, SubBlockMask::FULL, 64, slot(2), vec![0; 64])
            .expect("insert")
        else {
            panic!("expected a new version");
        };
        tree.commit_session(SessionId(2), &[second.entry], &seq, Tick(1))
            .expect("second");

        let old = tree.entry(first.entry).expect("old");
        assert!(old.superseded && !old.valid && old.dirty);
        assert_eq!(tree.stats().pending_remap, 1);
        let older = tree.older_committed(BlockNumber(4), CommitSeq(2));
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].entry, first.entry);

        assert!(tree.mark_written_back(second.entry));
        assert!(tree.retire(second.entry));
        assert!(tree.retire(first.entry));
        assert!(matches!(tree.resolve(BlockNumber(4)), Resolution::Base));
        assert_eq!(tree.stats().written_back, 1);
        assert!(tree.is_idle());
    }

    #[test]
    fn reseed_when_block_committed_after_ticket() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let plan = tree
            .plan_write(SessionId(1), BlockNumber(2), SubBlockMask::FULL, 64)
            .expect("plan");
        let WritePlan::NewVersion(stale) = plan else {
            panic!("expected new version");
        };
        let other = stage(&tree, 2, 2, SubBlockMask::FULL, 3).expect("other");
        tree.commit_session(SessionId(2), &[other.entry], &seq, Tick(0))
            .expect("other");
        let outcome = tree
            .insert_version(SessionId(1), &stale, SubBlockMask::FULL, 64, slot(4), vec![0; 64])
            .expect("insert");
        let InsertOutcome::Reseed(fresh) = outcome else {
            panic!("expected reseed");
        };
        assert_eq!(fresh.seen_seq, CommitSeq(1));
    }

    #[test]
    fn failed_block_reports_until_new_commit() {
        let tree = tree();
        let seq = SeqAllocator::default();
        tree.mark_failed(BlockNumber(8), "disk gone".into());
        assert!(matches!(tree.resolve(BlockNumber(8)), Resolution::Failed(_)));
        let v = stage(&tree, 1, 8, SubBlockMask::FULL, 1).expect("stage");
        tree.commit_session(SessionId(1), &[v.entry], &seq, Tick(0))
            .expect("commit");
        assert!(matches!(tree.resolve(BlockNumber(8)), Resolution::Log(_)));
    }

    #[test]
    fn replay_orders_versions_by_commit() {
        let tree = tree();
        let rec = |seq: u64, n: u64| ReplayRecord {
            block: BlockNumber(5),
            target: slot(n),
            commit_seq: CommitSeq(seq),
            mask: SubBlockMask::FULL,
            checksum: 0,
        };
        let old = tree.replay(&rec(3, 1), Tick(0));
        let new = tree.replay(&rec(8, 2), Tick(0));
        assert!(tree.entry(old).expect("old").superseded);
        assert!(tree.is_current(BlockNumber(5), new));
        assert_eq!(tree.logical_size(), 6 * u64::from(BS));
    }

    #[test]
    fn force_copy_candidates_respect_age() {
        let tree = tree();
        let seq = SeqAllocator::default();
        let v = stage(&tree, 1, 1, SubBlockMask::FULL, 1).expect("stage");
        tree.commit_session(SessionId(1), &[v.entry], &seq, Tick(10))
            .expect("commit");
        assert!(tree.force_copy_candidates(Tick(69), 60).is_empty());
        assert_eq!(tree.force_copy_candidates(Tick(70), 60).len(), 1);
        tree.mark_written_back(v.entry);
        assert!(tree.force_copy_candidates(Tick(70), 60).is_empty());
    }
}
