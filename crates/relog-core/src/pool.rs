//! The log pool: segments, commit trees, sessions and allocation.

use crate::config::EngineConfig;
use crate::notifier::ReclaimNotifier;
use crate::session::SessionCore;
use parking_lot::{Mutex, RwLock};
use relog_block::{BlockDevice, TickSource};
use relog_error::{RelogError, Result};
use relog_index::{CommitTree, ResolvedVersion, SealedVersion, SeqAllocator, TreeStats};
use relog_segment::{
    BarrierToken, LogSegment, SegmentLayout, SegmentState, SegmentStats, SlotDescriptor, SlotRef,
};
use relog_types::{BlockNumber, InodeNumber, LogId, SessionId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, trace, warn};

/// Barrier tokens a session holds: one per segment where it has pending
/// contributions. Dropping them re-admits reclamation.
#[derive(Debug, Default)]
pub(crate) struct Admissions {
    tokens: BTreeMap<LogId, BarrierToken>,
}

impl Admissions {
    pub(crate) fn holds(&self, log: LogId) -> bool {
        self.tokens.contains_key(&log)
    }

    pub(crate) fn insert(&mut self, log: LogId, token: BarrierToken) {
        self.tokens.insert(log, token);
    }

    pub(crate) fn remove(&mut self, log: LogId) {
        self.tokens.remove(&log);
    }

    pub(crate) fn release_all(&mut self) {
        self.tokens.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }
}

/// Serializable point-in-time view of the whole pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub current: u8,
    pub remapping: Option<u8>,
    pub last_commit_seq: u64,
    pub reclaim_rounds: u64,
    pub segments: Vec<SegmentStats>,
    pub trees: Vec<TreeStats>,
}

type SessionRegistry = BTreeMap<InodeNumber, BTreeMap<SessionId, Weak<Mutex<SessionCore>>>>;

/// Process-wide engine context: every segment, every commit tree and the
/// reclamation coordinator. Built by recovery, shared through `Arc`.
#[derive(Debug)]
pub struct LogPool {
    pub(crate) config: EngineConfig,
    pub(crate) layout: SegmentLayout,
    pub(crate) segments: Vec<Arc<LogSegment>>,
    pub(crate) current: AtomicUsize,
    pub(crate) to_remap: Mutex<Option<LogId>>,
    pub(crate) trees: RwLock<BTreeMap<InodeNumber, Arc<CommitTree>>>,
    pub(crate) sessions: RwLock<SessionRegistry>,
    pub(crate) seq: SeqAllocator,
    pub(crate) base: Arc<dyn BlockDevice>,
    pub(crate) clock: Arc<dyn TickSource>,
    pub(crate) notifier: ReclaimNotifier,
    pub(crate) reclaim_lock: Mutex<()>,
    next_session: AtomicU64,
}

impl LogPool {
    pub(crate) fn new(
        config: EngineConfig,
        layout: SegmentLayout,
        segments: Vec<Arc<LogSegment>>,
        base: Arc<dyn BlockDevice>,
        clock: Arc<dyn TickSource>,
    ) -> Self {
        Self {
            config,
            layout,
            segments,
            current: AtomicUsize::new(0),
            to_remap: Mutex::new(None),
            trees: RwLock::new(BTreeMap::new()),
            sessions: RwLock::new(BTreeMap::new()),
            seq: SeqAllocator::default(),
            base,
            clock,
            notifier: ReclaimNotifier::new(),
            reclaim_lock: Mutex::new(()),
            next_session: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub(crate) fn now(&self) -> Tick {
        self.clock.now()
    }

    pub(crate) fn block_len(&self) -> usize {
        // Validated to be at most 64 KiB.
        self.config.block_size as usize
    }

    pub(crate) fn segment(&self, log: LogId) -> Result<&Arc<LogSegment>> {
        self.segments
            .get(log.index())
            .ok_or_else(|| RelogError::NotFound(format!("segment {log}")))
    }

    pub(crate) fn check_block(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.base.block_count() {
            return Err(RelogError::InvalidArgument(format!(
                "block {block} beyond base store of {} blocks",
                self.base.block_count()
            )));
        }
        Ok(())
    }

    // ── Trees and sessions ──────────────────────────────────────────────

    pub(crate) fn tree(&self, inode: InodeNumber) -> Option<Arc<CommitTree>> {
        self.trees.read().get(&inode).cloned()
    }

    /// The inode's commit tree, created on first use.
    pub(crate) fn tree_or_create(&self, inode: InodeNumber) -> Arc<CommitTree> {
        if let Some(tree) = self.tree(inode) {
            return tree;
        }
        let mut trees = self.trees.write();
        Arc::clone(trees.entry(inode).or_insert_with(|| {
            debug!(target: "relog::pool", inode = inode.0, "tree_created");
            Arc::new(CommitTree::new(inode, self.config.block_size))
        }))
    }

    pub(crate) fn trees_snapshot(&self) -> Vec<Arc<CommitTree>> {
        self.trees.read().values().cloned().collect()
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub(crate) fn register_session(
        &self,
        inode: InodeNumber,
        id: SessionId,
        core: &Arc<Mutex<SessionCore>>,
    ) {
        self.sessions
            .write()
            .entry(inode)
            .or_default()
            .insert(id, Arc::downgrade(core));
    }

    pub(crate) fn unregister_session(&self, inode: InodeNumber, id: SessionId) {
        let mut sessions = self.sessions.write();
        if let Some(per_inode) = sessions.get_mut(&inode) {
            per_inode.remove(&id);
            if per_inode.is_empty() {
                sessions.remove(&inode);
            }
        }
    }

    pub(crate) fn sessions_of(&self, inode: InodeNumber) -> Vec<Arc<Mutex<SessionCore>>> {
        self.sessions
            .read()
            .get(&inode)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Drop evicted trees that have nothing left outstanding.
    pub(crate) fn drop_idle_evicted(&self) {
        let mut trees = self.trees.write();
        trees.retain(|inode, tree| {
            let keep = !(tree.is_evicted() && tree.is_idle());
            if !keep {
                debug!(target: "relog::pool", inode = inode.0, "tree_dropped");
            }
            keep
        });
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Reserve one slot for a session, round-robin from the current
    /// segment over `Active` segments that admit it.
    ///
    /// When nothing fits, reclaims the fullest segment the session does not
    /// hold and waits for the reclamation round, up to
    /// `allocation_retries` times.
    pub(crate) fn allocate_slot(&self, admissions: &mut Admissions) -> Result<SlotRef> {
        let count = self.segments.len();
        let retries = self.config.retry.allocation_retries;
        for attempt in 1..=retries {
            let start = self.current.load(Ordering::Acquire);
            for step in 0..count {
                let index = (start + step) % count;
                let segment = &self.segments[index];
                if segment.state() != SegmentState::Active {
                    continue;
                }
                let log = segment.id();
                let admitted_now = if admissions.holds(log) {
                    false
                } else if let Some(token) = segment.enter() {
                    admissions.insert(log, token);
                    true
                } else {
                    continue;
                };
                match segment.allocate_slot(self.now()) {
                    Ok(slot) => {
                        if index != start {
                            self.current.store(index, Ordering::Release);
                            debug!(
                                target: "relog::pool",
                                from = start,
                                to = index,
                                "current_rotated"
                            );
                        }
                        return Ok(slot);
                    }
                    Err(RelogError::OutOfSpace { .. }) => {
                        if admitted_now {
                            admissions.remove(log);
                        }
                    }
                    Err(err) => return Err(err),
                }
            }

            let seen = self.notifier.round();
            trace!(target: "relog::pool", attempt, "allocation_stalled");
            if self.reclaim_for_space(admissions) {
                continue;
            }
            if attempt < retries {
                self.notifier
                    .wait_past(seen, self.config.retry.backoff(attempt));
            }
        }
        let remaining = self
            .segments
            .iter()
            .map(|segment| segment.usable_space())
            .max()
            .unwrap_or(0);
        warn!(
            target: "relog::pool",
            retries,
            held = admissions.len(),
            remaining,
            "allocation_out_of_space"
        );
        Err(RelogError::OutOfSpace {
            needed: u64::from(self.config.block_size),
            remaining,
        })
    }

    /// Synchronously reclaim the fullest active segment the caller holds
    /// no token on. Returns whether a segment was freed.
    fn reclaim_for_space(&self, admissions: &Admissions) -> bool {
        let candidate = self
            .segments
            .iter()
            .filter(|segment| {
                !admissions.holds(segment.id())
                    && segment.state() == SegmentState::Active
                    && segment.allocated_slots() > 0
            })
            .max_by_key(|segment| segment.write_cursor())
            .map(|segment| segment.id());
        let Some(log) = candidate else {
            return false;
        };
        match self.reclaim_segment(log, crate::reclaim::ReclaimReason::LowSpace) {
            Ok(_) => true,
            Err(err) => {
                debug!(target: "relog::pool", log = log.0, error = %err, "space_reclaim_skipped");
                false
            }
        }
    }

    // ── Slot images ─────────────────────────────────────────────────────

    /// Read and verify the image of committed entry `entry` of `block`.
    ///
    /// Holds a shared token on the entry's segment while reading, unless
    /// `held` already covers it. An entry retired meanwhile was written
    /// back, so the base store is read instead.
    pub(crate) fn read_entry_image(
        &self,
        tree: &CommitTree,
        block: BlockNumber,
        version: &ResolvedVersion,
        held: Option<&Admissions>,
    ) -> Result<Vec<u8>> {
        let target = version.target;
        let segment = self.segment(target.log_id())?;
        let _token = if held.is_some_and(|admissions| admissions.holds(target.log_id())) {
            None
        } else {
            Some(self.enter_for_read(segment)?)
        };
        if tree.entry(version.entry).is_none() {
            return Ok(self.base.read_block(block)?.into_inner());
        }
        let checksum = version.checksum;
        let mut buf = vec![0_u8; self.block_len()];
        segment.read_slot(target, &mut buf)?;
        let actual = crc32c::crc32c(&buf);
        if actual != checksum {
            warn!(
                target: "relog::pool",
                block = block.0,
                %target,
                expected = checksum,
                actual,
                "log_checksum_mismatch"
            );
            return Err(RelogError::CorruptionDetected {
                block: block.0,
                expected: checksum,
                actual,
            });
        }
        Ok(buf)
    }

    /// A short shared token on `segment`, waiting out a reclamation in
    /// progress.
    fn enter_for_read(&self, segment: &LogSegment) -> Result<BarrierToken> {
        let timeout = self.config.retry.drain_timeout();
        for _ in 0..self.config.retry.allocation_retries {
            if let Some(token) = segment.barrier().enter_timeout(timeout) {
                return Ok(token);
            }
        }
        Err(RelogError::ReclaimBusy {
            log: segment.id().0,
        })
    }

    /// Persist descriptors for versions that just became valid.
    pub(crate) fn seal(&self, inode: InodeNumber, sealed: &[SealedVersion]) -> Result<()> {
        for version in sealed {
            let segment = self.segment(version.target.log_id())?;
            segment.seal_descriptor(&SlotDescriptor {
                generation: segment.generation(),
                inode,
                original_block: version.block,
                target: version.target,
                commit_seq: version.commit_seq,
                dirty_mask: version.mask,
                data_crc: version.checksum,
            })?;
            debug!(
                target: "relog::pool",
                inode = inode.0,
                block = version.block.0,
                target = %version.target,
                seq = version.commit_seq.0,
                "version_sealed"
            );
        }
        Ok(())
    }

    /// Write `data` to the base store with bounded, linearly backed-off
    /// retries.
    pub(crate) fn write_back(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let retries = self.config.retry.write_back_retries;
        let mut attempt = 0_u32;
        loop {
            match self.base.write_block(block, data) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        target: "relog::pool",
                        block = block.0,
                        attempt,
                        error = %err,
                        "write_back_retry"
                    );
                    thread::sleep(self.config.retry.backoff(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Rewrite every segment header and flush segment media.
    pub(crate) fn persist_headers(&self) -> Result<()> {
        for segment in &self.segments {
            segment.persist_header()?;
            segment.sync()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let current = self.current.load(Ordering::Acquire);
        PoolStats {
            current: u8::try_from(current).unwrap_or(u8::MAX),
            remapping: self.to_remap.lock().map(|log| log.0),
            last_commit_seq: self.seq.current().0,
            reclaim_rounds: self.notifier.round(),
            segments: self.segments.iter().map(|segment| segment.stats()).collect(),
            trees: self
                .trees_snapshot()
                .iter()
                .map(|tree| tree.stats())
                .collect(),
        }
    }
}
