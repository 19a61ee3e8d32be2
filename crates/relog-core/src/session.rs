//! Per-open-file write sessions.
//!
//! A [`FileSession`] stages writes into in-flight versions of its inode's
//! commit tree and commits them as one unit. Outside an explicit
//! transaction the unit is everything written since the last commit,
//! committed by [`FileSession::commit`], `close_session` or `sync`.

use crate::config::ConflictGranularity;
use crate::pool::{Admissions, LogPool};
use parking_lot::Mutex;
use relog_error::{RelogError, Result};
use relog_index::{
    CommitError, CommitTree, InsertOutcome, NewVersionTicket, Resolution, ResolvedVersion,
    SeedSource, StagedVersion, WritePlan,
};
use relog_types::{
    BlockNumber, EntryId, InodeNumber, LogId, MAX_LOGS, SessionId, SubBlockMask, Tick,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// How many times a new version is re-seeded before the write gives up.
const RESEED_LIMIT: usize = 4;

/// Where the current contents of a block live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Location {
    /// A slot of log segment `log`; `offset` is the media block index.
    Log { log: LogId, offset: u64 },
    BaseStore,
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    entry: EntryId,
    block: BlockNumber,
}

#[derive(Debug, Clone, Copy)]
struct CachedRead {
    block: BlockNumber,
    location: Location,
    epoch: u64,
}

/// Mutable session state, shared with the pool so `sync` can commit it.
#[derive(Debug)]
pub(crate) struct SessionCore {
    id: SessionId,
    inode: InodeNumber,
    tree: Arc<CommitTree>,
    /// Versions with a pending share, in program order.
    pending: Vec<PendingWrite>,
    /// Versions this session committed that are still tracked.
    owned: BTreeSet<EntryId>,
    log_writes: [u64; MAX_LOGS],
    admissions: Admissions,
    in_transaction: bool,
    start_time: Tick,
    last_read: Option<CachedRead>,
    closed: bool,
}

impl SessionCore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(RelogError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn mask_for(&self, pool: &LogPool, offset: u32, len: usize) -> Result<SubBlockMask> {
        let len = u32::try_from(len)
            .map_err(|_| RelogError::InvalidArgument(format!("write of {len} bytes")))?;
        let end = offset.checked_add(len).ok_or_else(|| {
            RelogError::InvalidArgument(format!("range {offset}+{len} overflows"))
        })?;
        let mask = SubBlockMask::for_range(&(offset..end), pool.config.block_size)
            .map_err(|err| RelogError::InvalidArgument(err.to_string()))?;
        Ok(match pool.config.conflict_granularity {
            ConflictGranularity::SubBlock => mask,
            ConflictGranularity::WholeBlock => SubBlockMask::FULL,
        })
    }

    pub(crate) fn write(
        &mut self,
        pool: &LogPool,
        block: BlockNumber,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        pool.check_block(block)?;
        let mask = self.mask_for(pool, offset, data.len())?;
        let end = block.0 * u64::from(pool.config.block_size)
            + u64::from(offset)
            + data.len() as u64;
        let staged = self.stage(pool, block, mask, end)?;
        self.note_pending(staged.entry, block);

        let written = {
            let mut image = staged.image.lock();
            image.patch(self.id, offset as usize, data).and_then(|()| {
                pool.segment(staged.target.log_id())?
                    .write_slot(staged.target, image.bytes())
            })
        };
        if let Err(err) = written {
            warn!(
                target: "relog::session",
                session = self.id.0,
                block = block.0,
                error = %err,
                "staged_write_failed"
            );
            if let Err(abort_err) = self.abort(pool) {
                warn!(
                    target: "relog::session",
                    session = self.id.0,
                    error = %abort_err,
                    "abort_after_failure_failed"
                );
            }
            return Err(err);
        }

        self.log_writes[staged.target.log_id().index()] += 1;
        if self.last_read.is_some_and(|cached| cached.block == block) {
            self.last_read = None;
        }
        trace!(
            target: "relog::session",
            session = self.id.0,
            block = block.0,
            offset,
            len = data.len(),
            target = %staged.target,
            "write_staged"
        );
        Ok(())
    }

    fn note_pending(&mut self, entry: EntryId, block: BlockNumber) {
        if !self.pending.iter().any(|p| p.entry == entry) {
            self.pending.push(PendingWrite { entry, block });
        }
    }

    /// Find or create the version this write lands in.
    fn stage(
        &mut self,
        pool: &LogPool,
        block: BlockNumber,
        mask: SubBlockMask,
        end: u64,
    ) -> Result<StagedVersion> {
        let tree = Arc::clone(&self.tree);
        let plan = match self.plan(pool, &tree, block, mask, end) {
            Ok(plan) => plan,
            Err(err) => return Err(self.conflict(pool, &err)),
        };
        let mut ticket = match plan {
            WritePlan::Join(staged) => return self.admit_joined(pool, staged),
            WritePlan::NewVersion(ticket) => ticket,
        };
        let slot = pool.allocate_slot(&mut self.admissions)?;
        for _ in 0..RESEED_LIMIT {
            let seed = self.read_seed(pool, &ticket)?;
            match tree.insert_version(self.id, &ticket, mask, end, slot.target, seed) {
                Ok(InsertOutcome::Created(staged)) => return Ok(staged),
                Ok(InsertOutcome::Joined(staged)) => return self.admit_joined(pool, staged),
                Ok(InsertOutcome::Reseed(fresh)) => {
                    trace!(
                        target: "relog::session",
                        session = self.id.0,
                        block = block.0,
                        "version_reseeded"
                    );
                    ticket = fresh;
                }
                Err(err) => return Err(self.conflict(pool, &err)),
            }
        }
        Err(self.conflict(pool, &CommitError::Sealing { block }))
    }

    /// Plan a write, waiting out a version of `block` that is sealing
    /// under other sessions' pending contributions.
    fn plan(
        &self,
        pool: &LogPool,
        tree: &CommitTree,
        block: BlockNumber,
        mask: SubBlockMask,
        end: u64,
    ) -> std::result::Result<WritePlan, CommitError> {
        let retries = pool.config.retry.allocation_retries;
        let mut attempt = 0_u32;
        loop {
            match tree.plan_write(self.id, block, mask, end) {
                Err(CommitError::Sealing { .. }) if attempt < retries => {
                    attempt += 1;
                    trace!(
                        target: "relog::session",
                        session = self.id.0,
                        block = block.0,
                        attempt,
                        "sealing_wait"
                    );
                    thread::sleep(pool.config.retry.backoff(attempt));
                }
                other => return other,
            }
        }
    }

    fn read_seed(&self, pool: &LogPool, ticket: &NewVersionTicket) -> Result<Vec<u8>> {
        match ticket.seed {
            SeedSource::Base => Ok(pool.base.read_block(ticket.block)?.into_inner()),
            SeedSource::Log {
                entry,
                target,
                checksum,
            } => pool.read_entry_image(
                &self.tree,
                ticket.block,
                &ResolvedVersion {
                    entry,
                    target,
                    checksum,
                    commit_seq: ticket.seen_seq,
                },
                Some(&self.admissions),
            ),
        }
    }

    /// Make sure the session holds a token on the segment of a version it
    /// joined, so the version cannot be reclaimed under it.
    fn admit_joined(&mut self, pool: &LogPool, staged: StagedVersion) -> Result<StagedVersion> {
        let log = staged.target.log_id();
        if self.admissions.holds(log) {
            return Ok(staged);
        }
        let segment = pool.segment(log)?;
        let timeout = pool.config.retry.drain_timeout();
        for _ in 0..pool.config.retry.allocation_retries {
            if let Some(token) = segment.barrier().enter_timeout(timeout) {
                self.admissions.insert(log, token);
                return Ok(staged);
            }
        }
        // The share was registered but nothing was patched yet.
        let sealed = self
            .tree
            .abort_session(self.id, &[staged.entry], pool.now());
        pool.seal(self.inode, &sealed)?;
        warn!(target: "relog::session", session = self.id.0, log = log.0, "join_admission_timeout");
        Err(RelogError::ReclaimBusy { log: log.0 })
    }

    /// Abort everything pending and turn `err` into `ConflictAborted`.
    fn conflict(&mut self, pool: &LogPool, err: &CommitError) -> RelogError {
        if let Err(abort_err) = self.abort(pool) {
            warn!(
                target: "relog::session",
                session = self.id.0,
                error = %abort_err,
                "abort_after_conflict_failed"
            );
        }
        debug!(
            target: "relog::session",
            session = self.id.0,
            inode = self.inode.0,
            reason = %err,
            "conflict_aborted"
        );
        RelogError::ConflictAborted {
            inode: self.inode.0,
            block: err.block().0,
        }
    }

    pub(crate) fn commit(&mut self, pool: &LogPool) -> Result<()> {
        self.ensure_open()?;
        if self.pending.is_empty() {
            self.in_transaction = false;
            self.admissions.release_all();
            return Ok(());
        }
        let entries: Vec<EntryId> = self.pending.iter().map(|p| p.entry).collect();
        let report = match self
            .tree
            .commit_session(self.id, &entries, &pool.seq, pool.now())
        {
            Ok(report) => report,
            Err(err) => return Err(self.conflict(pool, &err)),
        };
        let sealed = pool.seal(self.inode, &report.sealed);
        self.owned.extend(entries);
        let tree = Arc::clone(&self.tree);
        self.owned.retain(|id| tree.entry(*id).is_some());
        self.pending.clear();
        self.admissions.release_all();
        self.in_transaction = false;
        debug!(
            target: "relog::session",
            session = self.id.0,
            inode = self.inode.0,
            reserved = report.reserved.len(),
            sealed = report.sealed.len(),
            "session_committed"
        );
        sealed
    }

    /// Roll back every pending share. Shared images get the session's
    /// granules restored and are rewritten before the share is withdrawn.
    pub(crate) fn abort(&mut self, pool: &LogPool) -> Result<()> {
        let entries: Vec<EntryId> = self.pending.iter().map(|p| p.entry).collect();
        let mut first_err = None;
        for pending in &self.pending {
            let Some((share, staged)) = self.tree.pending_share(self.id, pending.entry) else {
                continue;
            };
            let mut image = staged.image.lock();
            image.restore(self.id, share.mask);
            let rewritten = pool
                .segment(staged.target.log_id())
                .and_then(|segment| segment.write_slot(staged.target, image.bytes()));
            if let Err(err) = rewritten {
                warn!(
                    target: "relog::session",
                    session = self.id.0,
                    block = pending.block.0,
                    error = %err,
                    "image_restore_failed"
                );
                first_err.get_or_insert(err);
            }
        }
        let sealed = self.tree.abort_session(self.id, &entries, pool.now());
        let sealed = pool.seal(self.inode, &sealed);
        self.pending.clear();
        self.admissions.release_all();
        self.in_transaction = false;
        self.last_read = None;
        debug!(
            target: "relog::session",
            session = self.id.0,
            inode = self.inode.0,
            withdrawn = entries.len(),
            "session_aborted"
        );
        match first_err {
            Some(err) => Err(err),
            None => sealed,
        }
    }

    fn resolve(&self, block: BlockNumber) -> Resolution {
        self.tree.resolve_for(self.id, block)
    }

    pub(crate) fn read(&mut self, pool: &LogPool, block: BlockNumber) -> Result<Location> {
        self.ensure_open()?;
        pool.check_block(block)?;
        let epoch = self.tree.epoch();
        if let Some(cached) = self.last_read {
            if cached.block == block
                && cached.epoch == epoch
                && !self.pending.iter().any(|p| p.block == block)
            {
                return Ok(cached.location);
            }
        }
        let location = match self.resolve(block) {
            Resolution::Staged(staged) => {
                return Ok(Location::Log {
                    log: staged.target.log_id(),
                    offset: staged.target.offset(),
                });
            }
            Resolution::Log(version) => Location::Log {
                log: version.target.log_id(),
                offset: version.target.offset(),
            },
            Resolution::Base => Location::BaseStore,
            Resolution::Failed(detail) => {
                return Err(RelogError::WriteBackFailed {
                    block: block.0,
                    detail,
                });
            }
        };
        self.last_read = Some(CachedRead {
            block,
            location,
            epoch,
        });
        Ok(location)
    }

    pub(crate) fn read_block(&self, pool: &LogPool, block: BlockNumber) -> Result<Vec<u8>> {
        self.ensure_open()?;
        pool.check_block(block)?;
        match self.resolve(block) {
            Resolution::Staged(staged) => Ok(staged.image.lock().bytes().to_vec()),
            Resolution::Log(version) => {
                pool.read_entry_image(&self.tree, block, &version, Some(&self.admissions))
            }
            Resolution::Base => Ok(pool.base.read_block(block)?.into_inner()),
            Resolution::Failed(detail) => Err(RelogError::WriteBackFailed {
                block: block.0,
                detail,
            }),
        }
    }
}

/// A writer's handle on one inode.
///
/// Dropping a session that was not closed aborts its pending writes.
#[derive(Debug)]
pub struct FileSession {
    pool: Arc<LogPool>,
    core: Arc<Mutex<SessionCore>>,
    id: SessionId,
    inode: InodeNumber,
}

impl FileSession {
    pub(crate) fn open(pool: Arc<LogPool>, inode: InodeNumber) -> Self {
        let id = pool.next_session_id();
        let tree = pool.tree_or_create(inode);
        tree.register_session(id);
        let core = Arc::new(Mutex::new(SessionCore {
            id,
            inode,
            tree,
            pending: Vec::new(),
            owned: BTreeSet::new(),
            log_writes: [0; MAX_LOGS],
            admissions: Admissions::default(),
            in_transaction: false,
            start_time: pool.now(),
            last_read: None,
            closed: false,
        }));
        pool.register_session(inode, id, &core);
        debug!(target: "relog::session", session = id.0, inode = inode.0, "session_opened");
        Self {
            pool,
            core,
            id,
            inode,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        self.inode
    }

    #[must_use]
    pub fn start_time(&self) -> Tick {
        self.core.lock().start_time
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.core.lock().in_transaction
    }

    /// Versions this session has pending shares in.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.core.lock().pending.len()
    }

    /// Writes staged into segment `log` over the session's lifetime.
    #[must_use]
    pub fn log_writes(&self, log: LogId) -> u64 {
        self.core
            .lock()
            .log_writes
            .get(log.index())
            .copied()
            .unwrap_or(0)
    }

    /// Versions this session committed that are still tracked.
    #[must_use]
    pub fn owned_versions(&self) -> usize {
        self.core.lock().owned.len()
    }

    /// Start an explicit transaction; its writes commit together on
    /// [`commit`](Self::commit).
    pub fn begin_transaction(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.ensure_open()?;
        if core.in_transaction {
            return Err(RelogError::InvalidArgument(format!(
                "session {} already has an open transaction",
                self.id.0
            )));
        }
        core.in_transaction = true;
        Ok(())
    }

    /// Stage `data` at byte `offset` of `block`.
    pub fn write(&self, block: BlockNumber, offset: u32, data: &[u8]) -> Result<()> {
        self.core.lock().write(&self.pool, block, offset, data)
    }

    /// Where `block` currently lives; the session's own staged write wins.
    pub fn read(&self, block: BlockNumber) -> Result<Location> {
        self.core.lock().read(&self.pool, block)
    }

    /// Contents of `block` as this session sees them.
    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        self.core.lock().read_block(&self.pool, block)
    }

    pub fn commit(&self) -> Result<()> {
        self.core.lock().commit(&self.pool)
    }

    pub fn abort(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.ensure_open()?;
        core.abort(&self.pool)
    }

    /// Commit pending writes and release the session.
    pub(crate) fn close(self) -> Result<()> {
        let result = {
            let mut core = self.core.lock();
            let result = core.commit(&self.pool);
            core.closed = true;
            result
        };
        debug!(
            target: "relog::session",
            session = self.id.0,
            inode = self.inode.0,
            ok = result.is_ok(),
            "session_closed"
        );
        result
    }
}

impl Drop for FileSession {
    fn drop(&mut self) {
        let tree = {
            let mut core = self.core.lock();
            if !core.closed {
                if !core.pending.is_empty() {
                    if let Err(err) = core.abort(&self.pool) {
                        warn!(
                            target: "relog::session",
                            session = self.id.0,
                            error = %err,
                            "drop_abort_failed"
                        );
                    }
                }
                core.closed = true;
            }
            Arc::clone(&core.tree)
        };
        tree.unregister_session(self.id);
        self.pool.unregister_session(self.inode, self.id);
    }
}
