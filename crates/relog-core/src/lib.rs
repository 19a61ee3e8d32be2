#![forbid(unsafe_code)]
//! The relog engine: redirect-on-write logging in front of a block store.
//!
//! Writes never touch the base store directly. Each write lands in a fresh
//! slot of one of `K` log segments, tracked by the inode's commit tree;
//! reads follow the newest committed redirection; reclamation later copies
//! committed data back and recycles the segment.
//!
//! [`Engine`] is the filesystem-call surface. [`FileSession`] is a writer's
//! handle on one inode.

pub mod config;
pub mod notifier;
pub mod pool;
pub mod reclaim;
pub mod recovery;
pub mod session;

pub use config::{ConflictGranularity, EngineConfig, ReclaimThresholds, RemapPolicy, RetryPolicy};
pub use notifier::ReclaimNotifier;
pub use pool::{LogPool, PoolStats};
pub use reclaim::{ReclaimReason, ReclaimReport, ReclaimerHandle, TickReport};
pub use recovery::RecoveryReport;
pub use session::{FileSession, Location};

pub use relog_block::{
    BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, ManualClock, MemBlockDevice,
    MemByteDevice, MonotonicClock, TickSource,
};
pub use relog_error::{RelogError, Result};
pub use relog_segment::{SegmentLayout, SegmentState, SegmentStats};
pub use relog_types::{BlockNumber, InodeNumber, LogId, SessionId, Tick};

use relog_index::Resolution;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A running engine over one base store and its segment media.
#[derive(Debug, Clone)]
pub struct Engine {
    pool: Arc<LogPool>,
    recovery: Arc<RecoveryReport>,
}

impl Engine {
    /// Open the engine, formatting blank segment media and replaying every
    /// committed descriptor found on the rest.
    pub fn open(
        config: EngineConfig,
        base: Arc<dyn BlockDevice>,
        media: Vec<Arc<dyn ByteDevice>>,
        clock: Arc<dyn TickSource>,
    ) -> Result<Self> {
        let (pool, recovery) = recovery::recover(config, base, media, clock)?;
        Ok(Self {
            pool: Arc::new(pool),
            recovery: Arc::new(recovery),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.pool.config()
    }

    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<LogPool> {
        &self.pool
    }

    /// Write `data` over byte `range` of `block` as a single committed
    /// unit. Fails with `ConflictAborted` when a concurrent writer of an
    /// overlapping sub-range committed first.
    pub fn write(
        &self,
        inode: InodeNumber,
        block: BlockNumber,
        range: Range<u32>,
        data: &[u8],
    ) -> Result<()> {
        if range.len() != data.len() {
            return Err(RelogError::InvalidArgument(format!(
                "range {range:?} does not match {} bytes of data",
                data.len()
            )));
        }
        let session = self.open_session(inode);
        session.write(block, range.start, data)?;
        self.close_session(session)
    }

    /// Where the committed contents of `block` live.
    pub fn read(&self, inode: InodeNumber, block: BlockNumber) -> Result<Location> {
        self.pool.check_block(block)?;
        let Some(tree) = self.pool.tree(inode) else {
            return Ok(Location::BaseStore);
        };
        match tree.resolve(block) {
            Resolution::Log(version) => Ok(Location::Log {
                log: version.target.log_id(),
                offset: version.target.offset(),
            }),
            Resolution::Failed(detail) => Err(RelogError::WriteBackFailed {
                block: block.0,
                detail,
            }),
            Resolution::Base | Resolution::Staged(_) => {
                Ok(Location::BaseStore)
            }
        }
    }

    /// Committed contents of `block`, checksum-verified when read from a
    /// log segment.
    pub fn read_block(&self, inode: InodeNumber, block: BlockNumber) -> Result<Vec<u8>> {
        self.pool.check_block(block)?;
        let Some(tree) = self.pool.tree(inode) else {
            return Ok(self.pool.base.read_block(block)?.into_inner());
        };
        match tree.resolve(block) {
            Resolution::Log(version) => {
                self.pool.read_entry_image(&tree, block, &version, None)
            }
            Resolution::Failed(detail) => Err(RelogError::WriteBackFailed {
                block: block.0,
                detail,
            }),
            Resolution::Base | Resolution::Staged(_) => {
                Ok(self.pool.base.read_block(block)?.into_inner())
            }
        }
    }

    #[must_use]
    pub fn open_session(&self, inode: InodeNumber) -> FileSession {
        FileSession::open(Arc::clone(&self.pool), inode)
    }

    /// Commit the session's pending writes and release it.
    pub fn close_session(&self, session: FileSession) -> Result<()> {
        session.close()
    }

    /// Commit every open session's pending writes on `inode` and flush the
    /// segment media. Returns the first commit failure after trying all.
    pub fn sync(&self, inode: InodeNumber) -> Result<()> {
        let mut first_err = None;
        let sessions = self.pool.sessions_of(inode);
        for core in &sessions {
            let mut core = core.lock();
            if let Err(err) = core.commit(&self.pool) {
                if !matches!(err, RelogError::SessionClosed) {
                    first_err.get_or_insert(err);
                }
            }
        }
        self.pool.persist_headers()?;
        debug!(target: "relog::engine", inode = inode.0, sessions = sessions.len(), "inode_synced");
        first_err.map_or(Ok(()), Err)
    }

    /// Forget an inode once nothing references it. Returns whether the tree
    /// was dropped now; otherwise it is dropped after its last entry is
    /// reclaimed and its last session closes.
    pub fn evict_inode(&self, inode: InodeNumber) -> bool {
        let Some(tree) = self.pool.tree(inode) else {
            return true;
        };
        tree.mark_evicted();
        self.pool.drop_idle_evicted();
        let dropped = self.pool.tree(inode).is_none();
        debug!(target: "relog::engine", inode = inode.0, dropped, "inode_evicted");
        dropped
    }

    /// Largest committed byte end written to `inode`.
    #[must_use]
    pub fn logical_size(&self, inode: InodeNumber) -> u64 {
        self.pool.tree(inode).map_or(0, |tree| tree.logical_size())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run one reclamation scheduler pass.
    pub fn tick(&self) -> Result<TickReport> {
        self.pool.tick()
    }

    /// Reclaim segment `log` now, waiting for in-flight writers to drain.
    pub fn reclaim_segment(&self, log: LogId) -> Result<ReclaimReport> {
        self.pool.reclaim_segment(log, ReclaimReason::Manual)
    }

    /// Run [`tick`](Self::tick) every `interval` on a background thread.
    pub fn spawn_reclaimer(&self, interval: Duration) -> Result<ReclaimerHandle> {
        ReclaimerHandle::spawn(Arc::clone(&self.pool), interval)
    }

    /// Flush every segment header and the base store.
    pub fn shutdown(&self) -> Result<()> {
        self.pool.persist_headers()?;
        self.pool.base.sync()?;
        info!(target: "relog::engine", "engine_shutdown");
        Ok(())
    }
}

/// Base store and segment media held in memory. Clones share bytes, so an
/// engine can be dropped and reopened over the same store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pub base: MemBlockDevice,
    pub media: Vec<MemByteDevice>,
}

impl MemoryStore {
    /// Blank media sized for `config`, over a base store of `base_blocks`.
    pub fn new(config: &EngineConfig, base_blocks: u64) -> Result<Self> {
        config.validate()?;
        let len = usize::try_from(config.layout()?.media_len())
            .map_err(|_| RelogError::InvalidConfig("segment media exceeds memory".to_owned()))?;
        Ok(Self {
            base: MemBlockDevice::new(config.block_size, base_blocks),
            media: (0..config.log_count).map(|_| MemByteDevice::new(len)).collect(),
        })
    }

    pub fn open(&self, config: EngineConfig, clock: Arc<dyn TickSource>) -> Result<Engine> {
        let media = self
            .media
            .iter()
            .map(|device| Arc::new(device.clone()) as Arc<dyn ByteDevice>)
            .collect();
        Engine::open(config, Arc::new(self.base.clone()), media, clock)
    }
}
