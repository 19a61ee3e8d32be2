//! Segment reclamation and eager write-back.
//!
//! Reclaiming a segment walks it through
//! `Active -> RemapPending -> Remapping -> RemapReady -> Free -> Active`:
//! new admissions stop, in-flight transactions drain, every member entry is
//! written back (or dropped when it no longer holds the newest data), the
//! base store is flushed and only then is the segment reset.
//!
//! All base-store writes, reclamation and `ForceCopy` alike, run under the
//! pool's reclaim lock, so an older version can never overwrite a newer
//! one in the base store.

use crate::config::RemapPolicy;
use crate::pool::LogPool;
use relog_error::{RelogError, Result};
use relog_index::{CommitTree, MemberSnapshot};
use relog_segment::{LogSegment, SegmentState};
use relog_types::{LogId, Tick};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Why a segment is being reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimReason {
    /// Usable space fell under the guard.
    LowSpace,
    /// Oldest allocation passed the soft threshold and nothing is in flight.
    SoftStale,
    /// Oldest allocation passed the hard threshold.
    HardStale,
    /// Enough slots are allocated to make a batch worthwhile.
    MinBatch,
    /// Requested explicitly.
    Manual,
}

impl ReclaimReason {
    /// Forcing reasons wait for in-flight transactions to drain; the soft
    /// trigger only proceeds when the segment is already idle.
    #[must_use]
    pub fn is_forcing(self) -> bool {
        !matches!(self, Self::SoftStale)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub log: u8,
    pub reason: ReclaimReason,
    /// Generation the segment was reset to.
    pub generation: u64,
    pub written_back: usize,
    pub retired: usize,
    pub failed: usize,
    pub tombstoned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub force_copied: usize,
    pub reclaimed: Vec<ReclaimReport>,
    /// Segments whose trigger fired but could not be reclaimed yet.
    pub deferred: Vec<u8>,
}

impl LogPool {
    /// The trigger that currently applies to `segment`, if any.
    pub(crate) fn trigger_for(&self, segment: &LogSegment, now: Tick) -> Option<ReclaimReason> {
        if segment.state() != SegmentState::Active || segment.allocated_slots() == 0 {
            return None;
        }
        let thresholds = &self.config.thresholds;
        let age = segment.age(now).unwrap_or(0);
        if segment.is_low_space() {
            Some(ReclaimReason::LowSpace)
        } else if age >= thresholds.hard_stale {
            Some(ReclaimReason::HardStale)
        } else if segment.allocated_slots() >= thresholds.min_batch {
            Some(ReclaimReason::MinBatch)
        } else if age >= thresholds.soft_stale && segment.inflight() == 0 {
            Some(ReclaimReason::SoftStale)
        } else {
            None
        }
    }

    /// One scheduler pass: eager write-back under `ForceCopy`, then every
    /// segment whose trigger fired. Busy segments are retried next tick.
    pub fn tick(&self) -> Result<TickReport> {
        let now = self.now();
        let mut report = TickReport::default();
        if self.config.remap_policy == RemapPolicy::ForceCopy {
            report.force_copied = self.force_copy(now)?;
        }
        for segment in &self.segments {
            let Some(reason) = self.trigger_for(segment, now) else {
                continue;
            };
            match self.reclaim_segment(segment.id(), reason) {
                Ok(done) => report.reclaimed.push(done),
                Err(RelogError::ReclaimBusy { log }) => {
                    debug!(target: "relog::reclaim", log, ?reason, "reclaim_deferred");
                    report.deferred.push(log);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Reclaim segment `log`.
    ///
    /// Fails with `ReclaimBusy`, leaving the segment `Active`, when another
    /// reclamation holds the lock or in-flight transactions do not drain.
    pub fn reclaim_segment(&self, log: LogId, reason: ReclaimReason) -> Result<ReclaimReport> {
        let drain = self.config.retry.drain_timeout();
        let Some(_reclaiming) = self.reclaim_lock.try_lock_for(drain) else {
            return Err(RelogError::ReclaimBusy { log: log.0 });
        };
        let segment = Arc::clone(self.segment(log)?);
        segment.transition(SegmentState::Active, SegmentState::RemapPending)?;
        self.rotate_away_from(log);

        let drained = if reason.is_forcing() {
            segment.barrier().acquire_exclusive(drain)
        } else {
            segment.barrier().try_acquire_exclusive()
        };
        let trees = self.trees_snapshot();
        let staged_member = drained
            && trees
                .iter()
                .any(|tree| tree.members_of(log).iter().any(|m| m.staged));
        if !drained || staged_member {
            if drained {
                segment.barrier().release_exclusive();
            }
            segment.transition(SegmentState::RemapPending, SegmentState::Active)?;
            warn!(
                target: "relog::reclaim",
                log = log.0,
                ?reason,
                inflight = segment.inflight(),
                staged_member,
                "reclaim_drain_timeout"
            );
            return Err(RelogError::ReclaimBusy { log: log.0 });
        }

        *self.to_remap.lock() = Some(log);
        info!(
            target: "relog::reclaim",
            log = log.0,
            ?reason,
            generation = segment.generation(),
            slots = segment.allocated_slots(),
            "reclaim_start"
        );
        let result = self.remap_members(&segment, &trees, reason);
        segment.barrier().release_exclusive();
        *self.to_remap.lock() = None;
        let report = result?;
        self.notifier.notify_reclaimed();
        self.drop_idle_evicted();
        info!(
            target: "relog::reclaim",
            log = log.0,
            generation = report.generation,
            written_back = report.written_back,
            retired = report.retired,
            failed = report.failed,
            "reclaim_complete"
        );
        Ok(report)
    }

    /// Point `current` at the next active segment if it names `log`.
    fn rotate_away_from(&self, log: LogId) {
        let count = self.segments.len();
        if self.current.load(Ordering::Acquire) != log.index() {
            return;
        }
        for step in 1..count {
            let index = (log.index() + step) % count;
            if self.segments[index].state() == SegmentState::Active {
                self.current.store(index, Ordering::Release);
                debug!(target: "relog::reclaim", from = log.0, to = index, "current_rotated");
                return;
            }
        }
    }

    /// Drain every member of an exclusively held segment and reset it.
    fn remap_members(
        &self,
        segment: &LogSegment,
        trees: &[Arc<CommitTree>],
        reason: ReclaimReason,
    ) -> Result<ReclaimReport> {
        let log = segment.id();
        segment.transition(SegmentState::RemapPending, SegmentState::Remapping)?;
        segment.persist_header()?;

        let mut report = ReclaimReport {
            log: log.0,
            reason,
            generation: 0,
            written_back: 0,
            retired: 0,
            failed: 0,
            tombstoned: 0,
        };
        for tree in trees {
            for member in tree.members_of(log) {
                if member.valid && member.dirty {
                    match self.copy_back(segment, tree, &member) {
                        Ok(()) => {
                            tree.mark_written_back(member.entry);
                            report.written_back += 1;
                            report.tombstoned += self.drop_older(tree, &member, Some(log))?;
                        }
                        Err(err) => {
                            error!(
                                target: "relog::reclaim",
                                inode = tree.inode().0,
                                block = member.block.0,
                                target = %member.target,
                                error = %err,
                                "write_back_failed"
                            );
                            tree.mark_failed(member.block, err.to_string());
                            report.failed += 1;
                        }
                    }
                }
                if tree.retire(member.entry) {
                    report.retired += 1;
                }
            }
        }

        self.base.sync()?;
        segment.transition(SegmentState::Remapping, SegmentState::RemapReady)?;
        segment.reset()?;
        segment.transition(SegmentState::Free, SegmentState::Active)?;
        report.generation = segment.generation();
        Ok(report)
    }

    /// Read a member's slot, verify it and write it to the base store.
    fn copy_back(
        &self,
        segment: &LogSegment,
        tree: &CommitTree,
        member: &MemberSnapshot,
    ) -> Result<()> {
        let mut buf = vec![0_u8; self.block_len()];
        segment.read_slot(member.target, &mut buf)?;
        let actual = crc32c::crc32c(&buf);
        if actual != member.checksum {
            return Err(RelogError::CorruptionDetected {
                block: member.block.0,
                expected: member.checksum,
                actual,
            });
        }
        self.write_back(member.block, &buf)?;
        trace!(
            target: "relog::reclaim",
            inode = tree.inode().0,
            block = member.block.0,
            target = %member.target,
            "written_back"
        );
        Ok(())
    }

    /// Tombstone and retire versions of `member.block` older than the one
    /// just written back. Versions in `skip` are left to its reset.
    fn drop_older(
        &self,
        tree: &CommitTree,
        member: &MemberSnapshot,
        skip: Option<LogId>,
    ) -> Result<usize> {
        let Some(seq) = member.commit_seq else {
            return Ok(0);
        };
        let mut tombstoned = 0;
        for older in tree.older_committed(member.block, seq) {
            let older_log = older.target.log_id();
            if Some(older_log) != skip {
                self.segment(older_log)?.tombstone_descriptor(older.target)?;
                tombstoned += 1;
            }
            tree.retire(older.entry);
        }
        Ok(tombstoned)
    }

    /// `ForceCopy`: write back valid entries that have been eligible for
    /// `force_copy_age` ticks. They stay in the log, now clean.
    pub(crate) fn force_copy(&self, now: Tick) -> Result<usize> {
        let Some(_reclaiming) = self.reclaim_lock.try_lock() else {
            return Ok(0);
        };
        let age = self.config.thresholds.force_copy_age;
        let mut copied = 0;
        for tree in self.trees_snapshot() {
            for member in tree.force_copy_candidates(now, age) {
                let segment = self.segment(member.target.log_id())?;
                let Some(_token) = segment.enter() else {
                    continue;
                };
                if !tree.is_current(member.block, member.entry) {
                    continue;
                }
                match self.copy_back(segment, &tree, &member) {
                    Ok(()) => {
                        tree.mark_written_back(member.entry);
                        self.drop_older(&tree, &member, None)?;
                        copied += 1;
                    }
                    Err(err) => warn!(
                        target: "relog::reclaim",
                        inode = tree.inode().0,
                        block = member.block.0,
                        error = %err,
                        "force_copy_failed"
                    ),
                }
            }
        }
        if copied > 0 {
            self.base.sync()?;
            debug!(target: "relog::reclaim", copied, "force_copy_round");
        }
        Ok(copied)
    }
}

/// Background reclamation thread; stopped and joined on drop.
#[derive(Debug)]
pub struct ReclaimerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReclaimerHandle {
    pub(crate) fn spawn(pool: Arc<LogPool>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("relog-reclaimer".to_owned())
            .spawn(move || {
                info!(
                    target: "relog::reclaim",
                    interval_ms = interval.as_millis(),
                    "reclaimer_started"
                );
                while !flag.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = pool.tick() {
                        warn!(target: "relog::reclaim", error = %err, "reclaimer_tick_failed");
                    }
                }
                info!(target: "relog::reclaim", "reclaimer_stopped");
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                error!(target: "relog::reclaim", "reclaimer_panicked");
            }
        }
    }
}

impl Drop for ReclaimerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
