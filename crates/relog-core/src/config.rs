//! Runtime configuration.
//!
//! Every structural bound that the tagged address format relies on is
//! checked once here, in [`EngineConfig::validate`]; the hot paths never
//! re-check them.

use relog_error::{RelogError, Result};
use relog_segment::SegmentLayout;
use relog_types::{MAX_LOGS, MAX_SEGMENT_BLOCKS, SUB_BLOCKS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How finely concurrent writes to one block are told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictGranularity {
    /// 64 sub-ranges per block.
    #[default]
    SubBlock,
    /// Any two writes to the same block overlap.
    WholeBlock,
}

/// When committed log data is copied back to the base store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemapPolicy {
    /// Only when the entry's segment is reclaimed.
    #[default]
    Lazy,
    /// Also eagerly, once an entry has been eligible for `force_copy_age`.
    ForceCopy,
}

/// Reclamation triggers, in clock ticks and entry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimThresholds {
    /// Oldest allocation age that makes an idle segment worth reclaiming.
    pub soft_stale: u64,
    /// Oldest allocation age that forces reclamation regardless of load.
    pub hard_stale: u64,
    /// Eligibility age after which `ForceCopy` writes an entry back.
    pub force_copy_age: u64,
    /// Allocated slots that make a reclamation batch worthwhile.
    pub min_batch: u64,
}

impl Default for ReclaimThresholds {
    fn default() -> Self {
        Self {
            soft_stale: 60,
            hard_stale: 200,
            force_copy_age: 60,
            min_batch: 256,
        }
    }
}

/// Bounded retry behaviour for allocation and write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub write_back_retries: u32,
    pub allocation_retries: u32,
    /// Base backoff; attempt `n` sleeps `n * backoff_ms`.
    pub backoff_ms: u64,
    /// How long reclamation waits for in-flight transactions to drain.
    pub drain_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            write_back_retries: 3,
            allocation_retries: 8,
            backoff_ms: 2,
            drain_timeout_ms: 500,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Block size shared by the base store and every segment.
    pub block_size: u32,
    /// Number of log segments (`K`).
    pub log_count: usize,
    /// Blocks per segment, including header and descriptor area.
    pub segment_blocks: u64,
    /// Tail reserve of every segment, in bytes.
    pub guard_bytes: u64,
    pub conflict_granularity: ConflictGranularity,
    pub remap_policy: RemapPolicy,
    pub thresholds: ReclaimThresholds,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            log_count: 4,
            segment_blocks: 65_536,
            guard_bytes: 10 * 1024 * 1024,
            conflict_granularity: ConflictGranularity::SubBlock,
            remap_policy: RemapPolicy::Lazy,
            thresholds: ReclaimThresholds::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Check every bound the engine relies on.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RelogError::InvalidConfig(msg));
        if !(512..=65_536).contains(&self.block_size) || !self.block_size.is_power_of_two() {
            return invalid(format!(
                "block_size {} must be a power of two in 512..=65536",
                self.block_size
            ));
        }
        if self.block_size % SUB_BLOCKS != 0 {
            return invalid(format!(
                "block_size {} is not divisible into {SUB_BLOCKS} sub-ranges",
                self.block_size
            ));
        }
        if self.log_count == 0 || self.log_count > MAX_LOGS {
            return invalid(format!(
                "log_count {} must be in 1..={MAX_LOGS} (4-bit log id)",
                self.log_count
            ));
        }
        if self.segment_blocks > MAX_SEGMENT_BLOCKS {
            return invalid(format!(
                "segment_blocks {} exceeds the 28-bit offset limit {MAX_SEGMENT_BLOCKS}",
                self.segment_blocks
            ));
        }
        let layout = self.layout()?;
        if self.guard_bytes >= layout.capacity_bytes() {
            return invalid(format!(
                "guard_bytes {} leaves no usable space in a {}-byte data area",
                self.guard_bytes,
                layout.capacity_bytes()
            ));
        }
        if self.thresholds.soft_stale > self.thresholds.hard_stale {
            return invalid(format!(
                "soft_stale {} exceeds hard_stale {}",
                self.thresholds.soft_stale, self.thresholds.hard_stale
            ));
        }
        if self.retry.allocation_retries == 0 {
            return invalid("allocation_retries must be at least 1".to_owned());
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<SegmentLayout> {
        SegmentLayout::new(self.block_size, self.segment_blocks)
    }

    /// Small geometry for tests and tools: `log_count` segments of
    /// `segment_blocks` blocks of 512 bytes, no guard.
    #[must_use]
    pub fn small(log_count: usize, segment_blocks: u64) -> Self {
        Self {
            block_size: 512,
            log_count,
            segment_blocks,
            guard_bytes: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().expect("defaults");
        assert_eq!(config.thresholds.soft_stale, 60);
        assert_eq!(config.thresholds.hard_stale, 200);
        assert_eq!(config.thresholds.min_batch, 256);
        assert_eq!(config.retry.drain_timeout(), Duration::from_millis(500));
        assert_eq!(config.retry.backoff(3), Duration::from_millis(6));
    }

    #[test]
    fn tag_bounds_are_enforced() {
        let mut config = EngineConfig::small(17, 64);
        assert!(matches!(config.validate(), Err(RelogError::InvalidConfig(_))));
        config.log_count = 16;
        config.validate().expect("16 logs fit");
        config.segment_blocks = MAX_SEGMENT_BLOCKS + 1;
        assert!(config.validate().is_err());
        config.log_count = 0;
        config.segment_blocks = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn geometry_and_threshold_checks() {
        let mut config = EngineConfig::small(2, 64);
        config.block_size = 1000;
        assert!(config.validate().is_err());
        config.block_size = 512;
        config.guard_bytes = 1 << 30;
        assert!(config.validate().is_err());
        config.guard_bytes = 0;
        config.thresholds.soft_stale = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"log_count": 2, "remap_policy": "force_copy"}"#)
                .expect("parse");
        assert_eq!(config.log_count, 2);
        assert_eq!(config.remap_policy, RemapPolicy::ForceCopy);
        assert_eq!(config.block_size, 4096);
        let text = serde_json::to_string(&config).expect("serialize");
        let back: EngineConfig = serde_json::from_str(&text).expect("reparse");
        assert_eq!(back, config);
    }
}
