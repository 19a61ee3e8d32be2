#![forbid(unsafe_code)]
//! Error types for relog.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `relog-types` | On-media header/descriptor violations found while decoding bytes |
//! | Runtime | `RelogError` | `relog-error` (this crate) | Errors returned to the filesystem-call layer and the CLI |
//!
//! `relog-error` does not depend on `relog-types`; the conversion from
//! `ParseError` happens in the crates that decode on-media structures.
//!
//! ## Propagation policy
//!
//! | Variant | Retried internally? | errno |
//! |---------|---------------------|-------|
//! | `Io` | no | raw os error or `EIO` |
//! | `OutOfSpace` | yes, bounded backoff | `ENOSPC` |
//! | `ReclaimBusy` | yes, next scheduler tick | `EBUSY` |
//! | `ConflictAborted` | never | `EAGAIN` |
//! | `WriteBackFailed` | never (already retried) | `EIO` |
//! | `CorruptionDetected` | never | `EIO` |
//! | `RecoveryFailed` | never, fatal for the store | `EIO` |
//! | `Format` | never | `EINVAL` |
//! | `InvalidConfig` | never | `EINVAL` |
//! | `InvalidArgument` | never | `EINVAL` |
//! | `SessionClosed` | never | `EBADF` |
//! | `NotFound` | never | `ENOENT` |

use thiserror::Error;

/// Unified error type for all relog operations.
#[derive(Debug, Error)]
pub enum RelogError {
    /// Operating system I/O error from the base store or segment media.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No log segment can satisfy an allocation, even after reclamation.
    #[error("no log space: needed {needed} bytes, {remaining} remaining")]
    OutOfSpace { needed: u64, remaining: u64 },

    /// A segment could not be reclaimed because in-flight transactions did
    /// not drain in time.
    #[error("reclamation of log {log} is busy: in-flight transactions did not drain")]
    ReclaimBusy { log: u8 },

    /// The writer's transaction lost a sub-block conflict and must restart.
    #[error("conflict aborted: inode {inode} block {block} was committed by a concurrent writer")]
    ConflictAborted { inode: u64, block: u64 },

    /// Write-back of a committed block failed persistently during reclamation.
    #[error("write-back failed for block {block}: {detail}")]
    WriteBackFailed { block: u64, detail: String },

    /// Checksum mismatch on a log read.
    #[error("corruption detected at block {block}: expected crc {expected:#010x}, got {actual:#010x}")]
    CorruptionDetected {
        block: u64,
        expected: u32,
        actual: u32,
    },

    /// Segment headers could not be recovered at startup. Fatal for the store.
    #[error("recovery failed for log {log}: {detail}")]
    RecoveryFailed { log: u8, detail: String },

    /// Invalid on-media format (bad magic, version, truncated structure).
    #[error("invalid on-media format: {0}")]
    Format(String),

    /// Engine configuration violates a structural bound.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A caller passed an out-of-range block, byte range or payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session was already closed.
    #[error("session closed")]
    SessionClosed,

    /// Named object (inode tree, segment) not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl RelogError {
    /// Convert this error into a POSIX errno for the filesystem-call layer.
    ///
    /// The mapping is exhaustive; adding a variant without assigning an
    /// errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfSpace { .. } => libc::ENOSPC,
            Self::ReclaimBusy { .. } => libc::EBUSY,
            Self::ConflictAborted { .. } => libc::EAGAIN,
            Self::WriteBackFailed { .. }
            | Self::CorruptionDetected { .. }
            | Self::RecoveryFailed { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidConfig(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::SessionClosed => libc::EBADF,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// Whether the engine may retry this error internally.
    ///
    /// Conflict, corruption and write-back failures are always surfaced.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. } | Self::ReclaimBusy { .. })
    }
}

/// Result alias using `RelogError`.
pub type Result<T> = std::result::Result<T, RelogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(RelogError, libc::c_int)> = vec![
            (RelogError::Io(std::io::Error::other("test")), libc::EIO),
            (
                RelogError::OutOfSpace {
                    needed: 4096,
                    remaining: 0,
                },
                libc::ENOSPC,
            ),
            (RelogError::ReclaimBusy { log: 1 }, libc::EBUSY),
            (
                RelogError::ConflictAborted { inode: 3, block: 7 },
                libc::EAGAIN,
            ),
            (
                RelogError::WriteBackFailed {
                    block: 9,
                    detail: "disk gone".into(),
                },
                libc::EIO,
            ),
            (
                RelogError::CorruptionDetected {
                    block: 1,
                    expected: 1,
                    actual: 2,
                },
                libc::EIO,
            ),
            (
                RelogError::RecoveryFailed {
                    log: 0,
                    detail: "bad magic".into(),
                },
                libc::EIO,
            ),
            (RelogError::Format("x".into()), libc::EINVAL),
            (RelogError::InvalidConfig("x".into()), libc::EINVAL),
            (RelogError::InvalidArgument("x".into()), libc::EINVAL),
            (RelogError::SessionClosed, libc::EBADF),
            (RelogError::NotFound("tree".into()), libc::ENOENT),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(RelogError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn only_space_and_busy_are_retryable() {
        assert!(
            RelogError::OutOfSpace {
                needed: 1,
                remaining: 0
            }
            .is_retryable()
        );
        assert!(RelogError::ReclaimBusy { log: 0 }.is_retryable());
        assert!(!RelogError::ConflictAborted { inode: 1, block: 1 }.is_retryable());
        assert!(
            !RelogError::CorruptionDetected {
                block: 1,
                expected: 0,
                actual: 1
            }
            .is_retryable()
        );
    }

    #[test]
    fn display_formatting() {
        let err = RelogError::CorruptionDetected {
            block: 42,
            expected: 0xDEAD_BEEF,
            actual: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "corruption detected at block 42: expected crc 0xdeadbeef, got 0x00000001"
        );
        let conflict = RelogError::ConflictAborted { inode: 5, block: 7 };
        assert!(conflict.to_string().starts_with("conflict aborted:"));
    }
}
