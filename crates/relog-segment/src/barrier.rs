//! Per-segment I/O barrier.
//!
//! Transactions with pending contributions in a segment hold a shared
//! [`BarrierToken`]; reclamation needs exclusive ownership, which is only
//! granted once the shared count drains to zero. While reclamation waits,
//! the barrier is *closing*: no new shared tokens are admitted, so the
//! drain cannot be starved by a steady stream of writers.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct BarrierState {
    shared: u32,
    closing: bool,
    exclusive: bool,
}

#[derive(Debug, Default)]
pub struct IoBarrier {
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

/// Shared admission to a segment. Released on drop.
#[derive(Debug)]
pub struct BarrierToken {
    barrier: Arc<IoBarrier>,
}

impl Drop for BarrierToken {
    fn drop(&mut self) {
        let mut state = self
            .barrier
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.shared = state.shared.saturating_sub(1);
        let drained = state.shared == 0;
        drop(state);
        if drained {
            self.barrier.condvar.notify_all();
        }
    }
}

impl IoBarrier {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a shared token unless the barrier is closing or exclusively held.
    #[must_use]
    pub fn try_enter(self: &Arc<Self>) -> Option<BarrierToken> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closing || state.exclusive {
            return None;
        }
        state.shared += 1;
        drop(state);
        Some(BarrierToken {
            barrier: Arc::clone(self),
        })
    }

    /// Like [`try_enter`](Self::try_enter), but wait up to `timeout` for a
    /// closing or exclusive holder to finish.
    #[must_use]
    pub fn enter_timeout(self: &Arc<Self>, timeout: Duration) -> Option<BarrierToken> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.closing || state.exclusive {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next, _) = self
                .condvar
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        state.shared += 1;
        drop(state);
        Some(BarrierToken {
            barrier: Arc::clone(self),
        })
    }

    /// Close the barrier to new shared holders and wait up to `timeout` for
    /// the shared count to drain.
    ///
    /// Returns `true` when exclusive ownership was granted. On timeout the
    /// barrier reopens and `false` is returned.
    pub fn acquire_exclusive(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.exclusive || state.closing {
            return false;
        }
        state.closing = true;
        while state.shared > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.closing = false;
                drop(state);
                self.condvar.notify_all();
                return false;
            }
            let (next, _) = self
                .condvar
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        state.closing = false;
        state.exclusive = true;
        true
    }

    /// Grant exclusive ownership only if nobody holds a shared token.
    pub fn try_acquire_exclusive(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.exclusive || state.closing || state.shared > 0 {
            return false;
        }
        state.exclusive = true;
        true
    }

    pub fn release_exclusive(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.exclusive = false;
        drop(state);
        self.condvar.notify_all();
    }

    /// Number of shared tokens outstanding (`inflight_tx_count`).
    #[must_use]
    pub fn inflight(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shared
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn exclusive_waits_for_shared_tokens() {
        let barrier = IoBarrier::new();
        let token = barrier.try_enter().expect("shared");
        assert_eq!(barrier.inflight(), 1);
        assert!(!barrier.acquire_exclusive(Duration::from_millis(20)));
        // Timed-out drain reopens the barrier.
        let second = barrier.try_enter().expect("reopened");
        drop(second);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(token);
        });
        assert!(barrier.acquire_exclusive(Duration::from_secs(5)));
        releaser.join().expect("join");
        assert!(barrier.is_exclusive());
        assert!(barrier.try_enter().is_none());
        barrier.release_exclusive();
        assert!(barrier.try_enter().is_some());
    }

    #[test]
    fn closing_barrier_rejects_new_tokens() {
        let barrier = IoBarrier::new();
        let token = barrier.try_enter().expect("shared");
        let closer = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.acquire_exclusive(Duration::from_secs(5)))
        };
        // Wait until the closer has marked the barrier.
        let start = Instant::now();
        while barrier.try_enter().is_some() {
            assert!(start.elapsed() < Duration::from_secs(5), "never closed");
            thread::yield_now();
        }
        drop(token);
        assert!(closer.join().expect("join"));
        barrier.release_exclusive();
    }

    #[test]
    fn enter_timeout_waits_for_release() {
        let barrier = IoBarrier::new();
        assert!(barrier.try_acquire_exclusive());
        assert!(barrier.enter_timeout(Duration::from_millis(10)).is_none());
        let releaser = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                barrier.release_exclusive();
            })
        };
        assert!(barrier.enter_timeout(Duration::from_secs(5)).is_some());
        releaser.join().expect("join");
    }

    #[test]
    fn try_exclusive_requires_zero_inflight() {
        let barrier = IoBarrier::new();
        let token = barrier.try_enter();
        assert!(!barrier.try_acquire_exclusive());
        drop(token);
        assert!(barrier.try_acquire_exclusive());
        assert!(!barrier.try_acquire_exclusive());
    }
}
