use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Wakes writers blocked on log space when a reclamation cycle finishes.
///
/// - Waiters read the current round with [`round`](Self::round) before
///   deciding to sleep, then call [`wait_past`](Self::wait_past).
/// - Reclamation calls [`notify_reclaimed`](Self::notify_reclaimed) after
///   a segment returns to `Active`, waking every waiter at once.
#[derive(Debug, Default)]
pub struct ReclaimNotifier {
    round: Mutex<u64>,
    condvar: Condvar,
}

impl ReclaimNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn round(&self) -> u64 {
        *self.round.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify_reclaimed(&self) {
        let mut round = self.round.lock().unwrap_or_else(PoisonError::into_inner);
        *round += 1;
        drop(round);
        self.condvar.notify_all();
    }

    /// Block until a round later than `seen` completes or `timeout` elapses.
    /// Returns whether a newer round was observed.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut round = self.round.lock().unwrap_or_else(PoisonError::into_inner);
        while *round <= seen {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, _) = self
                .condvar
                .wait_timeout(round, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            round = next;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn waiter_wakes_on_next_round() {
        let notifier = Arc::new(ReclaimNotifier::new());
        let seen = notifier.round();
        let waiter = {
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || notifier.wait_past(seen, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        notifier.notify_reclaimed();
        assert!(waiter.join().expect("join"));
        assert_eq!(notifier.round(), seen + 1);
    }

    #[test]
    fn wait_times_out_without_progress() {
        let notifier = ReclaimNotifier::new();
        assert!(!notifier.wait_past(notifier.round(), Duration::from_millis(5)));
        notifier.notify_reclaimed();
        assert!(notifier.wait_past(0, Duration::ZERO));
    }
}
