//! Deadline-bounded adaptive backoff for the STALL policy.
//!
//! Progressively increases wait time: spin with PAUSE -> yield to the OS ->
//! park in short sleeps, until the stall deadline elapses. The service
//! frees chunks at ingestion cadence (milliseconds), so parking beats
//! burning a core once the spin/yield phases have not won.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) struct DeadlineBackoff {
    deadline: Option<Instant>,
    step: u32,
}

impl DeadlineBackoff {
    const SPIN_LIMIT: u32 = 6; // 2^6 = 64 spins max before yielding
    const YIELD_LIMIT: u32 = 10; // then park between attempts
    const PARK_INTERVAL: Duration = Duration::from_micros(250);

    /// `None` means a single attempt: the caller does not want to wait at
    /// all (the DROP policy).
    pub(crate) fn new(deadline: Option<Instant>) -> Self {
        Self { deadline, step: 0 }
    }

    /// Waits one backoff step. Returns false when the caller should stop
    /// retrying: no deadline was set, or the deadline has passed.
    pub(crate) fn wait(&mut self) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if Instant::now() >= deadline {
            return false;
        }

        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            // Cap the park so we never overshoot the deadline by much.
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(Self::PARK_INTERVAL));
        }
        self.step += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_deadline_means_single_attempt() {
        let mut b = DeadlineBackoff::new(None);
        assert!(!b.wait());
    }

    #[test]
    fn deadline_bounds_the_wait() {
        let start = Instant::now();
        let mut b = DeadlineBackoff::new(Some(start + Duration::from_millis(5)));
        while b.wait() {}
        // Must have given up at (or just past) the deadline.
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn steps_progress() {
        let mut b = DeadlineBackoff::new(Some(Instant::now() + Duration::from_millis(50)));
        assert!(b.wait());
        assert!(b.step > 0);
    }
}
