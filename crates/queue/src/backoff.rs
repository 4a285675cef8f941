//! Exponential reconnect backoff with full jitter.

use std::time::Duration;

use rand::Rng;

/// Delay schedule for reconnect attempts.
///
/// Attempt `n` sleeps a uniformly random duration in
/// `[0, min(cap, base * 2^n)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    /// `cap` is raised to `base` if it is smaller.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Upper bound of the delay for attempt `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Jittered delay for attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(0..=ceiling);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_until_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.ceiling(0), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(1), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(4), Duration::from_secs(16));
        assert_eq!(backoff.ceiling(5), Duration::from_secs(30));
        assert_eq!(backoff.ceiling(200), Duration::from_secs(30));
    }

    #[test]
    fn delay_never_exceeds_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        for attempt in 0..12 {
            let ceiling = backoff.ceiling(attempt);
            for _ in 0..50 {
                assert!(backoff.delay(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn cap_below_base_is_raised() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.cap(), Duration::from_secs(5));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(5));
    }
}
