//! Retry backoff for worker attempts.

use std::time::Duration;

use rand::Rng;

/// Cap on the base delay, in seconds.
const MAX_BASE_SECS: u64 = 120;

/// Base delay for attempt `a`: `min(5 * 2^a, 120)` seconds.
///
/// Attempts start at 1, so the first backoff is 10 s, then 20, 40, 80,
/// 120, 120, ...
pub fn base_delay(attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt.min(32));
    Duration::from_secs(5u64.saturating_mul(exp).min(MAX_BASE_SECS))
}

/// Full backoff: base delay plus uniform jitter in `[0, 0.2 * base)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = base_delay(attempt);
    let jitter_cap = base.as_millis() as u64 / 5;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::rng().random_range(0..jitter_cap)
    };
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_series() {
        assert_eq!(base_delay(1), Duration::from_secs(10));
        assert_eq!(base_delay(2), Duration::from_secs(20));
        assert_eq!(base_delay(3), Duration::from_secs(40));
        assert_eq!(base_delay(4), Duration::from_secs(80));
        assert_eq!(base_delay(5), Duration::from_secs(120));
        assert_eq!(base_delay(6), Duration::from_secs(120));
        assert_eq!(base_delay(20), Duration::from_secs(120));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for attempt in 1..=8 {
            let base = base_delay(attempt);
            let cap = base + base / 5;
            for _ in 0..50 {
                let delay = backoff_delay(attempt);
                assert!(delay >= base, "delay {delay:?} below base {base:?}");
                assert!(delay < cap, "delay {delay:?} at or above cap {cap:?}");
            }
        }
    }

    #[test]
    fn first_attempt_window() {
        // Attempt 1 backs off 10 s (the multiplier is 2^a with a starting
        // at 1), never 5 s.
        let delay = backoff_delay(1);
        assert!(delay >= Duration::from_secs(10));
        assert!(delay < Duration::from_secs(12));
    }

    #[test]
    fn late_attempts_capped() {
        let delay = backoff_delay(20);
        assert!(delay <= Duration::from_secs(144));
    }

    #[test]
    fn no_overflow_at_extreme_attempts() {
        assert_eq!(base_delay(u32::MAX), Duration::from_secs(120));
    }
}
