//! Retry backoff: `min(max, 2^attempt * base) + jitter`.

use std::time::Duration;

use rand::Rng;

/// Unit of the exponential term.
pub const BASE_UNIT: Duration = Duration::from_millis(500);

/// Upper bound (exclusive) of the random jitter added to every delay.
pub const MAX_JITTER: Duration = Duration::from_millis(250);

/// Deterministic part of the backoff for `attempt` (0-based).
pub fn base_delay(attempt: u32, max_backoff: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(30)).unwrap_or(u32::MAX);
    BASE_UNIT.saturating_mul(factor).min(max_backoff)
}

/// Backoff with uniform jitter in `[0, MAX_JITTER)`.
pub fn backoff_delay(attempt: u32, max_backoff: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..MAX_JITTER.as_millis() as u64);
    base_delay(attempt, max_backoff) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_until_cap() {
        let cap = Duration::from_secs(30);
        assert_eq!(base_delay(0, cap), Duration::from_millis(500));
        assert_eq!(base_delay(1, cap), Duration::from_secs(1));
        assert_eq!(base_delay(2, cap), Duration::from_secs(2));
        assert_eq!(base_delay(5, cap), Duration::from_secs(16));
        assert_eq!(base_delay(6, cap), cap);
        assert_eq!(base_delay(40, cap), cap);
    }

    #[test]
    fn base_delay_is_monotonic() {
        let cap = Duration::from_secs(20);
        let delays: Vec<Duration> = (0..20).map(|a| base_delay(a, cap)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn jitter_is_bounded() {
        let cap = Duration::from_secs(30);
        for attempt in 0..8 {
            let base = base_delay(attempt, cap);
            for _ in 0..32 {
                let d = backoff_delay(attempt, cap);
                assert!(d >= base);
                assert!(d < base + MAX_JITTER);
            }
        }
    }
}
