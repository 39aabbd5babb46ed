//! DispatchBackoff - exponential backoff of failed outbox rows
//!
//! ```text
//! retry_count    delay (base=5s)
//! ─────────────────────────────
//!     0              5s
//!     1             10s
//!     2             20s
//!     3             40s
//!     4             80s
//!    >=5           160s   (exponent capped at 5)
//! ```
//!
//! Whatever the base, no delay exceeds [`MAX_BACKOFF`]. There is no
//! jitter: replicas skip locked rows, so synchronized retries do not
//! contend.

use chrono::{DateTime, Utc};
use cube_castle_shared::config::DispatcherConfig;
use std::fmt;
use std::time::Duration;

/// Hard ceiling of any dispatch backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Largest exponent applied to the base
const MAX_EXPONENT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchBackoff {
    base: Duration,
    max_retry: u32,
}

impl fmt::Display for DispatchBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DispatchBackoff(base={:?}, max={:?}, max_retry={})",
            self.base, MAX_BACKOFF, self.max_retry
        )
    }
}

impl DispatchBackoff {
    pub fn new(base: Duration, max_retry: u32) -> Self {
        Self { base, max_retry }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(config.backoff_base, config.max_retry)
    }

    /// `min(base * 2^min(retry_count, 5), 5m)`, where `retry_count` is the
    /// count before this failure is recorded.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count.max(0))
            .unwrap_or(0)
            .min(MAX_EXPONENT);
        self.base
            .saturating_mul(2u32.pow(exponent))
            .min(MAX_BACKOFF)
    }

    /// Next `available_at` for a row failing at `now`.
    pub fn next_available_at(&self, retry_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(MAX_BACKOFF.as_secs() as i64));
        now + delay
    }

    /// True when the incremented retry count reaches the escalation threshold.
    pub fn is_escalation(&self, retry_count_after: i32) -> bool {
        i64::from(retry_count_after) >= i64::from(self.max_retry)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let backoff = DispatchBackoff::new(Duration::from_secs(5), 10);
        assert_eq!(backoff.delay_for(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(20));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(80));
    }

    #[test]
    fn test_exponent_capped_at_five() {
        let backoff = DispatchBackoff::new(Duration::from_secs(1), 10);
        assert_eq!(backoff.delay_for(5), Duration::from_secs(32));
        assert_eq!(backoff.delay_for(6), Duration::from_secs(32));
        assert_eq!(backoff.delay_for(50), Duration::from_secs(32));
    }

    #[test]
    fn test_hard_ceiling() {
        let backoff = DispatchBackoff::new(Duration::from_secs(60), 10);
        assert_eq!(backoff.delay_for(3), MAX_BACKOFF);
        assert_eq!(backoff.delay_for(9), MAX_BACKOFF);
    }

    #[test]
    fn test_negative_retry_count_uses_base() {
        let backoff = DispatchBackoff::new(Duration::from_secs(2), 3);
        assert_eq!(backoff.delay_for(-4), Duration::from_secs(2));
    }

    #[test]
    fn test_next_available_at_moves_forward() {
        let backoff = DispatchBackoff::new(Duration::from_secs(1), 3);
        let now = Utc::now();
        assert_eq!(
            backoff.next_available_at(0, now),
            now + chrono::Duration::seconds(1)
        );
        assert!(backoff.next_available_at(2, now) > backoff.next_available_at(1, now));
    }

    #[test]
    fn test_escalation_threshold() {
        let backoff = DispatchBackoff::new(Duration::from_secs(1), 3);
        assert!(!backoff.is_escalation(2));
        assert!(backoff.is_escalation(3));
        assert!(backoff.is_escalation(7));
    }
}
