use std::time::Duration;

/// How long to wait between failed captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every consecutive failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// Capture retry policy: backoff plus an optional cap on consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    /// Retry forever, once per second.
    fn default() -> Self {
        Self::new(None, Backoff::Fixed(Duration::from_secs(1)))
    }
}

impl RetryPolicy {
    /// `max_attempts` of `None` or `Some(0)` means unbounded.
    pub fn new(max_attempts: Option<u32>, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.filter(|&n| n > 0),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay used after a recoverable non-capture failure.
    pub fn base_delay(&self) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, .. } => initial,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let doublings = failures.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << doublings).min(max)
            }
        }
    }

    /// Whether `failures` consecutive failures use up the policy.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unbounded_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), None);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(500), Duration::from_secs(1));
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn test_zero_attempts_means_unbounded() {
        let policy = RetryPolicy::new(Some(0), Backoff::Fixed(Duration::from_secs(1)));
        assert_eq!(policy.max_attempts(), None);
        assert!(!policy.exhausted(10_000));
    }

    #[test]
    fn test_bounded_exhaustion() {
        let policy = RetryPolicy::new(Some(3), Backoff::Fixed(Duration::from_millis(250)));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let policy = RetryPolicy::new(
            None,
            Backoff::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
        );
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1_000), Duration::from_secs(30));
        assert_eq!(policy.base_delay(), Duration::from_secs(1));
    }
}
