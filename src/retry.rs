use std::time::Duration;

use rand::Rng;

/// Exponential backoff, capped at `max`, with up to `jitter` of random
/// extra delay added to every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub(crate) base: Duration,
    pub(crate) max: Duration,
    pub(crate) jitter: Duration,
    pub(crate) max_attempts: u32,
}

impl RetryPolicy {
    /// Policy for the long-running capture loops: 1s, 2s, 4s ... 30s.
    pub(crate) fn capture() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            max_attempts: u32::MAX,
        }
    }

    /// Policy for the live preview: recover quickly, never wait long.
    pub(crate) fn preview() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
            max_attempts: u32::MAX,
        }
    }

    /// Policy for a single sensor read. DHT11 needs ~1s between reads.
    pub(crate) fn sensor() -> Self {
        Self {
            base: Duration::from_millis(1100),
            max: Duration::from_millis(1100),
            jitter: Duration::ZERO,
            max_attempts: 3,
        }
    }

    /// Delay before retry number `attempt` (0 based), without jitter.
    pub(crate) fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }

    /// Run `op` until it succeeds or `max_attempts` is reached, sleeping
    /// with `sleep` between attempts. Returns the last error with the
    /// number of attempts made.
    pub(crate) fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T, (u32, E)> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err((attempt, err));
                    }
                    sleep(self.delay(attempt - 1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_delay_doubles_and_caps() {
        let policy = RetryPolicy::capture();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(4), Duration::from_secs(16));
        assert_eq!(policy.base_delay(5), Duration::from_secs(30));
        assert_eq!(policy.base_delay(400), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::capture();
        for attempt in 0..8 {
            let delay = policy.delay(attempt);
            let base = policy.base_delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + policy.jitter);
        }
    }

    #[test]
    fn run_stops_after_max_attempts() {
        let policy = RetryPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(5),
            jitter: Duration::ZERO,
            max_attempts: 3,
        };
        let mut sleeps = Vec::new();
        let res: Result<(), _> = policy.run(|n| Err(n), |d| sleeps.push(d));
        assert_eq!(res, Err((3, 2)));
        assert_eq!(sleeps, vec![Duration::from_millis(5); 2]);
    }

    #[test]
    fn run_returns_first_success() {
        let policy = RetryPolicy::sensor();
        let res = policy.run(
            |n| if n < 1 { Err("flaky") } else { Ok(n) },
            |_| {},
        );
        assert_eq!(res, Ok(1));
    }
}
