use std::{future::Future, time::Duration};

use super::{ResilienceHook, Transient};

/// Exponential backoff retry.
///
/// The delay after failed attempt `k` (1-indexed) is `unit * 2^k`, with no
/// jitter. With the default one second unit that is 2s, 4s, 8s, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    unit: Duration,
}

impl RetryPolicy {
    /// `attempts` is the total number of invocations, clamped to at least one.
    pub fn new(attempts: u32, unit: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            unit,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait after failed attempt `attempt` before the next one.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Invoke `op` until it succeeds, fails non-transiently, or the attempt
    /// budget is spent. The last error is returned unchanged.
    pub(crate) async fn run<T, E, F, Fut>(&self, hook: &dyn ResilienceHook, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::error::Error,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() || attempt >= self.attempts {
                return Err(err);
            }

            let delay = self.backoff(attempt);
            hook.on_retry(attempt, delay, &err);
            drop(err);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use tokio::time::Instant;

    use super::*;
    use crate::resilience::DefaultResilienceHook;

    #[derive(Debug)]
    struct Flaky {
        transient: bool,
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (transient: {})", self.transient)
        }
    }

    impl std::error::Error for Flaky {}

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        retries: Mutex<Vec<(u32, Duration)>>,
    }

    impl ResilienceHook for RecordingHook {
        fn on_retry(&self, attempt: u32, delay: Duration, _error: &dyn std::error::Error) {
            self.retries.lock().unwrap().push((attempt, delay));
        }
        fn on_break(&self, _duration: Duration) {}
        fn on_half_open(&self) {}
        fn on_reset(&self) {}
        fn on_rejected(&self, _retry_after: Duration) {}
        fn on_timeout(&self, _limit: Duration) {}
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_fewer_failures_than_the_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = &AtomicU32::new(0);

        let result = policy
            .run(&DefaultResilienceHook, move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    Err(Flaky { transient: true })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_attempt_budget_with_exponential_delays() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let hook = RecordingHook::default();
        let calls = &AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = policy
            .run(&hook, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky { transient: true })
            })
            .await;

        assert!(result.unwrap_err().transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *hook.retries.lock().unwrap(),
            vec![(1, Duration::from_secs(2)), (2, Duration::from_secs(4))]
        );
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_failures_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run(&DefaultResilienceHook, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky { transient: false })
            })
            .await;

        assert!(!result.unwrap_err().transient);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
