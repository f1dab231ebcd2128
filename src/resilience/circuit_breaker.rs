use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use super::ResilienceHook;

/// Observable circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls go through.
    Closed,
    /// Too many failures, calls are rejected immediately.
    Open,
    /// The break elapsed and a single trial call decides what happens next.
    HalfOpen,
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct Record {
    phase: Phase,
    consecutive_failures: u32,
}

/// Consecutive-failure circuit breaker.
///
/// All state lives in one mutex-guarded record, so the transition into
/// `HalfOpen` and the hand-out of the single trial permit happen atomically
/// with respect to concurrent callers. The lock is never held across an
/// await point.
pub struct CircuitBreaker {
    record: Mutex<Record>,
    failure_threshold: u32,
    break_duration: Duration,
    hook: Arc<dyn ResilienceHook>,
}

enum Transition {
    None,
    Break,
    Reset,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: u32,
        break_duration: Duration,
        hook: Arc<dyn ResilienceHook>,
    ) -> Self {
        Self {
            record: Mutex::new(Record {
                phase: Phase::Closed,
                consecutive_failures: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            break_duration,
            hook,
        }
    }

    pub fn state(&self) -> BreakerSnapshot {
        let record = self.lock();
        let state = match record.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        };
        BreakerSnapshot {
            state,
            consecutive_failures: record.consecutive_failures,
        }
    }

    /// Ask to make a call. On rejection, returns how long until a trial
    /// becomes possible (zero while another trial is in flight).
    pub(crate) fn acquire(&self) -> Result<Permit<'_>, Duration> {
        let mut record = self.lock();
        let phase = record.phase;
        match phase {
            Phase::Closed => Ok(Permit::new(self, false)),
            Phase::HalfOpen {
                trial_in_flight: false,
            } => {
                record.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(Permit::new(self, true))
            }
            Phase::HalfOpen {
                trial_in_flight: true,
            } => {
                drop(record);
                self.hook.on_rejected(Duration::ZERO);
                Err(Duration::ZERO)
            }
            Phase::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.break_duration {
                    record.phase = Phase::HalfOpen {
                        trial_in_flight: true,
                    };
                    drop(record);
                    self.hook.on_half_open();
                    Ok(Permit::new(self, true))
                } else {
                    drop(record);
                    let retry_after = self.break_duration - elapsed;
                    self.hook.on_rejected(retry_after);
                    Err(retry_after)
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let transition = {
            let mut record = self.lock();
            record.consecutive_failures = 0;
            if trial {
                record.phase = Phase::Closed;
                Transition::Reset
            } else {
                Transition::None
            }
        };
        self.notify(transition);
    }

    fn on_failure(&self, trial: bool) {
        let transition = {
            let mut record = self.lock();
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            let trips = trial
                || (matches!(record.phase, Phase::Closed)
                    && record.consecutive_failures >= self.failure_threshold);
            if trips {
                record.phase = Phase::Open {
                    opened_at: Instant::now(),
                };
                Transition::Break
            } else {
                Transition::None
            }
        };
        self.notify(transition);
    }

    /// Outcome that says nothing about the dependency's health. A trial slot
    /// is handed back so the next call can try again.
    fn on_neutral(&self, trial: bool) {
        if trial {
            self.lock().phase = Phase::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    fn notify(&self, transition: Transition) {
        match transition {
            Transition::None => {}
            Transition::Break => self.hook.on_break(self.break_duration),
            Transition::Reset => self.hook.on_reset(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Permission to make one call through the breaker.
///
/// A trial permit dropped without an outcome (the call was timed out or
/// cancelled) counts as a failed trial and re-opens the circuit.
pub(crate) struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub(crate) fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub(crate) fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    pub(crate) fn neutral(mut self) {
        self.settled = true;
        self.breaker.on_neutral(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::DefaultResilienceHook;

    fn breaker(threshold: u32, secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            threshold,
            Duration::from_secs(secs),
            Arc::new(DefaultResilienceHook),
        )
    }

    fn trip(breaker: &CircuitBreaker, times: u32) {
        for _ in 0..times {
            breaker.acquire().unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3, 30);
        trip(&breaker, 2);
        assert_eq!(breaker.state().state, CircuitState::Closed);

        trip(&breaker, 1);
        assert_eq!(breaker.state().state, CircuitState::Open);

        let retry_after = breaker.acquire().err().unwrap();
        assert_eq!(retry_after, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let breaker = breaker(3, 30);
        trip(&breaker, 2);
        breaker.acquire().unwrap().success();
        trip(&breaker, 2);

        assert_eq!(
            breaker.state(),
            BreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 2,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_at_a_time_when_half_open() {
        let breaker = breaker(1, 10);
        trip(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = breaker.acquire().unwrap();
        assert_eq!(breaker.state().state, CircuitState::HalfOpen);
        assert_eq!(breaker.acquire().err(), Some(Duration::ZERO));

        trial.success();
        assert_eq!(
            breaker.state(),
            BreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_restarts_the_break_timer() {
        let breaker = breaker(1, 10);
        trip(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state().state, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(breaker.acquire().err(), Some(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_reopens_the_circuit() {
        let breaker = breaker(1, 10);
        trip(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.state().state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn neutral_trial_hands_the_slot_back() {
        let breaker = breaker(1, 10);
        trip(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        breaker.acquire().unwrap().neutral();
        assert_eq!(breaker.state().state, CircuitState::HalfOpen);
        assert!(breaker.acquire().is_ok());
    }
}
