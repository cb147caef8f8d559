use std::thread;
use std::time::Duration;

/// Attempts allowed for every connection open.
pub const CONNECTION_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            attempts: CONNECTION_RETRIES,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: E },
    /// Stopped before another attempt was issued.
    Abandoned { attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Abandoned { attempts } => *attempts,
        }
    }
}

/// Calls `attempt` with the 1-based attempt number until it succeeds, the
/// budget runs out, or `should_stop` turns true between attempts. An attempt
/// already in flight always runs to completion.
pub fn run_with_retry<T, E, S, F>(budget: RetryBudget, should_stop: S, mut attempt: F) -> RetryOutcome<T, E>
where
    S: Fn() -> bool,
    F: FnMut(u32) -> Result<T, E>,
{
    let max = budget.attempts.max(1);
    let mut last_error = None;

    for n in 1..=max {
        if should_stop() {
            return RetryOutcome::Abandoned { attempts: n - 1 };
        }
        match attempt(n) {
            Ok(value) => return RetryOutcome::Success { value, attempts: n },
            Err(e) => last_error = Some(e),
        }
        if n < max && !budget.delay.is_zero() {
            thread::sleep(budget.delay);
        }
    }

    match last_error {
        Some(last_error) => RetryOutcome::Exhausted {
            attempts: max,
            last_error,
        },
        None => RetryOutcome::Abandoned { attempts: max },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn two_failures_then_success() {
        let outcome = run_with_retry(RetryBudget::default(), || false, |n| {
            if n < 3 { Err(format!("fail {n}")) } else { Ok(n * 10) }
        });
        match outcome {
            RetryOutcome::Success { value, attempts } => {
                assert_eq!(value, 30);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn three_failures_exhaust_without_fourth_attempt() {
        let calls = Cell::new(0);
        let outcome: RetryOutcome<(), String> =
            run_with_retry(RetryBudget::default(), || false, |n| {
                calls.set(calls.get() + 1);
                Err(format!("fail {n}"))
            });
        assert_eq!(calls.get(), 3);
        match outcome {
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "fail 3");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn stop_between_attempts_abandons() {
        let stop = Cell::new(false);
        let outcome: RetryOutcome<(), &str> = run_with_retry(RetryBudget::default(), || stop.get(), |_| {
            stop.set(true);
            Err("down")
        });
        assert!(matches!(outcome, RetryOutcome::Abandoned { attempts: 1 }));
        assert_eq!(outcome.attempts(), 1);
    }
}
