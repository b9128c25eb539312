use std::time::Duration;

use crate::error::DisplayError;

/// How hard to retry device creation after a teardown.
///
/// Creation mostly fails because the OS still holds the previous device with
/// the same serial number, so the budget depends on whether that teardown was
/// confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Report a final `CreationFailed` as `TeardownTimedOut`.
    pub blame_teardown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `min(step * attempt, cap)`
    Linear { step: Duration, cap: Duration },
}

impl RetryPolicy {
    pub fn after_confirmed_teardown() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(150)),
            blame_teardown: false,
        }
    }

    pub fn after_unconfirmed_teardown() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::Linear {
                step: Duration::from_millis(200),
                cap: Duration::from_secs(1),
            },
            blame_teardown: true,
        }
    }

    pub fn for_teardown(confirmed: bool) -> Self {
        if confirmed {
            Self::after_confirmed_teardown()
        } else {
            Self::after_unconfirmed_teardown()
        }
    }

    /// Delay after the failed `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { step, cap } => step.saturating_mul(attempt).min(cap),
        }
    }

    /// Runs `attempt` until it succeeds, fails with something other than
    /// `CreationFailed`, or the budget runs out.
    pub async fn run<T, F>(&self, mut attempt: F) -> Result<T, DisplayError>
    where
        F: FnMut(u32) -> Result<T, DisplayError>,
    {
        let mut n = 1;
        loop {
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(DisplayError::CreationFailed) if n < self.max_attempts => {
                    let delay = self.delay_after(n);
                    log::debug!(
                        "Creation attempt {}/{} failed, retrying in {:?}",
                        n,
                        self.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    n += 1;
                }
                Err(DisplayError::CreationFailed) if self.blame_teardown => {
                    return Err(DisplayError::TeardownTimedOut)
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_caps_at_one_second() {
        let policy = RetryPolicy::after_unconfirmed_teardown();
        assert_eq!(policy.delay_after(1), Duration::from_millis(200));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        assert_eq!(policy.delay_after(5), Duration::from_secs(1));
        assert_eq!(policy.delay_after(9), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_policy_gives_up_after_three() {
        let mut calls = 0;
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = RetryPolicy::after_confirmed_teardown()
            .run(|_| {
                calls += 1;
                Err(DisplayError::CreationFailed)
            })
            .await;
        assert!(matches!(result, Err(DisplayError::CreationFailed)));
        assert_eq!(calls, 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_policy_blames_teardown() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::after_unconfirmed_teardown()
            .run(|_| {
                calls += 1;
                Err(DisplayError::CreationFailed)
            })
            .await;
        assert!(matches!(result, Err(DisplayError::TeardownTimedOut)));
        assert_eq!(calls, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::after_unconfirmed_teardown()
            .run(|_| {
                calls += 1;
                Err(DisplayError::InvalidConfiguration("no modes".into()))
            })
            .await;
        assert!(matches!(result, Err(DisplayError::InvalidConfiguration(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_later_attempt() {
        let result = RetryPolicy::after_confirmed_teardown()
            .run(|n| {
                if n < 3 {
                    Err(DisplayError::CreationFailed)
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }
}
