//! Retry with jittered backoff
//!
//! Every failed attempt is retried with a uniformly random pause in
//! `[0, jitter_ceiling)` between attempts, whatever the error. Only the
//! attempt bound and the shutdown flag end the loop early.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 5;

/// Default upper bound of the pause between attempts
pub const DEFAULT_JITTER_CEILING: Duration = Duration::from_secs(1);

/// Retry bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 retries forever
    pub max_attempts: u32,

    /// Pauses are drawn from `[0, jitter_ceiling)`; zero disables them
    pub jitter_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRIES,
            jitter_ceiling: DEFAULT_JITTER_CEILING,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Retry until success or shutdown
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn with_jitter_ceiling(mut self, ceiling: Duration) -> Self {
        self.jitter_ceiling = ceiling;
        self
    }

    /// Whether another attempt is allowed after `attempts` have run
    fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts <= self.max_attempts
    }

    fn pause(&self) {
        if self.jitter_ceiling.is_zero() {
            return;
        }
        let ceiling = self.jitter_ceiling.as_micros().clamp(1, u64::MAX as u128) as u64;
        let micros = rand::rng().random_range(0..ceiling);
        thread::sleep(Duration::from_micros(micros));
    }
}

/// Run `action` until it succeeds or the policy gives up
///
/// `action` receives the 1-based attempt number. The last error is
/// returned when attempts are exhausted or `shutdown` is set.
pub fn with_retry<T, E, F>(policy: &RetryPolicy, shutdown: &AtomicBool, mut action: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 1u32;
    loop {
        match action(attempt) {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !policy.allows(attempt) || shutdown.load(Ordering::Relaxed) {
                    return Err(e);
                }
                debug!(attempt, error = %e, "Attempt failed, retrying");
                policy.pause();
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;

    fn transient(n: u32) -> VaultError {
        VaultError::Status {
            method: "PUT",
            path: "secret/a".into(),
            status: 503,
            message: format!("sealed ({n})"),
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_jitter_ceiling(Duration::ZERO)
    }

    #[test]
    fn test_bounded_attempts() {
        let shutdown = AtomicBool::new(false);
        let mut calls = 0;
        let result: Result<(), VaultError> = with_retry(&fast(3), &shutdown, |n| {
            calls += 1;
            Err(transient(n))
        });
        assert!(result.is_err());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_unbounded_eventually_succeeds() {
        let shutdown = AtomicBool::new(false);
        let result = with_retry(&fast(0), &shutdown, |n| if n < 100 { Err(transient(n)) } else { Ok(n) });
        assert_eq!(result.unwrap(), 100);
    }

    #[test]
    fn test_permission_denied_still_retried() {
        let shutdown = AtomicBool::new(false);
        let mut calls = 0;
        let result: Result<(), VaultError> = with_retry(&fast(3), &shutdown, |_| {
            calls += 1;
            Err(VaultError::Status {
                method: "PUT",
                path: "secret/a".into(),
                status: 403,
                message: "permission denied".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_unbounded_retries_past_client_errors() {
        let shutdown = AtomicBool::new(false);
        let result = with_retry(&fast(0), &shutdown, |n| {
            if n < 50 {
                Err(VaultError::Status {
                    method: "PUT",
                    path: "secret/a".into(),
                    status: 400,
                    message: "bad request".into(),
                })
            } else {
                Ok(n)
            }
        });
        assert_eq!(result.unwrap(), 50);
    }

    #[test]
    fn test_shutdown_stops() {
        let shutdown = AtomicBool::new(true);
        let mut calls = 0;
        let _: Result<(), VaultError> = with_retry(&fast(0), &shutdown, |n| {
            calls += 1;
            Err(transient(n))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_jitter_below_ceiling() {
        let policy = RetryPolicy::new(1).with_jitter_ceiling(Duration::from_millis(5));
        let start = std::time::Instant::now();
        policy.pause();
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
