use std::io;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

/// Time source for debounce stamps and retry backoff.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Fixed-backoff retry used for sysfs attributes that the kernel creates
/// asynchronously after an export.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Runs `op` until it succeeds or the attempt budget is spent, returning
    /// the last error in the latter case.
    pub fn run<T, F>(&self, clock: &dyn Clock, what: &str, mut op: F) -> io::Result<T>
    where
        F: FnMut() -> io::Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    debug!("{what} failed (attempt {attempt}/{attempts}): {e}, retrying");
                    clock.sleep(self.backoff());
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Manual clock: `sleep` advances time instead of blocking.
    pub(crate) struct FakeClock {
        base: Instant,
        offset: Mutex<Duration>,
        pub sleeps: Mutex<Vec<Duration>>,
    }

    impl FakeClock {
        pub(crate) fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                sleeps: Mutex::new(Vec::new()),
            }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock()
        }

        fn sleep(&self, duration: Duration) {
            *self.offset.lock() += duration;
            self.sleeps.lock().push(duration);
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let clock = FakeClock::new();
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result = policy.run(&clock, "write edge", || {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(io::ErrorKind::NotFound))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(*clock.sleeps.lock(), vec![Duration::from_millis(100); 2]);
    }

    #[test]
    fn surfaces_last_error_when_budget_is_spent() {
        let clock = FakeClock::new();
        let policy = RetryPolicy {
            attempts: 5,
            backoff_ms: 100,
        };
        let mut calls = 0;
        let result: io::Result<()> = policy.run(&clock, "write direction", || {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        });
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(calls, 5);
        assert_eq!(clock.sleeps.lock().len(), 4);
    }
}
