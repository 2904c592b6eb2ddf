use std::thread;
use std::time::Duration;

/// Blocking delay source. Tests substitute a recording fake.
pub trait Sleeper: Send {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Result of a bounded retry loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// An attempt succeeded
    Done { value: T, attempts: u32 },
    /// Every attempt failed; carries the last error
    Exhausted { error: E, attempts: u32 },
    /// The liveness check failed between attempts
    Cancelled { attempts: u32 },
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Device open: 10 attempts, 2 s apart
    pub const DEVICE_OPEN: RetryPolicy = RetryPolicy {
        max_attempts: 10,
        delay: Duration::from_secs(2),
    };

    /// Card activation: 3 attempts, 500 ms apart
    pub const ACTIVATION: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(500),
    };

    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `attempt` until it succeeds or the policy is exhausted.
    ///
    /// `on_failure` sees every failed attempt. `keep_going` is checked after
    /// each delay and aborts the loop when it returns false.
    pub fn run<T, E>(
        &self,
        sleeper: &dyn Sleeper,
        mut keep_going: impl FnMut() -> bool,
        mut on_failure: impl FnMut(u32, &E),
        mut attempt: impl FnMut(u32) -> Result<T, E>,
    ) -> RetryOutcome<T, E> {
        let mut n = 0;
        loop {
            n += 1;
            match attempt(n) {
                Ok(value) => return RetryOutcome::Done { value, attempts: n },
                Err(error) => {
                    on_failure(n, &error);
                    if n >= self.max_attempts {
                        return RetryOutcome::Exhausted { error, attempts: n };
                    }
                }
            }
            sleeper.sleep(self.delay);
            if !keep_going() {
                return RetryOutcome::Cancelled { attempts: n };
            }
        }
    }
}
