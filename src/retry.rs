//! Retry-until-done driver with escalating sleeps and an overall deadline.
//!
//! Used for file operations on shares that fail transiently: every attempt
//! runs `action`, then `done` decides whether the operation succeeded. Between
//! attempts the driver sleeps 1ms, 20ms or 100ms depending on how long the
//! operation has been running, and gives up with [`TunnelError::Timeout`]
//! once the deadline passes.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::protocol::timing::{
    BACKOFF_FAST, BACKOFF_FAST_UNTIL, BACKOFF_MEDIUM, BACKOFF_MEDIUM_UNTIL, BACKOFF_SLOW,
};

/// State handed to each attempt
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    pub number: u32,
    pub elapsed: Duration,
    pub operation: &'a str,
}

/// Sleep before the next attempt, or `None` once the deadline has passed.
pub fn backoff(elapsed: Duration, timeout: Duration) -> Option<Duration> {
    if elapsed > timeout {
        None
    } else if elapsed < BACKOFF_FAST_UNTIL {
        Some(BACKOFF_FAST)
    } else if elapsed < BACKOFF_MEDIUM_UNTIL {
        Some(BACKOFF_MEDIUM)
    } else {
        Some(BACKOFF_SLOW)
    }
}

pub struct Retry<'a> {
    operation: String,
    timeout: Duration,
    stop: Option<&'a AtomicBool>,
}

impl<'a> Retry<'a> {
    pub fn new(operation: impl Into<String>, timeout: Duration) -> Self {
        Retry {
            operation: operation.into(),
            timeout,
            stop: None,
        }
    }

    /// Abort with [`TunnelError::Shutdown`] as soon as `flag` is raised.
    pub fn stop_on(mut self, flag: &'a AtomicBool) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Run until `done` returns true. Returns the number of attempts made.
    pub fn run<A, D>(&self, mut action: A, mut done: D) -> Result<u32>
    where
        A: FnMut(&Attempt),
        D: FnMut(&Attempt) -> bool,
    {
        let started = Instant::now();
        let mut number = 0u32;
        loop {
            number += 1;
            let attempt = Attempt {
                number,
                elapsed: started.elapsed(),
                operation: &self.operation,
            };

            action(&attempt);
            if done(&attempt) {
                if number > 1 {
                    debug!(
                        operation = %self.operation,
                        attempts = number,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "completed after retrying"
                    );
                }
                return Ok(number);
            }

            if self.stop.is_some_and(|s| s.load(Ordering::Relaxed)) {
                return Err(TunnelError::Shutdown);
            }

            match backoff(started.elapsed(), self.timeout) {
                Some(pause) => thread::sleep(pause),
                None => return Err(TunnelError::timeout(self.operation.clone(), self.timeout)),
            }
        }
    }

    /// Convenience for a fallible operation that is simply repeated until it succeeds.
    pub fn until_ok<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> std::io::Result<T>,
    {
        let value = RefCell::new(None);
        self.run(
            |attempt| match op() {
                Ok(v) => *value.borrow_mut() = Some(v),
                Err(e) => debug!(
                    operation = attempt.operation,
                    attempt = attempt.number,
                    "attempt failed: {e}"
                ),
            },
            |_| value.borrow().is_some(),
        )?;
        value
            .into_inner()
            .ok_or_else(|| TunnelError::timeout(self.operation.clone(), self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn backoff_bands() {
        let t = Duration::from_secs(5);
        assert_eq!(backoff(Duration::from_millis(10), t), Some(BACKOFF_FAST));
        assert_eq!(backoff(Duration::from_millis(500), t), Some(BACKOFF_MEDIUM));
        assert_eq!(backoff(Duration::from_millis(2000), t), Some(BACKOFF_SLOW));
        assert_eq!(backoff(Duration::from_millis(5001), t), None);
    }

    #[test]
    fn succeeds_after_a_few_attempts() {
        let calls = std::cell::Cell::new(0);
        let attempts = Retry::new("flaky", Duration::from_secs(1))
            .run(|_| calls.set(calls.get() + 1), |_| calls.get() >= 3)
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_at_deadline() {
        let started = Instant::now();
        let err = Retry::new("never", Duration::from_millis(50))
            .run(|_| {}, |_| false)
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("never has exceeded"));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn stops_when_flag_raised() {
        let flag = AtomicBool::new(true);
        let err = Retry::new("stopped", Duration::from_secs(60))
            .stop_on(&flag)
            .run(|_| {}, |_| false)
            .unwrap_err();
        assert!(matches!(err, TunnelError::Shutdown));
    }

    #[test]
    fn until_ok_returns_value() {
        let mut failures = 2;
        let v = Retry::new("read", Duration::from_secs(1))
            .until_ok(|| {
                if failures > 0 {
                    failures -= 1;
                    Err(io::Error::new(io::ErrorKind::Other, "busy"))
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(v, 42);
    }
}
