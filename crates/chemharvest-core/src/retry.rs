//! Retry/backoff controller: the single place where a call's failure class
//! turns into retry, isolate, or give up.

use std::time::Duration;

use crate::error::{CallError, CallResult};
use crate::shutdown::Shutdown;

/// Sleep seam, so cooldowns and pacing are observable in tests.
pub trait Clock: Send + Sync {
    /// Sleep for `duration`; returns `false` if woken early by shutdown.
    fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool;
}

/// Wall-clock sleeps, sliced so shutdown interrupts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool {
        shutdown.sleep(duration)
    }
}

/// Why an item was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abandoned {
    /// The call failed with a fatal classification
    Fatal(String),
    /// Retryable failures exceeded `max_retries`
    Exhausted { attempts: u32, last: String },
    /// Shutdown arrived during a cooldown; the item is left for the next run
    Interrupted,
}

impl Abandoned {
    /// Reason recorded in the job summary
    pub fn reason(&self) -> String {
        match self {
            Self::Fatal(r) => r.clone(),
            Self::Exhausted { attempts, last } => {
                format!("gave up after {attempts} attempts: {last}")
            }
            Self::Interrupted => "interrupted".to_string(),
        }
    }
}

/// Cooldown-and-retry policy for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause after a retryable failure before repeating the call
    pub cooldown: Duration,
    /// Upper bound on retries; `None` retries until shutdown
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    pub const fn new(cooldown: Duration, max_retries: Option<u32>) -> Self {
        Self {
            cooldown,
            max_retries,
        }
    }

    /// Run `attempt_fn` until it succeeds, fails fatally, exhausts retries,
    /// or shutdown interrupts a cooldown.
    ///
    /// `attempt_fn` must be safe to repeat for the same item.
    pub fn run<T>(
        &self,
        label: &str,
        clock: &dyn Clock,
        shutdown: &Shutdown,
        mut attempt_fn: impl FnMut() -> CallResult<T>,
    ) -> Result<T, Abandoned> {
        let mut retries = 0u32;
        loop {
            match attempt_fn() {
                Ok(v) => return Ok(v),
                Err(CallError::Fatal(reason)) => {
                    log::debug!("{label}: fatal: {reason}");
                    return Err(Abandoned::Fatal(reason));
                }
                Err(CallError::Retryable(reason)) => {
                    if self.max_retries.is_some_and(|max| retries >= max) {
                        return Err(Abandoned::Exhausted {
                            attempts: retries + 1,
                            last: reason,
                        });
                    }
                    retries += 1;
                    log::warn!(
                        "{label}: {reason}, cooling down {:?} (retry {retries})",
                        self.cooldown
                    );
                    if !clock.sleep(self.cooldown, shutdown) {
                        return Err(Abandoned::Interrupted);
                    }
                }
            }
        }
    }
}
