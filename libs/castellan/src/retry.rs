use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::{MAX_RETRY_ATTEMPTS, MAX_RETRY_BASE_DELAY, MIN_RETRY_BASE_DELAY};
use crate::error::{Error, Result};

pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// One retry policy for every transient-prone operation: transaction
/// broadcast, gas estimation, gas price lookup, connectivity check.
/// Whether an error qualifies is decided by `Error::is_transient`, never
/// by the call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, jitter: bool) -> Result<Self> {
        if max_attempts == 0 || max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(Error::Configuration(format!(
                "retry attempts {max_attempts} outside [1, {MAX_RETRY_ATTEMPTS}]"
            )));
        }
        if !(MIN_RETRY_BASE_DELAY..=MAX_RETRY_BASE_DELAY).contains(&base_delay) {
            return Err(Error::Configuration(format!(
                "retry base delay {base_delay:?} outside [{MIN_RETRY_BASE_DELAY:?}, {MAX_RETRY_BASE_DELAY:?}]"
            )));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            jitter,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `op` until it succeeds, fails non-transiently, or the attempt
    /// budget is spent. The exhaustion error carries the attempt count.
    pub async fn run<T, Fut>(&self, label: &str, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(self.jittered(delay)).await;
                    delay = delay.mul_f64(BACKOFF_MULTIPLIER);
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(err.after_attempts(label, self.max_attempts));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            delay
        }
    }
}
