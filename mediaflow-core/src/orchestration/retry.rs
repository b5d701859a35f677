use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

use super::config::RetryConfig;

/// Source of uniform samples in `[0, 1)` used to spread retries.
pub trait JitterSource: Send + Sync + fmt::Debug {
    fn sample(&self) -> f64;
}

/// Reproducible jitter for tests and replayable deployments.
pub struct SeededJitter {
    rng: Mutex<StdRng>,
    seed: u64,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            seed,
        }
    }
}

impl fmt::Debug for SeededJitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededJitter").field("seed", &self.seed).finish()
    }
}

impl JitterSource for SeededJitter {
    fn sample(&self) -> f64 {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.random::<f64>()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Always samples the midpoint, which yields the un-jittered delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn sample(&self) -> f64 {
        0.5
    }
}

/// What to do after a retryable stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay: Duration },
    Exhausted,
}

/// Capped exponential backoff with symmetric jitter.
///
/// `next_delay(n) = min(base * 2^(n-1), max) ± jitter_ratio`, clamped to
/// `[0, max]`.
#[derive(Clone)]
pub struct RetryPolicy {
    base_ms: u64,
    max_ms: u64,
    jitter_ratio: f64,
    jitter: Arc<dyn JitterSource>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("base_ms", &self.base_ms)
            .field("max_ms", &self.max_ms)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let jitter: Arc<dyn JitterSource> = match config.jitter_seed {
            Some(seed) => Arc::new(SeededJitter::new(seed)),
            None => Arc::new(ThreadRngJitter),
        };
        Self::with_jitter(config, jitter)
    }

    pub fn with_jitter(config: &RetryConfig, jitter: Arc<dyn JitterSource>) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            jitter_ratio: f64::from(config.jitter_ratio).clamp(0.0, 1.0),
            jitter,
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn anchor_ms(&self, attempt_number: u32) -> f64 {
        if attempt_number == 0 {
            return 0.0;
        }
        let exp = (attempt_number - 1).min(32) as i32;
        let scaled = (self.base_ms as f64) * 2f64.powi(exp);
        scaled.min(self.max_ms as f64)
    }

    /// Delay before the attempt that follows `attempt_number`.
    pub fn next_delay(&self, attempt_number: u32) -> Duration {
        let anchor = self.anchor_ms(attempt_number);
        if anchor <= 0.0 {
            return Duration::ZERO;
        }

        let span = anchor * self.jitter_ratio;
        let offset = (self.jitter.sample().clamp(0.0, 1.0) * 2.0 - 1.0) * span;
        let jittered = (anchor + offset).clamp(0.0, self.max_ms as f64);
        Duration::from_millis(jittered.round() as u64)
    }

    pub fn should_retry(attempt_number: u32, max_attempts: u32) -> bool {
        attempt_number < max_attempts
    }

    pub fn decide(&self, attempt_number: u32, max_attempts: u32) -> RetryDecision {
        if Self::should_retry(attempt_number, max_attempts) {
            RetryDecision::Retry {
                next_attempt: attempt_number + 1,
                delay: self.next_delay(attempt_number),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}
