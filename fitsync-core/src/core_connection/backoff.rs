//! Reconnect schedule
//!
//! After each unexpected closure the schedule yields
//! `min(max, current * (1 + 0.5 * r1)) + r2 * max_jitter`, never more than
//! `max`, then grows `current` by the multiplier. More than `max_attempts`
//! consecutive failures give up.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;

/// Source of uniform samples in `[0, 1)`
pub type JitterSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Jitter drawn from the thread-local RNG
pub fn random_jitter() -> JitterSource {
    Arc::new(rand::random::<f64>)
}

/// Outcome of [`Backoff::next_step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Reconnect after `delay`; `attempt` is 1-based
    Retry { attempt: u32, delay: Duration },
    /// Ceiling exceeded
    GiveUp { attempts: u32 },
}

pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_jitter: Duration,
    max_attempts: u32,
    current: Duration,
    attempts: u32,
    jitter: JitterSource,
}

impl Backoff {
    pub fn new(config: &ConnectionConfig) -> Self {
        let initial = config.initial_backoff.min(config.max_backoff);
        Self {
            initial,
            max: config.max_backoff,
            multiplier: config.backoff_multiplier.max(1.0),
            max_jitter: config.max_jitter,
            max_attempts: config.max_attempts,
            current: initial,
            attempts: 0,
            jitter: random_jitter(),
        }
    }

    pub fn with_jitter(mut self, jitter: JitterSource) -> Self {
        self.jitter = jitter;
        self
    }

    fn sample(&self) -> f64 {
        let r = (self.jitter)();
        if r.is_finite() {
            r.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Interval the next retry is based on, before jitter
    pub fn current_interval(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and decide what to do about it
    pub fn next_step(&mut self) -> BackoffStep {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            return BackoffStep::GiveUp { attempts: self.attempts - 1 };
        }

        let stretched = self.current.mul_f64(1.0 + 0.5 * self.sample()).min(self.max);
        let delay = (stretched + self.max_jitter.mul_f64(self.sample())).min(self.max);
        self.current = self.current.mul_f64(self.multiplier).min(self.max);

        BackoffStep::Retry { attempt: self.attempts, delay }
    }

    /// Forget past failures, after a successful open
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.initial;
    }
}
