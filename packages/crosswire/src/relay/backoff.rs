//! Reconnect backoff for bus connections.
//!
//! Linear-then-capped delays bounded by both an attempt count and a total
//! elapsed time. Time is passed in by the caller, so the schedule can be
//! stepped in tests without sleeping.

use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay added per attempt
    pub step: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Give up once this much time has passed since the first failure
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(100),
            max_delay: Duration::from_millis(3000),
            max_attempts: 10,
            max_elapsed: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    Attempts(u32),
    Elapsed(Duration),
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempts(n) => write!(f, "{n} attempts exhausted"),
            Self::Elapsed(d) => write!(f, "retry time exhausted after {}s", d.as_secs()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    Retry { attempt: u32, delay: Duration },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    started: Instant,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy, now: Instant) -> Self {
        Self {
            policy,
            attempt: 0,
            started: now,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Advance after a failed attempt observed at `now`.
    pub fn next(&mut self, now: Instant) -> BackoffStep {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed > self.policy.max_elapsed {
            return BackoffStep::GiveUp(GiveUpReason::Elapsed(elapsed));
        }
        if self.attempt >= self.policy.max_attempts {
            return BackoffStep::GiveUp(GiveUpReason::Attempts(self.attempt));
        }

        self.attempt += 1;
        let delay = self
            .policy
            .step
            .saturating_mul(self.attempt)
            .min(self.policy.max_delay);
        BackoffStep::Retry {
            attempt: self.attempt,
            delay,
        }
    }
}
