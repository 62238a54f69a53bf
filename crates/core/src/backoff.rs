//! Delay schedules for retries and status polling.
//!
//! Both are pure functions of their inputs so the engine can be tested with
//! a paused clock and the sequences can be asserted directly.

use std::time::Duration;

use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// Retry backoff
// ---------------------------------------------------------------------------

/// Tunable parameters for retrying a failed operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next retry delay from the current delay.
///
/// The result is clamped to [`RetryBackoff::max_delay`].
pub fn next_delay(current: Duration, config: &RetryBackoff) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

// ---------------------------------------------------------------------------
// Poll schedule
// ---------------------------------------------------------------------------

/// What the last status check produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Provider answered, job still running.
    Running,
    /// Call failed with a retryable error.
    Transient,
}

/// Next action for a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Check status again after this delay.
    Wait(Duration),
    /// The task timeout has been reached.
    TimedOut,
}

/// Exponential polling schedule with a cap and an overall timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSchedule {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Jitter ratio in `0.0..=1.0`.
    pub jitter: f64,
    pub timeout: Duration,
}

impl PollSchedule {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base: config.poll_interval,
            factor: config.poll_backoff_factor,
            max: config.max_poll_interval.max(config.poll_interval),
            jitter: config.poll_jitter.clamp(0.0, 1.0),
            timeout: config.task_timeout,
        }
    }

    /// Un-jittered delay after `attempt` consecutive non-progress results.
    /// `attempt == 0` is the base interval.
    pub fn interval(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64();
        let scaled = base * self.factor.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let max = self.max.as_secs_f64();
        if !scaled.is_finite() || scaled >= max {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Attempt counter after `outcome`, given the one before it.
    ///
    /// A successful answer following a transient error counts as a state
    /// change and resets the schedule to the base interval.
    pub fn next_attempt(attempt: u32, previous: Option<PollOutcome>, outcome: PollOutcome) -> u32 {
        match (previous, outcome) {
            (Some(PollOutcome::Transient), PollOutcome::Running) => 0,
            _ => attempt.saturating_add(1),
        }
    }

    /// Decide the next step for a job that has been remote for `elapsed`.
    ///
    /// The wait never overshoots the timeout, so the timeout is noticed at
    /// the deadline even if the regular interval would land later.
    pub fn next_step(&self, attempt: u32, elapsed: Duration) -> PollStep {
        if elapsed >= self.timeout {
            return PollStep::TimedOut;
        }
        let remaining = self.timeout - elapsed;
        PollStep::Wait(self.interval(attempt).min(remaining))
    }

    /// Apply jitter to `delay`. `sample` is a uniform draw in `-1.0..=1.0`.
    /// The result stays within `0..=max`.
    pub fn jittered(&self, delay: Duration, sample: f64) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + self.jitter * sample.clamp(-1.0, 1.0);
        let secs = (delay.as_secs_f64() * factor).max(0.0);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
