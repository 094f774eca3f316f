use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

pub type ErrorClassifier = fn(&CoreError) -> ErrorClass;

/// Transient provider failures retry; everything else is final.
pub fn classify_by_kind(error: &CoreError) -> ErrorClass {
    match error.kind {
        CoreErrorKind::Network
        | CoreErrorKind::RateLimited
        | CoreErrorKind::Upstream
        | CoreErrorKind::Timeout
        | CoreErrorKind::ProcessFailure => ErrorClass::Retryable,
        CoreErrorKind::InvalidInput
        | CoreErrorKind::MalformedInput
        | CoreErrorKind::AuthFailure
        | CoreErrorKind::Cancelled
        | CoreErrorKind::StorageFailure
        | CoreErrorKind::Backpressure
        | CoreErrorKind::DuplicateSubmission
        | CoreErrorKind::UnknownRun
        | CoreErrorKind::ShuttingDown
        | CoreErrorKind::Internal => ErrorClass::Permanent,
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay: Duration },
    GiveUp { class: ErrorClass, exhausted: bool },
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_fraction: f64,
    pub max_delay: Duration,
    pub classify: ErrorClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            max_delay: Duration::from_secs(300),
            classify: classify_by_kind,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_classifier(mut self, classify: ErrorClassifier) -> Self {
        self.classify = classify;
        self
    }

    /// Pure retry decision for the error raised by attempt number `attempt` (1-based).
    ///
    /// `jitter_sample` is expected in `[-1.0, 1.0]`; it scales the delay by
    /// `1 + jitter_fraction * jitter_sample`.
    pub fn decide(&self, error: &CoreError, attempt: u32, jitter_sample: f64) -> RetryDecision {
        let class = (self.classify)(error);
        if class == ErrorClass::Permanent {
            return RetryDecision::GiveUp {
                class,
                exhausted: false,
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                class,
                exhausted: true,
            };
        }

        RetryDecision::Retry {
            next_attempt: attempt + 1,
            delay: self.backoff_delay(attempt, jitter_sample),
        }
    }

    pub fn decide_with_jitter(&self, error: &CoreError, attempt: u32) -> RetryDecision {
        let sample = if self.jitter_fraction > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.decide(error, attempt, sample)
    }

    /// `base_delay * backoff_multiplier^(attempt-1) * (1 ± jitter_fraction)`, capped at
    /// `max_delay`.
    pub fn backoff_delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let jitter = 1.0 + self.jitter_fraction * jitter_sample.clamp(-1.0, 1.0);
        let seconds = (scaled * jitter).max(0.0);

        Duration::try_from_secs_f64(seconds)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}
