// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exponential backoff schedule shared by publisher and consumer retries.

use crate::config::RetryPolicy;
use std::time::Duration;

/// Delays derived from a [`RetryPolicy`].
///
/// The delay before retry `k` (the `k + 1`-th attempt) is
/// `min(initial * multiplier^(k-1), max(initial, max_interval))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl From<&RetryPolicy> for ExponentialBackoff {
    fn from(policy: &RetryPolicy) -> Self {
        ExponentialBackoff {
            max_attempts: policy.effective_max_attempts(),
            initial: policy.initial_interval(),
            multiplier: policy.effective_multiplier(),
            max: policy.effective_max_interval(),
        }
    }
}

impl ExponentialBackoff {
    /// Total number of attempts, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True when `attempt` (1-based) may be followed by another one.
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let max = self.max.as_millis() as f64;

        if !millis.is_finite() || millis >= max {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}
