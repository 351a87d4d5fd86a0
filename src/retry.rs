// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Scheduling
//!
//! Deterministic exponential backoff shared by the connection supervisor, the
//! publisher and the consumer retry tiers. No jitter is applied.

use crate::errors::AmqpError;
use std::time::Duration;

/// Exponential backoff parameters.
///
/// A policy is immutable once built and can be shared by any number of tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Builds a policy, rejecting a max interval below the initial interval
    /// or a multiplier below one.
    pub fn new(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        max_attempts: u32,
    ) -> Result<RetryPolicy, AmqpError> {
        if max < initial {
            return Err(AmqpError::ConfigurationError(format!(
                "max retry interval {:?} is lower than the initial interval {:?}",
                max, initial
            )));
        }

        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(AmqpError::ConfigurationError(format!(
                "retry multiplier must be a finite value >= 1, got {}",
                multiplier
            )));
        }

        Ok(RetryPolicy {
            initial,
            multiplier,
            max,
            max_attempts,
        })
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Number of retries after the first attempt.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `attempt` (0-indexed) was the last one the policy allows.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay to wait after the 0-indexed `attempt` failed:
    /// `min(initial * multiplier^attempt, max)`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let max_nanos = self.max.as_nanos() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = (self.initial.as_nanos() as f64 * self.multiplier.powi(exponent)).min(max_nanos);

        Duration::from_nanos(nanos.round() as u64)
    }

    /// Worst-case sleep accumulated by a full retry sequence.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_attempts).map(|attempt| self.next_delay(attempt)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: u64, multiplier: f64, max: u64, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(initial),
            multiplier,
            Duration::from_millis(max),
            attempts,
        )
        .unwrap()
    }

    #[test]
    fn first_attempt_waits_the_initial_interval() {
        assert_eq!(policy(100, 2.0, 1000, 2).next_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn delays_grow_then_saturate() {
        let p = policy(100, 2.0, 1000, 10);
        let delays: Vec<u64> = (0..7).map(|a| p.next_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn delays_are_bounded_and_non_decreasing() {
        let p = policy(37, 1.7, 5000, 64);
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = p.next_delay(attempt);
            assert!(delay <= p.max());
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(p.next_delay(u32::MAX), p.max());
    }

    #[test]
    fn multiplier_of_one_is_constant() {
        let p = policy(250, 1.0, 250, 3);
        assert_eq!(p.next_delay(0), p.next_delay(5));
    }

    #[test]
    fn rejects_invalid_bounds() {
        assert!(matches!(
            RetryPolicy::new(Duration::from_millis(10), 2.0, Duration::from_millis(5), 1),
            Err(AmqpError::ConfigurationError(_))
        ));
        assert!(matches!(
            RetryPolicy::new(Duration::from_millis(10), 0.5, Duration::from_millis(50), 1),
            Err(AmqpError::ConfigurationError(_))
        ));
        assert!(RetryPolicy::new(Duration::from_millis(10), f64::NAN, Duration::from_millis(50), 1).is_err());
    }

    #[test]
    fn exhaustion_and_total_backoff() {
        let p = policy(100, 2.0, 1000, 2);
        assert!(!p.is_exhausted(1));
        assert!(p.is_exhausted(2));
        assert_eq!(p.total_backoff(), Duration::from_millis(300));
    }
}
