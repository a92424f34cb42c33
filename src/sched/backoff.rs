// SPDX-License-Identifier: MIT
//! Exponential backoff with jitter for mail source reconnection.
//!
//! Formula: `min(base * multiplier^attempt, max) ± jitter`, where jitter is
//! a uniform fraction of the computed delay so a fleet of pollers does not
//! hammer a recovering server in lockstep.

use std::time::Duration;

use rand::Rng;

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff in milliseconds.
    pub base_ms: u64,
    /// Maximum backoff cap in milliseconds.
    pub max_ms: u64,
    /// Exponential growth multiplier per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed backoff (0.0–1.0).
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 300_000,
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

// ── Computation ──────────────────────────────────────────────────────────────

/// Backoff duration for `attempt` (0-indexed), jittered and non-negative.
pub fn next_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let raw = config.base_ms as f64 * config.multiplier.powi(attempt.min(63) as i32);
    let capped = raw.min(config.max_ms as f64);

    let spread: f64 = rand::thread_rng().gen_range(-0.5..0.5);
    let jittered = (capped + capped * config.jitter_fraction * spread).max(0.0);

    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts() {
        let cfg = BackoffConfig {
            jitter_fraction: 0.0,
            ..BackoffConfig::default()
        };
        assert!(next_backoff(0, &cfg) < next_backoff(3, &cfg));
        assert_eq!(next_backoff(0, &cfg), Duration::from_millis(500));
        assert_eq!(next_backoff(2, &cfg), Duration::from_millis(2000));
    }

    #[test]
    fn backoff_is_capped_even_for_huge_attempts() {
        let cfg = BackoffConfig::default();
        let max_with_jitter =
            cfg.max_ms + (cfg.max_ms as f64 * cfg.jitter_fraction / 2.0) as u64;
        for attempt in [10, 100, u32::MAX] {
            assert!(next_backoff(attempt, &cfg).as_millis() as u64 <= max_with_jitter);
        }
    }
}
