// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_cable_common::ReconcileConfig;
use std::time::Duration;

/// Capped exponential backoff without jitter, so consecutive delays are
/// strictly increasing until the cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
	pub initial: Duration,
	pub max: Duration,
	pub multiplier: f64,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
		Self {
			initial,
			max,
			multiplier,
		}
	}

	pub fn from_config(config: &ReconcileConfig) -> Self {
		Self::new(
			config.backoff_initial,
			config.backoff_max,
			config.backoff_multiplier,
		)
	}

	/// Delay before retry number `attempt` (1-based). Attempt 0 is treated
	/// as 1.
	pub fn delay(&self, attempt: u32) -> Duration {
		let exp = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
		let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
		if !secs.is_finite() || secs >= self.max.as_secs_f64() {
			return self.max;
		}
		Duration::from_secs_f64(secs)
	}
}

impl Default for Backoff {
	fn default() -> Self {
		Self::from_config(&ReconcileConfig::default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delay_retry_1() {
		assert_eq!(Backoff::default().delay(1), Duration::from_secs(1));
	}

	#[test]
	fn delay_retry_2() {
		assert_eq!(Backoff::default().delay(2), Duration::from_secs(2));
	}

	#[test]
	fn delay_retry_3() {
		assert_eq!(Backoff::default().delay(3), Duration::from_secs(4));
	}

	#[test]
	fn delay_is_capped() {
		let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);
		assert_eq!(backoff.delay(4), Duration::from_secs(8));
		assert_eq!(backoff.delay(5), Duration::from_secs(10));
		assert_eq!(backoff.delay(500), Duration::from_secs(10));
		assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
	}

	#[test]
	fn delays_strictly_increase_until_cap() {
		let backoff = Backoff::default();
		let delays: Vec<_> = (1..=6).map(|n| backoff.delay(n)).collect();
		assert!(delays.windows(2).all(|w| w[0] < w[1]));
		assert!(delays.iter().all(|d| *d <= backoff.max));
	}

	#[test]
	fn attempt_zero_uses_initial() {
		assert_eq!(Backoff::default().delay(0), Duration::from_secs(1));
	}
}
