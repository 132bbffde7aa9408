//! Bounded retry with backoff.
//!
//! Detector invocations and correlation lookups retry a fixed number of
//! times with a growing delay. The policy is deliberately small: external
//! queues provide the real retry story, this only rides out blips.

use anyhow::Result;
use std::time::Duration;

/// Retry policy: `attempts` tries, sleeping `base_delay × attempt` between
/// them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	pub attempts: u32,
	pub base_delay: Duration,
}

impl RetryPolicy {
	pub fn new(attempts: u32, base_delay: Duration) -> Self {
		Self {
			attempts: attempts.max(1),
			base_delay,
		}
	}

	/// A single attempt, no waiting.
	pub fn once() -> Self {
		Self::new(1, Duration::ZERO)
	}

	/// Delay before the given (1-based) retry.
	pub fn delay_before(&self, retry: u32) -> Duration {
		self.base_delay * retry
	}

	/// Runs `operation` until it succeeds or the attempts are exhausted,
	/// returning the last error.
	pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let mut last_error = None;
		for attempt in 1..=self.attempts {
			match operation().await {
				Ok(value) => return Ok(value),
				Err(error) => {
					if attempt < self.attempts {
						log::warn!("{what} failed (attempt {attempt}/{}), retrying: {error:#}", self.attempts);
						tokio::time::sleep(self.delay_before(attempt)).await;
					}
					last_error = Some(error);
				}
			}
		}
		Err(last_error.expect("at least one attempt ran"))
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::new(3, Duration::from_millis(100))
	}
}
