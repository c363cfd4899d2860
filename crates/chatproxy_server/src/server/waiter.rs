#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default re-check interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
	#[error("{what} was not confirmed after {} ms", .after.as_millis())]
	Timeout {
		what: &'static str,
		after: Duration,
	},

	#[error("{what} wait cancelled")]
	Cancelled {
		what: &'static str,
	},
}

/// Successful wait: what was confirmed and how long it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
	pub what: &'static str,
	pub elapsed: Duration,
}

impl fmt::Display for WaitOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} confirmed after {} ms", self.what, self.elapsed.as_millis())
	}
}

/// Waits for an externally driven condition by re-checking it on a fixed schedule.
#[derive(Debug, Clone, Copy)]
pub struct PollingWaiter {
	interval: Duration,
	timeout: Duration,
}

impl PollingWaiter {
	pub fn new(interval: Duration, timeout: Duration) -> Self {
		Self {
			interval: interval.max(Duration::from_millis(1)),
			timeout,
		}
	}

	/// Resolve once `check` returns true, the timeout elapses, or `cancel` fires.
	///
	/// The first check runs one interval after the call. A check that succeeds on the
	/// tick where the timeout is reached still counts as success.
	pub async fn wait<F>(&self, what: &'static str, mut check: F, cancel: &CancellationToken) -> Result<WaitOutcome, WaitError>
	where
		F: FnMut() -> bool,
	{
		let start = Instant::now();
		let mut ticker = tokio::time::interval_at(start + self.interval, self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;

				_ = cancel.cancelled() => {
					return Err(WaitError::Cancelled { what });
				}

				_ = ticker.tick() => {
					let elapsed = start.elapsed();
					if check() {
						return Ok(WaitOutcome { what, elapsed });
					}
					if elapsed >= self.timeout {
						return Err(WaitError::Timeout { what, after: self.timeout });
					}
				}
			}
		}
	}
}
