use std::ops::Range;
use tokio::time::Duration;

/// Backoff delay for reconnection attempts, clamped to a `[min, max)` range.
/// The delay starts at `range.start` and is nudged upward by the caller as
/// failures repeat; `reset` drops it back to the floor on a successful
/// connection.
#[derive(Debug)]
pub struct HoldOff {
	range: Range<Duration>,
	current: Duration,
}

impl HoldOff {
	pub fn new(range: Range<Duration>) -> Self {
		let current = range.start;
		Self { range, current }
	}

	/// Sleeps for the current delay, then increases it for next time via
	/// `f`. On the very first call this still sleeps for `range.start`,
	/// which the caller typically sets to a small or zero duration so the
	/// first connection attempt isn't held off.
	pub async fn wait_and_increase_with(&mut self, f: impl FnOnce(Duration) -> Duration) {
		if !self.current.is_zero() {
			tokio::time::sleep(self.current).await;
		}
		self.increase_with(f);
	}

	/// Increases the current delay via `f`, clamped to stay inside `range`.
	pub fn increase_with(&mut self, f: impl FnOnce(Duration) -> Duration) {
		let next = f(self.current);
		self.current = next.clamp(self.range.start, self.range.end);
	}

	/// Resets the delay to the floor, e.g. after a successful CONNACK.
	pub fn reset(&mut self) {
		self.current = self.range.start;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn wait_and_increase_doubles_and_clamps() {
		let mut holdoff = HoldOff::new(Duration::from_millis(1)..Duration::from_millis(10));
		holdoff.wait_and_increase_with(|d| d * 2).await;
		assert_eq!(holdoff.current, Duration::from_millis(2));
		for _ in 0..10 {
			holdoff.increase_with(|d| d * 2);
		}
		assert_eq!(holdoff.current, Duration::from_millis(10));
	}

	#[test]
	fn reset_drops_to_floor() {
		let mut holdoff = HoldOff::new(Duration::from_millis(5)..Duration::from_millis(500));
		holdoff.increase_with(|d| d * 10);
		assert_eq!(holdoff.current, Duration::from_millis(50));
		holdoff.reset();
		assert_eq!(holdoff.current, Duration::from_millis(5));
	}
}
