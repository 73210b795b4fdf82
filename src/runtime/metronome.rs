use std::time::Duration;

use log::debug;

use tokio::time::Instant;

/// Fixed-rhythm tick source.
///
/// The first tick fires immediately. After that, ticks are spaced by the
/// interval, measured from the previous deadline rather than from when the
/// caller got around to asking. If the caller is late by one or more whole
/// intervals, the overdue ticks are skipped instead of being fired back to
/// back.
pub struct Metronome {
	interval: Duration,
	deadline: Option<Instant>,
	skipped: u64,
}

impl Metronome {
	pub fn new(interval: Duration) -> Self {
		Self{
			interval,
			deadline: None,
			skipped: 0,
		}
	}

	/// Number of ticks dropped so far because the caller was too slow.
	pub fn skipped(&self) -> u64 {
		self.skipped
	}

	fn next_deadline(&mut self, now: Instant) -> Instant {
		let prev = match self.deadline {
			Some(v) => v,
			None => return now,
		};
		// skip ticks if we're too slow, but stay true to the rhythm
		let factor = match now.checked_duration_since(prev) {
			Some(v) => (v.as_micros() / self.interval.as_micros().max(1) + 1) as u32,
			None => 1,
		};
		if factor > 1 {
			debug!("metronome running late, skipping {} tick(s)", factor - 1);
			self.skipped += (factor - 1) as u64;
		}
		prev + self.interval * factor
	}

	/// Wait for the next tick and return its deadline.
	pub async fn tick(&mut self) -> Instant {
		let next = self.next_deadline(Instant::now());
		tokio::time::sleep_until(next).await;
		self.deadline = Some(next);
		next
	}
}
