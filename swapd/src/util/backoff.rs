// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::time::Duration;

/// Bounded exponential backoff. `delay(0)` returns the base delay, every
/// further attempt doubles it up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
	base: Duration,
	max: Duration,
}

impl Backoff {
	pub fn new(base: Duration, max: Duration) -> Self {
		Self { base, max }
	}

	pub fn delay(&self, attempt: u32) -> Duration {
		let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
		self.base.checked_mul(factor).map_or(self.max, |d| d.min(self.max))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_doubles_until_capped() {
		let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
		assert_eq!(backoff.delay(0), Duration::from_secs(1));
		assert_eq!(backoff.delay(1), Duration::from_secs(2));
		assert_eq!(backoff.delay(2), Duration::from_secs(4));
		assert_eq!(backoff.delay(3), Duration::from_secs(8));
		assert_eq!(backoff.delay(4), Duration::from_secs(10));
		assert_eq!(backoff.delay(63), Duration::from_secs(10));
	}
}
