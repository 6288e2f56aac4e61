// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Clock over block height and wall time.
//!
//! Swaps are indexed by `timeout_block_height` per currency; every block
//! tick drains *all* due entries, so ticks missed while the daemon was busy
//! still fire. Wall-clock deadlines (cooperative-claim fallbacks) are
//! absolute instants for the same reason.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use tokio::time::Instant;

use crate::chain::SwapRef;
use crate::swap::SwapType;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeightDeadline {
	height: u32,
	// SwapRef fields inlined to keep the tuple orderable.
	swap_type_tag: u8,
	swap_id: String,
}

pub struct TimeoutWatcher {
	heights: Mutex<HashMap<String, BinaryHeap<Reverse<HeightDeadline>>>>,
	wall_clock: Mutex<Vec<(Instant, String)>>,
}

impl TimeoutWatcher {
	pub fn new() -> Self {
		Self { heights: Mutex::new(HashMap::new()), wall_clock: Mutex::new(Vec::new()) }
	}

	pub fn track(&self, symbol: &str, timeout_block_height: u32, swap: SwapRef) {
		let deadline = HeightDeadline {
			height: timeout_block_height,
			swap_type_tag: type_tag(swap.swap_type),
			swap_id: swap.id,
		};
		self.heights
			.lock()
			.unwrap()
			.entry(symbol.to_string())
			.or_default()
			.push(Reverse(deadline));
	}

	/// Drains every entry due at `height` for the currency.
	pub fn drain_due(&self, symbol: &str, height: u32) -> Vec<SwapRef> {
		let mut heights = self.heights.lock().unwrap();
		let heap = match heights.get_mut(symbol) {
			Some(heap) => heap,
			None => return Vec::new(),
		};
		let mut due = Vec::new();
		while let Some(Reverse(deadline)) = heap.peek() {
			if deadline.height > height {
				break;
			}
			let Reverse(deadline) = heap.pop().expect("peeked entry exists");
			due.push(SwapRef {
				swap_type: type_from_tag(deadline.swap_type_tag),
				id: deadline.swap_id,
			});
		}
		due
	}

	pub fn track_wall_clock(&self, swap_id: &str, deadline: Instant) {
		self.wall_clock.lock().unwrap().push((deadline, swap_id.to_string()));
	}

	pub fn untrack_wall_clock(&self, swap_id: &str) {
		self.wall_clock.lock().unwrap().retain(|(_, id)| id != swap_id);
	}

	/// The earliest pending wall-clock deadline, for the main loop to sleep
	/// until.
	pub fn next_wall_clock_deadline(&self) -> Option<Instant> {
		self.wall_clock.lock().unwrap().iter().map(|(at, _)| *at).min()
	}

	pub fn drain_due_wall_clock(&self, now: Instant) -> Vec<String> {
		let mut wall_clock = self.wall_clock.lock().unwrap();
		let due =
			wall_clock.iter().filter(|(at, _)| *at <= now).map(|(_, id)| id.clone()).collect();
		wall_clock.retain(|(at, _)| *at > now);
		due
	}
}

fn type_tag(swap_type: SwapType) -> u8 {
	match swap_type {
		SwapType::Submarine => 0,
		SwapType::Reverse => 1,
		SwapType::Chain => 2,
	}
}

fn type_from_tag(tag: u8) -> SwapType {
	match tag {
		0 => SwapType::Submarine,
		1 => SwapType::Reverse,
		_ => SwapType::Chain,
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	fn swap_ref(id: &str) -> SwapRef {
		SwapRef { swap_type: SwapType::Submarine, id: id.to_string() }
	}

	#[test]
	fn test_drains_all_due_entries() {
		let watcher = TimeoutWatcher::new();
		watcher.track("BTC", 100, swap_ref("a"));
		watcher.track("BTC", 101, swap_ref("b"));
		watcher.track("BTC", 150, swap_ref("c"));

		assert!(watcher.drain_due("BTC", 99).is_empty());

		// A missed tick at 100 still fires once 101 arrives.
		let due = watcher.drain_due("BTC", 101);
		let mut ids: Vec<_> = due.iter().map(|swap| swap.id.as_str()).collect();
		ids.sort_unstable();
		assert_eq!(ids, ["a", "b"]);

		assert_eq!(watcher.drain_due("BTC", 200).len(), 1);
		assert!(watcher.drain_due("BTC", 200).is_empty());
	}

	#[test]
	fn test_currencies_are_independent() {
		let watcher = TimeoutWatcher::new();
		watcher.track("BTC", 100, swap_ref("a"));
		assert!(watcher.drain_due("L-BTC", 100).is_empty());
		assert_eq!(watcher.drain_due("BTC", 100).len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_wall_clock_deadlines_are_absolute() {
		let watcher = TimeoutWatcher::new();
		let deadline = Instant::now() + Duration::from_secs(30);
		watcher.track_wall_clock("swap", deadline);

		assert_eq!(watcher.next_wall_clock_deadline(), Some(deadline));
		assert!(watcher.drain_due_wall_clock(Instant::now()).is_empty());

		tokio::time::advance(Duration::from_secs(60)).await;
		assert_eq!(watcher.drain_due_wall_clock(Instant::now()), vec!["swap".to_string()]);
		assert!(watcher.next_wall_clock_deadline().is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn test_untrack_wall_clock_cancels() {
		let watcher = TimeoutWatcher::new();
		watcher.track_wall_clock("swap", Instant::now() + Duration::from_secs(5));
		watcher.untrack_wall_clock("swap");
		tokio::time::advance(Duration::from_secs(10)).await;
		assert!(watcher.drain_due_wall_clock(Instant::now()).is_empty());
	}
}
