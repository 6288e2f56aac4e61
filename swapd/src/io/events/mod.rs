// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Fan-out of swap status changes. Subscribers get a bounded, per-swap
//! lossless stream of every update published after they subscribed; late
//! subscribers can replay the latest status only.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use tokio::sync::broadcast;

use crate::swap::status::SwapUpdate;

pub struct EventBus {
	sender: broadcast::Sender<SwapUpdate>,
	latest: Mutex<HashMap<String, SwapUpdate>>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender, latest: Mutex::new(HashMap::new()) }
	}

	pub fn publish(&self, update: SwapUpdate) {
		debug!("Publishing status {} for swap {}", update.status, update.id);
		self.latest.lock().unwrap().insert(update.id.clone(), update.clone());
		// Fan-out failure only means there is no subscriber right now.
		let _ = self.sender.send(update);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SwapUpdate> {
		self.sender.subscribe()
	}

	pub fn latest(&self, swap_id: &str) -> Option<SwapUpdate> {
		self.latest.lock().unwrap().get(swap_id).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::swap::status::SwapStatus;

	#[tokio::test]
	async fn test_subscriber_receives_updates_in_order() {
		let bus = EventBus::new(16);
		let mut rx = bus.subscribe();
		bus.publish(SwapUpdate::new("a", SwapStatus::SwapCreated));
		bus.publish(SwapUpdate::new("a", SwapStatus::TransactionMempool));

		assert_eq!(rx.recv().await.unwrap().status, SwapStatus::SwapCreated);
		assert_eq!(rx.recv().await.unwrap().status, SwapStatus::TransactionMempool);
	}

	#[test]
	fn test_late_subscriber_replays_latest_only() {
		let bus = EventBus::new(16);
		bus.publish(SwapUpdate::new("a", SwapStatus::SwapCreated));
		bus.publish(SwapUpdate::new("a", SwapStatus::TransactionMempool));

		let latest = bus.latest("a").unwrap();
		assert_eq!(latest.status, SwapStatus::TransactionMempool);
		assert!(bus.latest("b").is_none());
	}
}
