// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use log::{debug, info};
use tokio::sync::mpsc;

use crate::chain::{ChainEvent, SwapRef};

/// Watches output scripts on one chain and normalises raw `rawtx`/`hashblock`
/// notifications into [`ChainEvent`]s.
///
/// Duplicate notifications are suppressed per (txid, vout, confirmed), so a
/// transaction first seen in the mempool and later in a block produces
/// exactly two `OutputFound` events. A reorg that unconfirms a recorded
/// output clears the confirmed marker again, so the eventual re-confirmation
/// is delivered after the retraction.
pub struct ChainListener {
	symbol: String,
	state: Mutex<ListenerState>,
	events: mpsc::Sender<ChainEvent>,
}

#[derive(Default)]
struct ListenerState {
	watched: HashMap<ScriptBuf, SwapRef>,
	watched_outpoints: HashMap<OutPoint, SwapRef>,
	seen: HashSet<(Txid, u32, bool)>,
	spent_seen: HashSet<OutPoint>,
	/// Watched outputs observed in a block, kept for reorg retraction.
	confirmed: HashMap<Txid, Vec<(ScriptBuf, u32)>>,
}

impl ChainListener {
	pub fn new(symbol: &str, events: mpsc::Sender<ChainEvent>) -> Self {
		Self { symbol: symbol.to_string(), state: Mutex::new(ListenerState::default()), events }
	}

	pub fn symbol(&self) -> &str {
		&self.symbol
	}

	pub fn watch_script(&self, script: ScriptBuf, swap: SwapRef) {
		debug!("Watching output script for swap {} on {}", swap.id, self.symbol);
		self.state.lock().unwrap().watched.insert(script, swap);
	}

	pub fn unwatch_script(&self, script: &ScriptBuf) {
		self.state.lock().unwrap().watched.remove(script);
	}

	/// Watches an outpoint for being spent, e.g. a reverse swap lockup whose
	/// claim reveals the preimage.
	pub fn watch_outpoint(&self, outpoint: OutPoint, swap: SwapRef) {
		self.state.lock().unwrap().watched_outpoints.insert(outpoint, swap);
	}

	/// Handles one raw transaction notification, either from the mempool
	/// stream or from a connected block.
	pub async fn handle_transaction(&self, transaction: &Transaction, confirmed: bool) {
		let txid = transaction.compute_txid();
		let mut found = Vec::new();
		let mut spent = Vec::new();
		{
			let mut state = self.state.lock().unwrap();
			for input in &transaction.input {
				let swap = match state.watched_outpoints.get(&input.previous_output) {
					Some(swap) => swap.clone(),
					None => continue,
				};
				if state.spent_seen.insert(input.previous_output) {
					spent.push(swap);
				}
			}
			for (vout, output) in transaction.output.iter().enumerate() {
				let vout = vout as u32;
				let swap = match state.watched.get(&output.script_pubkey) {
					Some(swap) => swap.clone(),
					None => continue,
				};
				if !state.seen.insert((txid, vout, confirmed)) {
					continue;
				}
				if confirmed {
					state
						.confirmed
						.entry(txid)
						.or_default()
						.push((output.script_pubkey.clone(), vout));
				}
				found.push((swap, vout, output.value.to_sat()));
			}
		}

		for swap in spent {
			info!("Watched {} outpoint of swap {} spent by {}", self.symbol, swap.id, txid);
			let event = ChainEvent::OutpointSpent {
				symbol: self.symbol.clone(),
				swap,
				spending_transaction: transaction.clone(),
			};
			let _ = self.events.send(event).await;
		}

		for (swap, vout, amount_sat) in found {
			info!(
				"Found {} lockup output {}:{} for swap {} ({})",
				self.symbol,
				txid,
				vout,
				swap.id,
				if confirmed { "confirmed" } else { "mempool" }
			);
			let event = ChainEvent::OutputFound {
				symbol: self.symbol.clone(),
				swap,
				transaction: transaction.clone(),
				txid,
				vout,
				amount_sat,
				confirmed,
			};
			let _ = self.events.send(event).await;
		}
	}

	/// Handles a reorg notification for a transaction that dropped out of
	/// the confirmed chain.
	pub async fn handle_transaction_unconfirmed(&self, txid: &Txid) {
		let retracted = {
			let mut state = self.state.lock().unwrap();
			let outputs = match state.confirmed.remove(txid) {
				Some(outputs) => outputs,
				None => return,
			};
			outputs
				.into_iter()
				.filter_map(|(script, vout)| {
					// Allow the re-confirmation to be delivered again.
					state.seen.remove(&(*txid, vout, true));
					state.watched.get(&script).cloned().map(|swap| (swap, vout))
				})
				.collect::<Vec<_>>()
		};

		for (swap, vout) in retracted {
			info!("Retracting {} output {}:{} for swap {}", self.symbol, txid, vout, swap.id);
			let event = ChainEvent::OutputRetracted {
				symbol: self.symbol.clone(),
				swap,
				txid: *txid,
				vout,
			};
			let _ = self.events.send(event).await;
		}
	}

	pub async fn handle_block(&self, height: u32) {
		let event = ChainEvent::BlockConnected { symbol: self.symbol.clone(), height };
		let _ = self.events.send(event).await;
	}
}

#[cfg(test)]
mod tests {
	use bitcoin::absolute::LockTime;
	use bitcoin::transaction::Version;
	use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

	use super::*;
	use crate::swap::SwapType;

	fn lockup_transaction(script: ScriptBuf, amount_sat: u64) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::null(),
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
				witness: Witness::new(),
			}],
			output: vec![TxOut { value: Amount::from_sat(amount_sat), script_pubkey: script }],
		}
	}

	fn swap_ref(id: &str) -> SwapRef {
		SwapRef { swap_type: SwapType::Submarine, id: id.to_string() }
	}

	#[tokio::test]
	async fn test_emits_once_per_confirmation_state() {
		let (tx, mut rx) = mpsc::channel(8);
		let listener = ChainListener::new("BTC", tx);
		let script = ScriptBuf::from_bytes(vec![0x51]);
		listener.watch_script(script.clone(), swap_ref("swap"));

		let transaction = lockup_transaction(script, 10_000);
		listener.handle_transaction(&transaction, false).await;
		listener.handle_transaction(&transaction, false).await;
		listener.handle_transaction(&transaction, true).await;

		let mut received = Vec::new();
		while let Ok(event) = rx.try_recv() {
			received.push(event);
		}
		assert_eq!(received.len(), 2);
		assert!(
			matches!(&received[0], ChainEvent::OutputFound { confirmed: false, amount_sat, .. } if *amount_sat == 10_000)
		);
		assert!(matches!(&received[1], ChainEvent::OutputFound { confirmed: true, .. }));
	}

	#[tokio::test]
	async fn test_reorg_retracts_then_redelivers() {
		let (tx, mut rx) = mpsc::channel(8);
		let listener = ChainListener::new("BTC", tx);
		let script = ScriptBuf::from_bytes(vec![0x51]);
		listener.watch_script(script.clone(), swap_ref("swap"));

		let transaction = lockup_transaction(script, 10_000);
		let txid = transaction.compute_txid();
		listener.handle_transaction(&transaction, true).await;
		listener.handle_transaction_unconfirmed(&txid).await;
		listener.handle_transaction(&transaction, true).await;

		let mut received = Vec::new();
		while let Ok(event) = rx.try_recv() {
			received.push(event);
		}
		assert_eq!(received.len(), 3);
		assert!(matches!(&received[1], ChainEvent::OutputRetracted { .. }));
		assert!(matches!(&received[2], ChainEvent::OutputFound { confirmed: true, .. }));
	}

	#[tokio::test]
	async fn test_unwatched_scripts_are_ignored() {
		let (tx, mut rx) = mpsc::channel(8);
		let listener = ChainListener::new("BTC", tx);
		let transaction = lockup_transaction(ScriptBuf::from_bytes(vec![0x52]), 5_000);
		listener.handle_transaction(&transaction, false).await;
		assert!(rx.try_recv().is_err());
	}
}
