// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The unified swap status enum and its transition rules.
//!
//! Every status has a strict predecessor set; `SwapStore::set_status` rejects
//! any update whose current status is not a member. The sets encode the
//! submarine and reverse lifecycle diagrams, including the reorg rollback
//! from `TransactionConfirmed` back to `TransactionMempool`.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapStatus {
	SwapCreated,
	InvoiceSet,
	InvoicePending,
	TransactionMempool,
	TransactionConfirmed,
	InvoicePaid,
	TransactionClaimPending,
	TransactionClaimed,
	SwapExpired,
	InvoiceFailedToPay,
	ChannelCreated,
	MinerFeePaid,
	TransactionFailed,
	TransactionRefunded,
	TransactionLockupFailed,
}

impl SwapStatus {
	/// Statuses that may directly precede `self`. Empty means initial.
	pub fn predecessors(&self) -> &'static [SwapStatus] {
		use SwapStatus::*;
		match self {
			SwapCreated => &[],
			InvoiceSet => &[SwapCreated],
			// A hold invoice moves to pending once payment starts; for swaps
			// with a channel creation attached the payment is retried after
			// the channel became usable.
			InvoicePending => &[TransactionMempool, TransactionConfirmed, ChannelCreated],
			// `TransactionConfirmed` is a valid predecessor to cover reorgs
			// that unconfirm a previously confirmed lockup.
			TransactionMempool => &[SwapCreated, InvoiceSet, MinerFeePaid, TransactionConfirmed],
			TransactionConfirmed => &[TransactionMempool],
			InvoicePaid => &[InvoicePending, TransactionMempool, TransactionConfirmed, ChannelCreated],
			TransactionClaimPending => &[InvoicePaid],
			TransactionClaimed => {
				&[TransactionClaimPending, InvoicePaid, TransactionConfirmed, TransactionMempool]
			},
			SwapExpired => &[
				SwapCreated,
				InvoiceSet,
				InvoicePending,
				MinerFeePaid,
				TransactionMempool,
				TransactionConfirmed,
				TransactionLockupFailed,
				InvoiceFailedToPay,
				TransactionRefunded,
			],
			InvoiceFailedToPay => &[InvoicePending, TransactionMempool, TransactionConfirmed],
			ChannelCreated => &[TransactionMempool, TransactionConfirmed, InvoicePending],
			MinerFeePaid => &[InvoiceSet],
			TransactionFailed => &[InvoiceSet, MinerFeePaid],
			TransactionRefunded => &[TransactionLockupFailed, InvoiceFailedToPay, SwapExpired],
			TransactionLockupFailed => {
				&[SwapCreated, InvoiceSet, TransactionMempool, TransactionConfirmed]
			},
		}
	}

	pub fn can_follow(&self, current: SwapStatus) -> bool {
		self.predecessors().contains(&current)
	}

	/// Terminal statuses end the swap's lifecycle; the timeout watcher drops
	/// entries that reached one.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			SwapStatus::TransactionClaimed
				| SwapStatus::SwapExpired
				| SwapStatus::TransactionFailed
				| SwapStatus::TransactionRefunded
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			SwapStatus::SwapCreated => "swap.created",
			SwapStatus::InvoiceSet => "invoice.set",
			SwapStatus::InvoicePending => "invoice.pending",
			SwapStatus::TransactionMempool => "transaction.mempool",
			SwapStatus::TransactionConfirmed => "transaction.confirmed",
			SwapStatus::InvoicePaid => "invoice.paid",
			SwapStatus::TransactionClaimPending => "transaction.claim.pending",
			SwapStatus::TransactionClaimed => "transaction.claimed",
			SwapStatus::SwapExpired => "swap.expired",
			SwapStatus::InvoiceFailedToPay => "invoice.failedToPay",
			SwapStatus::ChannelCreated => "channel.created",
			SwapStatus::MinerFeePaid => "minerfee.paid",
			SwapStatus::TransactionFailed => "transaction.failed",
			SwapStatus::TransactionRefunded => "transaction.refunded",
			SwapStatus::TransactionLockupFailed => "transaction.lockupFailed",
		}
	}
}

impl fmt::Display for SwapStatus {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl Serialize for SwapStatus {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for SwapStatus {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let name = String::deserialize(deserializer)?;
		name.parse().map_err(|_| D::Error::custom(format!("unknown status {name}")))
	}
}

impl FromStr for SwapStatus {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let status = match s {
			"swap.created" => SwapStatus::SwapCreated,
			"invoice.set" => SwapStatus::InvoiceSet,
			"invoice.pending" => SwapStatus::InvoicePending,
			"transaction.mempool" => SwapStatus::TransactionMempool,
			"transaction.confirmed" => SwapStatus::TransactionConfirmed,
			"invoice.paid" => SwapStatus::InvoicePaid,
			"transaction.claim.pending" => SwapStatus::TransactionClaimPending,
			"transaction.claimed" => SwapStatus::TransactionClaimed,
			"swap.expired" => SwapStatus::SwapExpired,
			"invoice.failedToPay" => SwapStatus::InvoiceFailedToPay,
			"channel.created" => SwapStatus::ChannelCreated,
			"minerfee.paid" => SwapStatus::MinerFeePaid,
			"transaction.failed" => SwapStatus::TransactionFailed,
			"transaction.refunded" => SwapStatus::TransactionRefunded,
			"transaction.lockupFailed" => SwapStatus::TransactionLockupFailed,
			_ => return Err(()),
		};
		Ok(status)
	}
}

/// A status change as published on the event bus and returned by the status
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapUpdate {
	pub id: String,
	pub status: SwapStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub zero_conf_rejected: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub failure_reason: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transaction_id: Option<String>,
}

impl SwapUpdate {
	pub fn new(id: &str, status: SwapStatus) -> Self {
		Self {
			id: id.to_string(),
			status,
			zero_conf_rejected: None,
			failure_reason: None,
			transaction_id: None,
		}
	}

	pub fn with_failure_reason(mut self, reason: &str) -> Self {
		self.failure_reason = Some(reason.to_string());
		self
	}

	pub fn with_transaction_id(mut self, txid: &str) -> Self {
		self.transaction_id = Some(txid.to_string());
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_happy_submarine_path_is_permitted() {
		use SwapStatus::*;
		let path =
			[SwapCreated, TransactionMempool, TransactionConfirmed, InvoicePaid, TransactionClaimed];
		for pair in path.windows(2) {
			assert!(pair[1].can_follow(pair[0]), "{} -> {}", pair[0], pair[1]);
		}
	}

	#[test]
	fn test_happy_reverse_path_is_permitted() {
		use SwapStatus::*;
		let path = [
			SwapCreated,
			InvoiceSet,
			TransactionMempool,
			TransactionConfirmed,
			TransactionClaimed,
		];
		for pair in path.windows(2) {
			assert!(pair[1].can_follow(pair[0]), "{} -> {}", pair[0], pair[1]);
		}
	}

	#[test]
	fn test_reorg_rollback_is_permitted() {
		assert!(SwapStatus::TransactionMempool.can_follow(SwapStatus::TransactionConfirmed));
	}

	#[test]
	fn test_terminal_statuses_have_no_forward_path() {
		use SwapStatus::*;
		// No status may follow a claim; an expiry only follows a refund.
		for status in [
			SwapCreated,
			InvoiceSet,
			InvoicePending,
			TransactionMempool,
			TransactionConfirmed,
			InvoicePaid,
			TransactionClaimPending,
			SwapExpired,
			InvoiceFailedToPay,
			ChannelCreated,
			MinerFeePaid,
			TransactionFailed,
			TransactionRefunded,
			TransactionLockupFailed,
		] {
			assert!(!status.can_follow(TransactionClaimed), "{} followed a claim", status);
			assert!(!status.can_follow(TransactionFailed), "{} followed a failure", status);
		}
	}

	#[test]
	fn test_claim_cannot_follow_creation() {
		assert!(!SwapStatus::TransactionClaimed.can_follow(SwapStatus::SwapCreated));
		assert!(!SwapStatus::InvoicePaid.can_follow(SwapStatus::SwapCreated));
	}

	#[test]
	fn test_wire_name_round_trip() {
		use SwapStatus::*;
		for status in [
			SwapCreated,
			InvoiceSet,
			InvoicePending,
			TransactionMempool,
			TransactionConfirmed,
			InvoicePaid,
			TransactionClaimPending,
			TransactionClaimed,
			SwapExpired,
			InvoiceFailedToPay,
			ChannelCreated,
			MinerFeePaid,
			TransactionFailed,
			TransactionRefunded,
			TransactionLockupFailed,
		] {
			assert_eq!(status.as_str().parse::<SwapStatus>(), Ok(status));
		}
	}
}
