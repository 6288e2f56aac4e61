// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Swap entities and the engines driving them.

pub mod hints;
pub mod htlc;
pub mod musig;
pub mod nursery;
pub mod reverse;
pub mod status;
pub mod submarine;
pub mod timeout;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;
use hex::DisplayHex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::chain::ChainError;
use crate::io::persist::StoreError;
use crate::lightning::LightningError;
use crate::swap::htlc::HtlcError;
use crate::swap::status::SwapStatus;
use crate::util::key_provider::KeyProviderError;
use crate::wallet::WalletError;

#[derive(Debug, Error)]
pub enum SwapError {
	#[error("swap {0} not found")]
	SwapNotFound(String),
	#[error("unknown pair {0}")]
	UnknownPair(String),
	#[error("unknown currency {0}")]
	UnknownCurrency(String),
	#[error("pair hash does not match current quote")]
	PairHashMismatch,
	#[error("amount {amount_sat} sat out of bounds ({min_sat}..={max_sat})")]
	AmountOutOfBounds { amount_sat: u64, min_sat: u64, max_sat: u64 },
	#[error("invalid invoice: {0}")]
	InvalidInvoice(String),
	#[error("invoice expired")]
	InvoiceExpired,
	#[error("either the invoice amount or the onchain amount must be set")]
	MissingAmount,
	#[error("no lockup transaction recorded")]
	NoLockup,
	#[error(transparent)]
	Hints(#[from] crate::swap::hints::HintsError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Chain(#[from] ChainError),
	#[error(transparent)]
	Lightning(#[from] LightningError),
	#[error(transparent)]
	Htlc(#[from] HtlcError),
	#[error(transparent)]
	Keys(#[from] KeyProviderError),
	#[error(transparent)]
	Wallet(#[from] WalletError),
}

/// Named per-swap mutexes; every mutation of a swap serialises through its
/// lock.
#[derive(Default)]
pub struct SwapLocks {
	inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SwapLocks {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn lock(&self, swap_id: &str) -> OwnedMutexGuard<()> {
		let mutex = {
			let mut inner = self.inner.lock().unwrap();
			inner
				.entry(swap_id.to_string())
				.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
				.clone()
		};
		mutex.lock_owned().await
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapType {
	Submarine,
	Reverse,
	Chain,
}

impl fmt::Display for SwapType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			SwapType::Submarine => f.write_str("submarine"),
			SwapType::Reverse => f.write_str("reverse"),
			SwapType::Chain => f.write_str("chain"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
	Buy,
	Sell,
}

impl FromStr for OrderSide {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"buy" => Ok(OrderSide::Buy),
			"sell" => Ok(OrderSide::Sell),
			_ => Err(()),
		}
	}
}

impl fmt::Display for OrderSide {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			OrderSide::Buy => f.write_str("buy"),
			OrderSide::Sell => f.write_str("sell"),
		}
	}
}

/// A tradeable pair with its fee policy and per-swap-type timeout deltas.
///
/// The rate source is an external collaborator; the configured rate is the
/// fixed fallback in parts-per-million of 1.0 (10^6 = parity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
	pub base: String,
	pub quote: String,
	pub rate_ppm: u64,
	/// Service fee in basis points of the swapped amount.
	pub fee_percentage_bps: u32,
	pub min_amount_sat: u64,
	pub max_amount_sat: u64,
	pub max_zero_conf_amount_sat: u64,
	pub zero_conf_enabled: bool,
	/// Minimum lockup fee rate for zero-conf acceptance.
	pub min_lockup_fee_sat_vbyte: u64,
	/// Estimated miner fee of a claim transaction, subtracted from the
	/// onchain amount when quoting reverse swaps.
	pub claim_miner_fee_sat: u64,
	pub timeout_delta_submarine: u32,
	pub timeout_delta_reverse: u32,
	/// Whether reverse swaps on this pair request a miner-fee prepay
	/// invoice before locking up.
	pub prepay_miner_fee: bool,
}

impl Pair {
	pub fn symbol(&self) -> String {
		format!("{}/{}", self.base, self.quote)
	}

	/// Hash over the fee-relevant fields; clients echo it back so a quote
	/// cannot change between fetching the pair matrix and creating a swap.
	pub fn hash(&self) -> String {
		let preimage = format!(
			"{}/{}:{}:{}:{}:{}:{}",
			self.base,
			self.quote,
			self.rate_ppm,
			self.fee_percentage_bps,
			self.min_amount_sat,
			self.max_amount_sat,
			self.claim_miner_fee_sat,
		);
		sha256::Hash::hash(preimage.as_bytes()).to_byte_array().to_lower_hex_string()
	}

	pub fn service_fee_sat(&self, amount_sat: u64) -> u64 {
		amount_sat * self.fee_percentage_bps as u64 / 10_000
	}
}

/// A submarine swap: onchain lockup in, Lightning payment out.
#[derive(Debug, Clone)]
pub struct Swap {
	pub id: String,
	pub pair: String,
	pub order_side: OrderSide,
	pub invoice: String,
	pub preimage_hash: [u8; 32],
	pub refund_public_key: PublicKey,
	pub claim_public_key: PublicKey,
	/// Derivation index of the service claim key.
	pub claim_key_index: u32,
	pub claim_leaf_hex: String,
	pub refund_leaf_hex: String,
	pub htlc_address: String,
	pub expected_amount_sat: u64,
	pub accept_zero_conf: bool,
	pub timeout_block_height: u32,
	pub lockup_txid: Option<Txid>,
	pub lockup_vout: Option<u32>,
	pub onchain_amount_sat: Option<u64>,
	pub paid_preimage: Option<[u8; 32]>,
	pub status: SwapStatus,
	pub created_at: i64,
}

/// A reverse swap: hold invoice in, onchain lockup out.
#[derive(Debug, Clone)]
pub struct ReverseSwap {
	pub id: String,
	pub pair: String,
	pub order_side: OrderSide,
	pub invoice: String,
	pub invoice_amount_sat: u64,
	pub onchain_amount_sat: u64,
	pub preimage_hash: [u8; 32],
	pub claim_public_key: PublicKey,
	pub refund_public_key: PublicKey,
	/// Derivation index of the service refund key.
	pub refund_key_index: u32,
	pub claim_leaf_hex: String,
	pub refund_leaf_hex: String,
	pub lockup_address: String,
	pub timeout_block_height: u32,
	pub lockup_txid: Option<Txid>,
	pub preimage: Option<[u8; 32]>,
	pub status: SwapStatus,
	pub created_at: i64,
}

/// A chain swap: two onchain HTLCs, one preimage. Both legs reuse the
/// submarine/reverse primitives; there is no dedicated engine.
#[derive(Debug, Clone)]
pub struct ChainSwap {
	pub id: String,
	pub pair: String,
	pub order_side: OrderSide,
	pub preimage_hash: [u8; 32],
	pub user_lockup_address: String,
	pub server_lockup_address: String,
	pub user_lockup_amount_sat: u64,
	pub server_lockup_amount_sat: u64,
	pub user_timeout_block_height: u32,
	pub server_timeout_block_height: u32,
	pub status: SwapStatus,
	pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCreationStatus {
	Attempted,
	Created,
	Settled,
	Abandoned,
}

impl ChannelCreationStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChannelCreationStatus::Attempted => "attempted",
			ChannelCreationStatus::Created => "created",
			ChannelCreationStatus::Settled => "settled",
			ChannelCreationStatus::Abandoned => "abandoned",
		}
	}
}

impl FromStr for ChannelCreationStatus {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"attempted" => Ok(ChannelCreationStatus::Attempted),
			"created" => Ok(ChannelCreationStatus::Created),
			"settled" => Ok(ChannelCreationStatus::Settled),
			"abandoned" => Ok(ChannelCreationStatus::Abandoned),
			_ => Err(()),
		}
	}
}

/// Channel-open request attached 1:1 to a submarine swap.
#[derive(Debug, Clone)]
pub struct ChannelCreation {
	pub swap_id: String,
	pub node_public_key: PublicKey,
	pub private: bool,
	pub inbound_liquidity_percent: u32,
	pub funding_txid: Option<Txid>,
	pub funding_vout: Option<u32>,
	pub status: ChannelCreationStatus,
}

/// The currency whose chain carries the HTLC of a swap.
pub fn chain_currency(base: &str, quote: &str, side: OrderSide, swap_type: SwapType) -> String {
	let onchain_is_base = match swap_type {
		SwapType::Reverse => side == OrderSide::Buy,
		_ => side == OrderSide::Sell,
	};
	if onchain_is_base {
		base.to_string()
	} else {
		quote.to_string()
	}
}

/// The currency whose Lightning network carries the invoice of a swap.
pub fn lightning_currency(base: &str, quote: &str, side: OrderSide, swap_type: SwapType) -> String {
	let chain = chain_currency(base, quote, side, swap_type);
	if chain == base {
		quote.to_string()
	} else {
		base.to_string()
	}
}

/// Splits a "BASE/QUOTE" pair id.
pub fn split_pair(pair: &str) -> Option<(&str, &str)> {
	pair.split_once('/')
}

/// Finds the configured pair and order side whose chain leg is `onchain`
/// and whose Lightning leg is `lightning` for the given swap type.
pub fn resolve_pair<'a>(
	pairs: &'a HashMap<String, Pair>, onchain: &str, lightning: &str, swap_type: SwapType,
) -> Result<(&'a Pair, OrderSide), SwapError> {
	for pair in pairs.values() {
		for side in [OrderSide::Buy, OrderSide::Sell] {
			if chain_currency(&pair.base, &pair.quote, side, swap_type) == onchain
				&& lightning_currency(&pair.base, &pair.quote, side, swap_type) == lightning
			{
				return Ok((pair, side));
			}
		}
	}
	Err(SwapError::UnknownPair(format!("{}/{}", onchain, lightning)))
}

/// Opaque swap identifier: 8 random bytes, hex encoded.
pub fn generate_swap_id() -> String {
	let mut bytes = [0u8; 8];
	rand::thread_rng().fill_bytes(&mut bytes);
	bytes.to_lower_hex_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_pair_hash_changes_with_fees() {
		let mut pair = Pair {
			base: "BTC".to_string(),
			quote: "BTC".to_string(),
			rate_ppm: 1_000_000,
			fee_percentage_bps: 40,
			min_amount_sat: 10_000,
			max_amount_sat: 4_294_967,
			max_zero_conf_amount_sat: 100_000,
			zero_conf_enabled: true,
			min_lockup_fee_sat_vbyte: 2,
			claim_miner_fee_sat: 1_000,
			timeout_delta_submarine: 1_008,
			timeout_delta_reverse: 144,
			prepay_miner_fee: false,
		};
		let hash = pair.hash();
		pair.fee_percentage_bps = 50;
		assert_ne!(hash, pair.hash());
	}

	#[test]
	fn test_service_fee_rounds_down() {
		let pair = Pair {
			base: "BTC".to_string(),
			quote: "BTC".to_string(),
			rate_ppm: 1_000_000,
			fee_percentage_bps: 40,
			min_amount_sat: 10_000,
			max_amount_sat: 4_294_967,
			max_zero_conf_amount_sat: 100_000,
			zero_conf_enabled: true,
			min_lockup_fee_sat_vbyte: 2,
			claim_miner_fee_sat: 1_000,
			timeout_delta_submarine: 1_008,
			timeout_delta_reverse: 144,
			prepay_miner_fee: false,
		};
		assert_eq!(pair.service_fee_sat(1_000_000), 4_000);
		assert_eq!(pair.service_fee_sat(249), 0);
	}

	#[test]
	fn test_generated_ids_are_unique() {
		let a = generate_swap_id();
		let b = generate_swap_id();
		assert_eq!(a.len(), 16);
		assert_ne!(a, b);
	}
}
