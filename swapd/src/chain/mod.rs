// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Chain backend seam. The concrete bitcoind RPC/ZMQ adapter is an external
//! collaborator; the engine only talks to [`ChainClient`] and consumes the
//! normalised events emitted by [`listener::ChainListener`].

pub mod listener;

use async_trait::async_trait;
use bitcoin::{BlockHash, Transaction, Txid};
use thiserror::Error;

use crate::swap::SwapType;

#[derive(Debug, Error)]
pub enum ChainError {
	#[error("chain RPC failed: {0}")]
	Rpc(String),
	#[error("transaction {0} not found")]
	TransactionNotFound(Txid),
	#[error("fee estimation unavailable")]
	FeeEstimationUnavailable,
}

#[derive(Debug, Clone)]
pub struct BlockchainInfo {
	pub height: u32,
	pub best_block_hash: BlockHash,
}

#[derive(Debug, Clone)]
pub struct RawTransactionVerbose {
	pub transaction: Transaction,
	pub confirmations: u32,
	pub block_hash: Option<BlockHash>,
}

/// Synchronous-query surface of a chain backend.
#[async_trait]
pub trait ChainClient: Send + Sync {
	async fn blockchain_info(&self) -> Result<BlockchainInfo, ChainError>;

	async fn raw_transaction_verbose(
		&self, txid: &Txid,
	) -> Result<RawTransactionVerbose, ChainError>;

	async fn send_raw_transaction(&self, transaction: &Transaction) -> Result<Txid, ChainError>;

	/// Smart-fee estimate normalised to sat/vbyte.
	async fn estimate_fee_sat_vbyte(&self) -> Result<u64, ChainError>;
}

/// One chain the daemon operates on: the RPC client plus the listener
/// normalising its notifications.
#[derive(Clone)]
pub struct ChainBackend {
	pub client: std::sync::Arc<dyn ChainClient>,
	pub listener: std::sync::Arc<listener::ChainListener>,
}

/// Reference from a watched output script back to the swap owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapRef {
	pub swap_type: SwapType,
	pub id: String,
}

/// Normalised chain events handed to the engines.
#[derive(Debug, Clone)]
pub enum ChainEvent {
	OutputFound {
		symbol: String,
		swap: SwapRef,
		transaction: Transaction,
		txid: Txid,
		vout: u32,
		amount_sat: u64,
		confirmed: bool,
	},
	/// A previously confirmed output became unconfirmed in a reorg.
	OutputRetracted { symbol: String, swap: SwapRef, txid: Txid, vout: u32 },
	/// A watched outpoint (e.g. a reverse swap lockup) was spent; the
	/// spending transaction may reveal a preimage in its witness.
	OutpointSpent { symbol: String, swap: SwapRef, spending_transaction: Transaction },
	BlockConnected { symbol: String, height: u32 },
}
