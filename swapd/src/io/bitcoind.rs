// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Bitcoin Core JSON-RPC adapter: the [`ChainClient`] implementation, a
//! wallet provider over the node wallet, and the polling driver feeding the
//! chain listener.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::{Amount, BlockHash, Transaction, Txid};
use hex::FromHex;
use log::{debug, trace, warn};
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::chain::listener::ChainListener;
use crate::chain::{BlockchainInfo, ChainClient, ChainError, RawTransactionVerbose};
use crate::wallet::{WalletBalance, WalletError, WalletProvider};

/// Confirmation target for fee estimates.
const FEE_ESTIMATE_TARGET_BLOCKS: u32 = 2;

pub struct BitcoindClient {
	http: reqwest::Client,
	url: String,
	rpc_user: String,
	rpc_password: String,
}

impl BitcoindClient {
	pub fn new(rpc_addr: SocketAddr, rpc_user: &str, rpc_password: &str) -> Self {
		Self {
			http: reqwest::Client::new(),
			url: format!("http://{}", rpc_addr),
			rpc_user: rpc_user.to_string(),
			rpc_password: rpc_password.to_string(),
		}
	}

	async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
		self.call_url(&self.url, method, params).await
	}

	async fn call_url(&self, url: &str, method: &str, params: Value) -> Result<Value, ChainError> {
		trace!("bitcoind RPC {}", method);
		let body = json!({
			"jsonrpc": "1.0",
			"id": "swapd",
			"method": method,
			"params": params,
		});
		let response = self
			.http
			.post(url)
			.basic_auth(&self.rpc_user, Some(&self.rpc_password))
			.json(&body)
			.send()
			.await
			.map_err(|e| ChainError::Rpc(e.to_string()))?;
		let value: Value =
			response.json().await.map_err(|e| ChainError::Rpc(e.to_string()))?;
		if !value["error"].is_null() {
			return Err(ChainError::Rpc(value["error"].to_string()));
		}
		Ok(value["result"].clone())
	}

	pub async fn raw_mempool(&self) -> Result<Vec<Txid>, ChainError> {
		let result = self.call("getrawmempool", json!([])).await?;
		let txids = result
			.as_array()
			.map(|txids| {
				txids
					.iter()
					.filter_map(|txid| txid.as_str())
					.filter_map(|txid| Txid::from_str(txid).ok())
					.collect()
			})
			.unwrap_or_default();
		Ok(txids)
	}

	pub async fn block_hash(&self, height: u32) -> Result<BlockHash, ChainError> {
		let result = self.call("getblockhash", json!([height])).await?;
		result
			.as_str()
			.and_then(|hash| BlockHash::from_str(hash).ok())
			.ok_or_else(|| ChainError::Rpc("malformed getblockhash response".to_string()))
	}

	pub async fn block_txids(&self, hash: &BlockHash) -> Result<Vec<Txid>, ChainError> {
		let result = self.call("getblock", json!([hash.to_string(), 1])).await?;
		let txids = result["tx"]
			.as_array()
			.map(|txids| {
				txids
					.iter()
					.filter_map(|txid| txid.as_str())
					.filter_map(|txid| Txid::from_str(txid).ok())
					.collect()
			})
			.unwrap_or_default();
		Ok(txids)
	}
}

fn parse_transaction_hex(hex: &str) -> Result<Transaction, ChainError> {
	let bytes =
		Vec::<u8>::from_hex(hex).map_err(|e| ChainError::Rpc(e.to_string()))?;
	encode::deserialize(&bytes).map_err(|e| ChainError::Rpc(e.to_string()))
}

#[async_trait]
impl ChainClient for BitcoindClient {
	async fn blockchain_info(&self) -> Result<BlockchainInfo, ChainError> {
		let result = self.call("getblockchaininfo", json!([])).await?;
		let height = result["blocks"]
			.as_u64()
			.ok_or_else(|| ChainError::Rpc("missing blocks".to_string()))? as u32;
		let best_block_hash = result["bestblockhash"]
			.as_str()
			.and_then(|hash| BlockHash::from_str(hash).ok())
			.ok_or_else(|| ChainError::Rpc("missing bestblockhash".to_string()))?;
		Ok(BlockchainInfo { height, best_block_hash })
	}

	async fn raw_transaction_verbose(
		&self, txid: &Txid,
	) -> Result<RawTransactionVerbose, ChainError> {
		let result = self
			.call("getrawtransaction", json!([txid.to_string(), true]))
			.await
			.map_err(|e| match e {
				ChainError::Rpc(message) if message.contains("No such") => {
					ChainError::TransactionNotFound(*txid)
				},
				e => e,
			})?;
		let hex = result["hex"]
			.as_str()
			.ok_or_else(|| ChainError::Rpc("missing transaction hex".to_string()))?;
		Ok(RawTransactionVerbose {
			transaction: parse_transaction_hex(hex)?,
			confirmations: result["confirmations"].as_u64().unwrap_or(0) as u32,
			block_hash: result["blockhash"]
				.as_str()
				.and_then(|hash| BlockHash::from_str(hash).ok()),
		})
	}

	async fn send_raw_transaction(&self, transaction: &Transaction) -> Result<Txid, ChainError> {
		let hex = encode::serialize_hex(transaction);
		let result = self.call("sendrawtransaction", json!([hex])).await?;
		result
			.as_str()
			.and_then(|txid| Txid::from_str(txid).ok())
			.ok_or_else(|| ChainError::Rpc("malformed sendrawtransaction response".to_string()))
	}

	async fn estimate_fee_sat_vbyte(&self) -> Result<u64, ChainError> {
		let result = self
			.call("estimatesmartfee", json!([FEE_ESTIMATE_TARGET_BLOCKS]))
			.await?;
		match result["feerate"].as_f64() {
			// feerate is BTC/kvB.
			Some(feerate) => Ok(((feerate * 100_000_000.0) / 1_000.0).ceil().max(1.0) as u64),
			None => Err(ChainError::FeeEstimationUnavailable),
		}
	}
}

/// Wallet provider over a Bitcoin Core wallet.
pub struct CoreWallet {
	client: Arc<BitcoindClient>,
	wallet_url: String,
	symbol: String,
}

impl CoreWallet {
	pub fn new(client: Arc<BitcoindClient>, wallet_name: &str, symbol: &str) -> Self {
		let wallet_url = format!("{}/wallet/{}", client.url, wallet_name);
		Self { client, wallet_url, symbol: symbol.to_string() }
	}

	async fn call(&self, method: &str, params: Value) -> Result<Value, WalletError> {
		self.client
			.call_url(&self.wallet_url, method, params)
			.await
			.map_err(|e| WalletError::Rpc(e.to_string()))
	}
}

fn btc_to_sat(value: &Value) -> u64 {
	value.as_f64().map(|btc| (btc * 100_000_000.0).round() as u64).unwrap_or(0)
}

#[async_trait]
impl WalletProvider for CoreWallet {
	fn symbol(&self) -> &str {
		&self.symbol
	}

	async fn get_address(&self) -> Result<String, WalletError> {
		let result = self.call("getnewaddress", json!(["", "bech32m"])).await?;
		result
			.as_str()
			.map(|address| address.to_string())
			.ok_or_else(|| WalletError::Rpc("malformed getnewaddress response".to_string()))
	}

	async fn get_balance(&self) -> Result<WalletBalance, WalletError> {
		let result = self.call("getbalances", json!([])).await?;
		Ok(WalletBalance {
			confirmed_sat: btc_to_sat(&result["mine"]["trusted"]),
			unconfirmed_sat: btc_to_sat(&result["mine"]["untrusted_pending"]),
		})
	}

	async fn send_to_address(
		&self, address: &str, amount_sat: u64, sat_per_vbyte: Option<u64>,
	) -> Result<Txid, WalletError> {
		let mut params = json!({
			"address": address,
			"amount": Amount::from_sat(amount_sat).to_btc(),
		});
		if let Some(fee_rate) = sat_per_vbyte {
			params["fee_rate"] = json!(fee_rate);
		}
		let result = self.call("sendtoaddress", params).await?;
		result
			.as_str()
			.and_then(|txid| Txid::from_str(txid).ok())
			.ok_or_else(|| WalletError::Rpc("malformed sendtoaddress response".to_string()))
	}

	async fn sweep_wallet(&self, address: &str) -> Result<Txid, WalletError> {
		let result = self.call("sendall", json!([[address]])).await?;
		result["txid"]
			.as_str()
			.and_then(|txid| Txid::from_str(txid).ok())
			.ok_or_else(|| WalletError::Rpc("malformed sendall response".to_string()))
	}
}

/// Polls the node for mempool arrivals and new blocks, forwarding every
/// transaction to the listener. The external ZMQ hooks can replace this
/// driver without touching the listener.
pub async fn run_chain_poller(
	client: Arc<BitcoindClient>, listener: Arc<ChainListener>, poll_interval: Duration,
) {
	let mut seen_mempool: HashSet<Txid> = HashSet::new();
	let mut height = loop {
		match client.blockchain_info().await {
			Ok(info) => break info.height,
			Err(e) => {
				warn!("Waiting for bitcoind: {}", e);
				sleep(poll_interval).await;
			},
		}
	};

	loop {
		sleep(poll_interval).await;

		match client.raw_mempool().await {
			Ok(txids) => {
				let current: HashSet<Txid> = txids.into_iter().collect();
				for txid in current.difference(&seen_mempool) {
					if let Ok(verbose) = client.raw_transaction_verbose(txid).await {
						listener.handle_transaction(&verbose.transaction, false).await;
					}
				}
				seen_mempool = current;
			},
			Err(e) => warn!("getrawmempool failed: {}", e),
		}

		let info = match client.blockchain_info().await {
			Ok(info) => info,
			Err(e) => {
				warn!("getblockchaininfo failed: {}", e);
				continue;
			},
		};
		if info.height < height {
			// Reorg below our tip; replay from the new tip.
			debug!("Chain tip went backwards: {} -> {}", height, info.height);
			height = info.height;
			continue;
		}
		while height < info.height {
			height += 1;
			let block_hash = match client.block_hash(height).await {
				Ok(hash) => hash,
				Err(e) => {
					warn!("getblockhash {} failed: {}", height, e);
					height -= 1;
					break;
				},
			};
			if let Ok(txids) = client.block_txids(&block_hash).await {
				for txid in txids {
					if let Ok(verbose) = client.raw_transaction_verbose(&txid).await {
						listener.handle_transaction(&verbose.transaction, true).await;
					}
				}
			}
			listener.handle_block(height).await;
		}
	}
}
