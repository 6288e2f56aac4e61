// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! In-memory chain, lightning and wallet fakes for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Address, BlockHash, CompressedPublicKey, Network, Transaction, Txid};

use crate::chain::{BlockchainInfo, ChainClient, ChainError, RawTransactionVerbose};
use crate::lightning::{
	ChannelInfo, HoldInvoiceRequest, LightningClient, LightningError, NodeInfo,
	OpenChannelResponse, PayInvoiceRequest,
};
use crate::wallet::{WalletBalance, WalletError, WalletProvider};

pub fn test_pubkey(byte: u8) -> PublicKey {
	let secp = Secp256k1::new();
	let secret = SecretKey::from_slice(&[byte.max(1); 32]).expect("non-zero secret");
	PublicKey::from_secret_key(&secp, &secret)
}

pub fn test_address() -> Address {
	let secp = Secp256k1::new();
	let secret = SecretKey::from_slice(&[9u8; 32]).expect("non-zero secret");
	let compressed = CompressedPublicKey(PublicKey::from_secret_key(&secp, &secret));
	Address::p2wpkh(&compressed, Network::Regtest)
}

#[derive(Default)]
pub struct FakeChainClient {
	pub height: AtomicU32,
	pub fee_sat_vbyte: AtomicU64,
	pub transactions: Mutex<HashMap<Txid, RawTransactionVerbose>>,
	pub broadcast: Mutex<Vec<Transaction>>,
}

impl FakeChainClient {
	pub fn new(height: u32) -> Self {
		let client = Self::default();
		client.height.store(height, Ordering::SeqCst);
		client.fee_sat_vbyte.store(2, Ordering::SeqCst);
		client
	}

	pub fn insert_transaction(&self, transaction: Transaction, confirmations: u32) {
		let txid = transaction.compute_txid();
		self.transactions.lock().unwrap().insert(
			txid,
			RawTransactionVerbose { transaction, confirmations, block_hash: None },
		);
	}

	pub fn remove_transaction(&self, txid: &Txid) {
		self.transactions.lock().unwrap().remove(txid);
	}
}

#[async_trait]
impl ChainClient for FakeChainClient {
	async fn blockchain_info(&self) -> Result<BlockchainInfo, ChainError> {
		Ok(BlockchainInfo {
			height: self.height.load(Ordering::SeqCst),
			best_block_hash: BlockHash::all_zeros(),
		})
	}

	async fn raw_transaction_verbose(
		&self, txid: &Txid,
	) -> Result<RawTransactionVerbose, ChainError> {
		self.transactions
			.lock()
			.unwrap()
			.get(txid)
			.cloned()
			.ok_or(ChainError::TransactionNotFound(*txid))
	}

	async fn send_raw_transaction(&self, transaction: &Transaction) -> Result<Txid, ChainError> {
		self.broadcast.lock().unwrap().push(transaction.clone());
		Ok(transaction.compute_txid())
	}

	async fn estimate_fee_sat_vbyte(&self) -> Result<u64, ChainError> {
		Ok(self.fee_sat_vbyte.load(Ordering::SeqCst))
	}
}

pub struct FakeLightningClient {
	pub node_public_key: PublicKey,
	pub invoice_to_return: Mutex<String>,
	pub hold_invoices: Mutex<Vec<HoldInvoiceRequest>>,
	pub settled: Mutex<Vec<[u8; 32]>>,
	pub cancelled_invoices: Mutex<Vec<[u8; 32]>>,
	pub cancelled_payments: Mutex<Vec<[u8; 32]>>,
	pub payments: Mutex<Vec<PayInvoiceRequest>>,
	pub pay_results: Mutex<VecDeque<Result<[u8; 32], LightningError>>>,
	pub default_preimage: [u8; 32],
	pub connect_calls: Mutex<Vec<PublicKey>>,
	pub open_channel_calls: Mutex<Vec<(PublicKey, u64, bool)>>,
	pub open_channel_results: Mutex<VecDeque<Result<OpenChannelResponse, LightningError>>>,
	pub peers: Mutex<Vec<PublicKey>>,
	pub channels: Mutex<Vec<ChannelInfo>>,
	pub pending_payment: AtomicBool,
}

impl Default for FakeLightningClient {
	fn default() -> Self {
		Self {
			node_public_key: test_pubkey(42),
			invoice_to_return: Mutex::new("lnbcrt500u1fakeholdinvoice".to_string()),
			hold_invoices: Mutex::new(Vec::new()),
			settled: Mutex::new(Vec::new()),
			cancelled_invoices: Mutex::new(Vec::new()),
			cancelled_payments: Mutex::new(Vec::new()),
			payments: Mutex::new(Vec::new()),
			pay_results: Mutex::new(VecDeque::new()),
			default_preimage: [1u8; 32],
			connect_calls: Mutex::new(Vec::new()),
			open_channel_calls: Mutex::new(Vec::new()),
			open_channel_results: Mutex::new(VecDeque::new()),
			peers: Mutex::new(Vec::new()),
			channels: Mutex::new(Vec::new()),
			pending_payment: AtomicBool::new(false),
		}
	}
}

#[async_trait]
impl LightningClient for FakeLightningClient {
	async fn get_info(&self) -> Result<NodeInfo, LightningError> {
		Ok(NodeInfo { public_key: self.node_public_key, block_height: 0, synced_to_chain: true })
	}

	async fn add_hold_invoice(
		&self, request: HoldInvoiceRequest,
	) -> Result<String, LightningError> {
		self.hold_invoices.lock().unwrap().push(request);
		Ok(self.invoice_to_return.lock().unwrap().clone())
	}

	async fn settle_hold_invoice(&self, preimage: [u8; 32]) -> Result<(), LightningError> {
		self.settled.lock().unwrap().push(preimage);
		Ok(())
	}

	async fn cancel_hold_invoice(&self, preimage_hash: [u8; 32]) -> Result<(), LightningError> {
		self.cancelled_invoices.lock().unwrap().push(preimage_hash);
		Ok(())
	}

	async fn pay_invoice(&self, request: PayInvoiceRequest) -> Result<[u8; 32], LightningError> {
		self.payments.lock().unwrap().push(request);
		match self.pay_results.lock().unwrap().pop_front() {
			Some(result) => result,
			None => Ok(self.default_preimage),
		}
	}

	async fn cancel_payment(&self, payment_hash: [u8; 32]) -> Result<(), LightningError> {
		self.cancelled_payments.lock().unwrap().push(payment_hash);
		Ok(())
	}

	async fn pay_offer(&self, _offer: &str, _amount_msat: u64) -> Result<[u8; 32], LightningError> {
		Ok(self.default_preimage)
	}

	async fn connect_peer(
		&self, public_key: &PublicKey, _address_hints: &[String],
	) -> Result<(), LightningError> {
		self.connect_calls.lock().unwrap().push(*public_key);
		self.peers.lock().unwrap().push(*public_key);
		Ok(())
	}

	async fn open_channel(
		&self, public_key: &PublicKey, local_funding_sat: u64, private: bool,
		_sat_per_vbyte: u64,
	) -> Result<OpenChannelResponse, LightningError> {
		self.open_channel_calls.lock().unwrap().push((*public_key, local_funding_sat, private));
		match self.open_channel_results.lock().unwrap().pop_front() {
			Some(result) => result,
			None => Ok(OpenChannelResponse {
				funding_txid_base64: "PnemZ7+wVd0SLtj9eyJ4IwR9fzEEewM24oSZP2dKmgU=".to_string(),
				output_index: 1,
			}),
		}
	}

	async fn list_channels(&self) -> Result<Vec<ChannelInfo>, LightningError> {
		Ok(self.channels.lock().unwrap().clone())
	}

	async fn list_peers(&self) -> Result<Vec<PublicKey>, LightningError> {
		Ok(self.peers.lock().unwrap().clone())
	}

	async fn has_pending_payment(
		&self, _payment_hash: [u8; 32],
	) -> Result<bool, LightningError> {
		Ok(self.pending_payment.load(Ordering::SeqCst))
	}
}

pub struct FakeWallet {
	pub address: Address,
	pub sent: Mutex<Vec<(String, u64)>>,
}

impl Default for FakeWallet {
	fn default() -> Self {
		Self { address: test_address(), sent: Mutex::new(Vec::new()) }
	}
}

#[async_trait]
impl WalletProvider for FakeWallet {
	fn symbol(&self) -> &str {
		"BTC"
	}

	async fn get_address(&self) -> Result<String, WalletError> {
		Ok(self.address.to_string())
	}

	async fn get_balance(&self) -> Result<WalletBalance, WalletError> {
		Ok(WalletBalance { confirmed_sat: 1_000_000, unconfirmed_sat: 0 })
	}

	async fn send_to_address(
		&self, address: &str, amount_sat: u64, _sat_per_vbyte: Option<u64>,
	) -> Result<Txid, WalletError> {
		self.sent.lock().unwrap().push((address.to_string(), amount_sat));
		Ok(Txid::all_zeros())
	}

	async fn sweep_wallet(&self, address: &str) -> Result<Txid, WalletError> {
		self.sent.lock().unwrap().push((address.to_string(), 0));
		Ok(Txid::all_zeros())
	}
}
