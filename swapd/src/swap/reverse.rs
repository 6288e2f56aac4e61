// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The reverse swap lifecycle: issue a hold invoice, lock coins onchain
//! once the invoice is held, release the preimage when the client claims.
//!
//! Refund safety hinges on ordering: the lockup is never broadcast before
//! `invoice.accepted`, and the hold invoice is never settled unless a
//! preimage matching the swap hash was revealed on-chain or committed in a
//! cooperative claim session.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{All, Message, PublicKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::transaction::Version;
use bitcoin::{
	Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
	Witness,
};
use bitcoin::hashes::{sha256, Hash};
use chrono::Utc;
use log::{error, info, warn};

use crate::chain::{ChainBackend, SwapRef};
use crate::lightning::{HoldInvoiceRequest, LightningClient};
use crate::swap::hints::{check_description_hash, received_amount, RoutingHintsEngine};
use crate::swap::htlc::{SwapTree, REFUND_TX_VBYTES};
use crate::swap::status::{SwapStatus, SwapUpdate};
use crate::swap::timeout::TimeoutWatcher;
use crate::swap::{
	chain_currency, generate_swap_id, resolve_pair, split_pair, Pair, ReverseSwap, SwapError,
	SwapLocks, SwapType,
};
use crate::io::persist::{StoreError, SwapStore};
use crate::util::key_provider::KeyProvider;
use crate::wallet::WalletProvider;

#[derive(Debug, Clone)]
pub struct ReverseConfig {
	/// Expiry of the hold invoice in seconds.
	pub invoice_expiry_secs: u64,
}

impl Default for ReverseConfig {
	fn default() -> Self {
		Self { invoice_expiry_secs: 3_600 }
	}
}

/// Parameters of `POST /swap/reverse` after request validation.
#[derive(Debug, Clone)]
pub struct CreateReverseRequest {
	pub from: String,
	pub to: String,
	pub preimage_hash: [u8; 32],
	pub claim_public_key: PublicKey,
	pub invoice_amount_sat: Option<u64>,
	pub onchain_amount_sat: Option<u64>,
	pub pair_hash: Option<String>,
	pub referral_id: Option<String>,
	pub description_hash: Option<Vec<u8>>,
	/// BOLT12 offer the invoice descriptor is derived from instead of the
	/// default memo; no routing hints are produced for offers.
	pub offer: Option<String>,
	pub address: Option<String>,
	pub address_signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct CreatedReverse {
	pub id: String,
	pub invoice: String,
	pub lockup_address: String,
	pub refund_public_key: PublicKey,
	pub claim_leaf_hex: String,
	pub refund_leaf_hex: String,
	pub timeout_block_height: u32,
	pub onchain_amount_sat: u64,
	pub bip21: Option<String>,
}

pub struct ReverseEngine {
	secp: Secp256k1<All>,
	network: Network,
	store: Arc<SwapStore>,
	chains: HashMap<String, ChainBackend>,
	lightning: Arc<dyn LightningClient>,
	wallets: HashMap<String, Arc<dyn WalletProvider>>,
	keys: Arc<KeyProvider>,
	locks: Arc<SwapLocks>,
	timeouts: Arc<TimeoutWatcher>,
	pairs: HashMap<String, Pair>,
	hints: Arc<RoutingHintsEngine>,
	config: ReverseConfig,
}

impl ReverseEngine {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		network: Network, store: Arc<SwapStore>, chains: HashMap<String, ChainBackend>,
		lightning: Arc<dyn LightningClient>, wallets: HashMap<String, Arc<dyn WalletProvider>>,
		keys: Arc<KeyProvider>, locks: Arc<SwapLocks>, timeouts: Arc<TimeoutWatcher>,
		pairs: HashMap<String, Pair>, hints: Arc<RoutingHintsEngine>, config: ReverseConfig,
	) -> Self {
		Self {
			secp: Secp256k1::new(),
			network,
			store,
			chains,
			lightning,
			wallets,
			keys,
			locks,
			timeouts,
			pairs,
			hints,
			config,
		}
	}

	fn backend(&self, symbol: &str) -> Result<&ChainBackend, SwapError> {
		self.chains.get(symbol).ok_or_else(|| SwapError::UnknownCurrency(symbol.to_string()))
	}

	fn wallet(&self, symbol: &str) -> Result<&Arc<dyn WalletProvider>, SwapError> {
		self.wallets.get(symbol).ok_or_else(|| SwapError::UnknownCurrency(symbol.to_string()))
	}

	fn swap_symbol(&self, swap: &ReverseSwap) -> Result<String, SwapError> {
		let (base, quote) = split_pair(&swap.pair)
			.ok_or_else(|| SwapError::UnknownPair(swap.pair.clone()))?;
		Ok(chain_currency(base, quote, swap.order_side, SwapType::Reverse))
	}

	fn pair_of(&self, swap: &ReverseSwap) -> Result<&Pair, SwapError> {
		self.pairs.get(&swap.pair).ok_or_else(|| SwapError::UnknownPair(swap.pair.clone()))
	}

	pub async fn create(
		&self, request: CreateReverseRequest,
	) -> Result<CreatedReverse, SwapError> {
		let (pair, order_side) =
			resolve_pair(&self.pairs, &request.to, &request.from, SwapType::Reverse)?;
		let pair = pair.clone();
		if let Some(hash) = &request.pair_hash {
			if *hash != pair.hash() {
				return Err(SwapError::PairHashMismatch);
			}
		}

		let (invoice_amount_sat, onchain_amount_sat) =
			match (request.invoice_amount_sat, request.onchain_amount_sat) {
				(Some(invoice_amount), _) => (
					invoice_amount,
					invoice_amount.saturating_sub(pair.service_fee_sat(invoice_amount)),
				),
				(None, Some(onchain_amount)) => {
					(onchain_amount + pair.service_fee_sat(onchain_amount), onchain_amount)
				},
				(None, None) => return Err(SwapError::MissingAmount),
			};
		if invoice_amount_sat < pair.min_amount_sat || invoice_amount_sat > pair.max_amount_sat {
			return Err(SwapError::AmountOutOfBounds {
				amount_sat: invoice_amount_sat,
				min_sat: pair.min_amount_sat,
				max_sat: pair.max_amount_sat,
			});
		}

		let description_hash =
			request.description_hash.as_deref().map(check_description_hash).transpose()?;

		let symbol = request.to.clone();
		let backend = self.backend(&symbol)?;
		let info = backend.client.blockchain_info().await?;
		let timeout_block_height = info.height + pair.timeout_delta_reverse;

		let (refund_key_index, refund_keypair) = self.keys.next_keypair(&symbol)?;
		let refund_public_key = refund_keypair.public_key();

		let tree = SwapTree::new(
			&request.claim_public_key,
			&refund_public_key,
			&request.preimage_hash,
			timeout_block_height,
		)?;
		let lockup_address = tree.address(&self.secp, self.network)?;

		let bip21 = match (&request.address, &request.address_signature) {
			(Some(address), Some(signature)) => Some(self.hints.bip21_params(
				address,
				signature,
				&request.claim_public_key,
				received_amount(onchain_amount_sat, pair.claim_miner_fee_sat),
			)?),
			_ => None,
		};

		let mut descriptor = match &request.offer {
			Some(offer) => {
				let address_signature = request
					.address
					.as_deref()
					.zip(request.address_signature.as_deref());
				self.hints.bolt12_descriptor(offer, address_signature)?
			},
			None => self.hints.bolt11_descriptor(&symbol, None)?,
		};
		descriptor.description_hash = description_hash;
		let invoice = self
			.lightning
			.add_hold_invoice(HoldInvoiceRequest {
				preimage_hash: request.preimage_hash,
				amount_msat: invoice_amount_sat * 1_000,
				memo: descriptor.memo,
				description_hash: descriptor.description_hash,
				expiry_secs: self.config.invoice_expiry_secs,
				routing_hints: descriptor.routing_hints,
			})
			.await?;

		let swap = ReverseSwap {
			id: generate_swap_id(),
			pair: pair.symbol(),
			order_side,
			invoice: invoice.clone(),
			invoice_amount_sat,
			onchain_amount_sat,
			preimage_hash: request.preimage_hash,
			claim_public_key: request.claim_public_key,
			refund_public_key,
			refund_key_index,
			claim_leaf_hex: tree.claim_leaf.to_hex_string(),
			refund_leaf_hex: tree.refund_leaf.to_hex_string(),
			lockup_address: lockup_address.to_string(),
			timeout_block_height,
			lockup_txid: None,
			preimage: None,
			status: SwapStatus::SwapCreated,
			created_at: Utc::now().timestamp(),
		};
		self.store.create_reverse_swap(&swap)?;
		self.set_status_logged(SwapUpdate::new(&swap.id, SwapStatus::InvoiceSet));

		backend.listener.watch_script(
			lockup_address.script_pubkey(),
			SwapRef { swap_type: SwapType::Reverse, id: swap.id.clone() },
		);
		self.timeouts.track(
			&symbol,
			timeout_block_height,
			SwapRef { swap_type: SwapType::Reverse, id: swap.id.clone() },
		);

		info!(
			"Created reverse swap {} on {} locking up {} sat",
			swap.id, symbol, onchain_amount_sat
		);
		Ok(CreatedReverse {
			id: swap.id,
			invoice,
			lockup_address: lockup_address.to_string(),
			refund_public_key,
			claim_leaf_hex: tree.claim_leaf.to_hex_string(),
			refund_leaf_hex: tree.refund_leaf.to_hex_string(),
			timeout_block_height,
			onchain_amount_sat,
			bip21,
		})
	}

	/// Re-arms watched scripts, claim outpoints and timeout entries after a
	/// restart.
	pub async fn restore(&self) -> Result<(), SwapError> {
		for swap in self.store.pending_reverse_swaps()? {
			let symbol = self.swap_symbol(&swap)?;
			let backend = self.backend(&symbol)?;
			let tree = self.tree_of(&swap)?;
			let script_pubkey = tree.script_pubkey(&self.secp, self.network)?;
			backend.listener.watch_script(
				script_pubkey.clone(),
				SwapRef { swap_type: SwapType::Reverse, id: swap.id.clone() },
			);
			if let Some(lockup_txid) = swap.lockup_txid {
				if let Ok(lockup) = backend.client.raw_transaction_verbose(&lockup_txid).await {
					if let Some(vout) = find_output(&lockup.transaction, &script_pubkey) {
						backend.listener.watch_outpoint(
							OutPoint { txid: lockup_txid, vout },
							SwapRef { swap_type: SwapType::Reverse, id: swap.id.clone() },
						);
					}
				}
			}
			self.timeouts.track(
				&symbol,
				swap.timeout_block_height,
				SwapRef { swap_type: SwapType::Reverse, id: swap.id },
			);
		}
		Ok(())
	}

	/// The inbound HTLC is irrevocably held; only now may coins be locked
	/// up onchain.
	pub async fn on_invoice_accepted(&self, preimage_hash: [u8; 32]) -> Result<(), SwapError> {
		let swap = match self.store.get_reverse_swap_by_preimage_hash(preimage_hash)? {
			Some(swap) => swap,
			None => return Ok(()),
		};
		let _guard = self.locks.lock(&swap.id).await;
		let swap = self
			.store
			.get_reverse_swap(&swap.id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap.id.clone()))?;
		if !matches!(swap.status, SwapStatus::InvoiceSet) {
			return Ok(());
		}

		let pair = self.pair_of(&swap)?.clone();
		if pair.prepay_miner_fee {
			self.set_status_logged(SwapUpdate::new(&swap.id, SwapStatus::MinerFeePaid));
		}

		let symbol = self.swap_symbol(&swap)?;
		let backend = self.backend(&symbol)?;
		let wallet = self.wallet(&symbol)?;
		let fee_rate = backend.client.estimate_fee_sat_vbyte().await.ok();
		let txid = match wallet
			.send_to_address(&swap.lockup_address, swap.onchain_amount_sat, fee_rate)
			.await
		{
			Ok(txid) => txid,
			Err(e) => {
				error!("Failed to broadcast lockup of reverse swap {}: {}", swap.id, e);
				if let Err(e) = self.lightning.cancel_hold_invoice(swap.preimage_hash).await {
					error!("Failed to cancel hold invoice of swap {}: {}", swap.id, e);
				}
				self.set_status_logged(
					SwapUpdate::new(&swap.id, SwapStatus::TransactionFailed)
						.with_failure_reason("could not broadcast lockup transaction"),
				);
				return Ok(());
			},
		};

		self.store.set_lockup(SwapType::Reverse, &swap.id, &txid, 0, swap.onchain_amount_sat, false)?;
		let _ = self.store.add_transaction_label(
			&txid,
			&symbol,
			&format!("lockup of reverse swap {}", swap.id),
		);
		self.set_status_logged(
			SwapUpdate::new(&swap.id, SwapStatus::TransactionMempool)
				.with_transaction_id(&txid.to_string()),
		);
		info!("Broadcast lockup {} for reverse swap {}", txid, swap.id);
		Ok(())
	}

	/// The payer gave up before the lockup: roll the swap back.
	pub async fn on_invoice_cancelled(&self, preimage_hash: [u8; 32]) -> Result<(), SwapError> {
		let swap = match self.store.get_reverse_swap_by_preimage_hash(preimage_hash)? {
			Some(swap) => swap,
			None => return Ok(()),
		};
		let _guard = self.locks.lock(&swap.id).await;
		let status = self
			.store
			.get_reverse_swap(&swap.id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap.id.clone()))?
			.status;
		if matches!(status, SwapStatus::SwapCreated | SwapStatus::InvoiceSet) {
			self.set_status_logged(
				SwapUpdate::new(&swap.id, SwapStatus::SwapExpired)
					.with_failure_reason("hold invoice was cancelled"),
			);
		}
		Ok(())
	}

	/// Lockup output observed; register the claim outpoint and track
	/// confirmations.
	pub async fn on_output_found(
		&self, swap_id: &str, txid: Txid, vout: u32, confirmed: bool,
	) -> Result<(), SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_reverse_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		if swap.status.is_terminal() {
			return Ok(());
		}
		let symbol = self.swap_symbol(&swap)?;
		self.backend(&symbol)?.listener.watch_outpoint(
			OutPoint { txid, vout },
			SwapRef { swap_type: SwapType::Reverse, id: swap_id.to_string() },
		);
		if confirmed && swap.status == SwapStatus::TransactionMempool {
			self.set_status_logged(
				SwapUpdate::new(swap_id, SwapStatus::TransactionConfirmed)
					.with_transaction_id(&txid.to_string()),
			);
		}
		Ok(())
	}

	/// The lockup was spent. If the spend reveals the preimage, settle the
	/// hold invoice; a spend without it is our own refund confirming.
	pub async fn on_outpoint_spent(
		&self, swap_id: &str, spending_transaction: &Transaction,
	) -> Result<(), SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_reverse_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		if swap.status.is_terminal() {
			return Ok(());
		}

		let preimage = match extract_preimage(spending_transaction, &swap.preimage_hash) {
			Some(preimage) => preimage,
			None => {
				warn!("Lockup of reverse swap {} spent without revealing a preimage", swap_id);
				return Ok(());
			},
		};

		self.lightning.settle_hold_invoice(preimage).await?;
		self.store.set_preimage(SwapType::Reverse, swap_id, preimage)?;
		self.set_status_logged(
			SwapUpdate::new(swap_id, SwapStatus::TransactionClaimed)
				.with_transaction_id(&spending_transaction.compute_txid().to_string()),
		);
		info!("Reverse swap {} claimed; hold invoice settled", swap_id);
		Ok(())
	}

	/// Timeout watcher fired: cancel the hold invoice and refund any locked
	/// coins.
	pub async fn on_expiry(&self, swap_id: &str) -> Result<(), SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_reverse_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		if swap.status.is_terminal() || swap.preimage.is_some() {
			return Ok(());
		}

		if let Err(e) = self.lightning.cancel_hold_invoice(swap.preimage_hash).await {
			warn!("Failed to cancel hold invoice of reverse swap {}: {}", swap_id, e);
		}
		self.set_status_logged(
			SwapUpdate::new(swap_id, SwapStatus::SwapExpired)
				.with_failure_reason("onchain HTLC timed out"),
		);

		if swap.lockup_txid.is_some() {
			match self.refund(&swap).await {
				Ok(txid) => {
					self.set_status_logged(
						SwapUpdate::new(swap_id, SwapStatus::TransactionRefunded)
							.with_transaction_id(&txid.to_string()),
					);
				},
				Err(e) => error!("Failed to refund reverse swap {}: {}", swap_id, e),
			}
		}
		Ok(())
	}

	fn tree_of(&self, swap: &ReverseSwap) -> Result<SwapTree, SwapError> {
		Ok(SwapTree::from_parts(
			&swap.claim_leaf_hex,
			&swap.refund_leaf_hex,
			&swap.claim_public_key,
			&swap.refund_public_key,
		)?)
	}

	/// Script-path refund through the CLTV leaf back into the wallet.
	async fn refund(&self, swap: &ReverseSwap) -> Result<Txid, SwapError> {
		let lockup_txid = swap.lockup_txid.ok_or(SwapError::NoLockup)?;
		let symbol = self.swap_symbol(swap)?;
		let backend = self.backend(&symbol)?;
		let wallet = self.wallet(&symbol)?;
		let tree = self.tree_of(swap)?;
		let script_pubkey = tree.script_pubkey(&self.secp, self.network)?;

		let lockup = backend.client.raw_transaction_verbose(&lockup_txid).await?;
		let vout = find_output(&lockup.transaction, &script_pubkey).ok_or(SwapError::NoLockup)?;
		let amount_sat = lockup.transaction.output[vout as usize].value.to_sat();

		let destination = Address::from_str(&wallet.get_address().await?)
			.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?
			.require_network(self.network)
			.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?;
		let fee_sat = backend.client.estimate_fee_sat_vbyte().await? * REFUND_TX_VBYTES;

		let mut transaction = Transaction {
			version: Version::TWO,
			lock_time: LockTime::from_height(swap.timeout_block_height)
				.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?,
			input: vec![TxIn {
				previous_output: OutPoint { txid: lockup_txid, vout },
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(amount_sat.saturating_sub(fee_sat)),
				script_pubkey: destination.script_pubkey(),
			}],
		};

		let prevout = TxOut { value: Amount::from_sat(amount_sat), script_pubkey };
		let leaf_hash = TapLeafHash::from_script(&tree.refund_leaf, LeafVersion::TapScript);
		let sighash = SighashCache::new(&transaction)
			.taproot_script_spend_signature_hash(
				0,
				&Prevouts::All(&[prevout]),
				leaf_hash,
				TapSighashType::Default,
			)
			.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?;

		let keypair = self.keys.keypair(&symbol, swap.refund_key_index)?;
		let signature = self
			.secp
			.sign_schnorr_no_aux_rand(&Message::from_digest(sighash.to_byte_array()), &keypair);

		let control_block = tree.refund_control_block(&self.secp)?;
		let mut witness = Witness::new();
		witness.push(signature.as_ref());
		witness.push(tree.refund_leaf.as_bytes());
		witness.push(control_block.serialize());
		transaction.input[0].witness = witness;

		let txid = backend.client.send_raw_transaction(&transaction).await?;
		let _ = self.store.add_transaction_label(
			&txid,
			&symbol,
			&format!("refund of reverse swap {}", swap.id),
		);
		info!("Refunded reverse swap {} in {}", swap.id, txid);
		Ok(txid)
	}

	fn set_status_logged(&self, update: SwapUpdate) {
		match self.store.set_status(SwapType::Reverse, update) {
			Ok(_) | Err(StoreError::IllegalTransition { .. }) => {},
			Err(e) => error!("Failed to persist status update: {}", e),
		}
	}
}

fn find_output(transaction: &Transaction, script_pubkey: &ScriptBuf) -> Option<u32> {
	transaction
		.output
		.iter()
		.position(|output| output.script_pubkey == *script_pubkey)
		.map(|vout| vout as u32)
}

/// Scans the witnesses of a spending transaction for a 32-byte item whose
/// SHA256 matches the swap hash.
fn extract_preimage(transaction: &Transaction, preimage_hash: &[u8; 32]) -> Option<[u8; 32]> {
	for input in &transaction.input {
		for item in input.witness.iter() {
			if item.len() != 32 {
				continue;
			}
			if sha256::Hash::hash(item).to_byte_array() == *preimage_hash {
				let mut preimage = [0u8; 32];
				preimage.copy_from_slice(item);
				return Some(preimage);
			}
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::listener::ChainListener;
	use crate::io::events::EventBus;
	use crate::test_utils::{test_pubkey, FakeChainClient, FakeLightningClient, FakeWallet};
	use tokio::sync::mpsc;

	struct Harness {
		engine: ReverseEngine,
		store: Arc<SwapStore>,
		chain: Arc<FakeChainClient>,
		lightning: Arc<FakeLightningClient>,
		wallet: Arc<FakeWallet>,
	}

	fn pair() -> Pair {
		Pair {
			base: "BTC".to_string(),
			quote: "BTC".to_string(),
			rate_ppm: 1_000_000,
			fee_percentage_bps: 40,
			min_amount_sat: 10_000,
			max_amount_sat: 10_000_000,
			max_zero_conf_amount_sat: 100_000,
			zero_conf_enabled: true,
			min_lockup_fee_sat_vbyte: 1,
			claim_miner_fee_sat: 1_000,
			timeout_delta_submarine: 1_008,
			timeout_delta_reverse: 144,
			prepay_miner_fee: false,
		}
	}

	fn harness() -> Harness {
		let events = Arc::new(EventBus::new(64));
		let store = Arc::new(SwapStore::in_memory(events.clone()).unwrap());
		let chain = Arc::new(FakeChainClient::new(800_000));
		let (chain_tx, _chain_events) = mpsc::channel(64);
		let listener = Arc::new(ChainListener::new("BTC", chain_tx));
		let lightning = Arc::new(FakeLightningClient::default());
		let wallet = Arc::new(FakeWallet::default());
		let keys = Arc::new(
			KeyProvider::new(&[7u8; 32], Network::Regtest, &["BTC".to_string()], store.clone())
				.unwrap(),
		);

		let mut chains = HashMap::new();
		chains.insert(
			"BTC".to_string(),
			ChainBackend { client: chain.clone(), listener },
		);
		let mut wallets: HashMap<String, Arc<dyn WalletProvider>> = HashMap::new();
		wallets.insert("BTC".to_string(), wallet.clone());
		let mut pairs = HashMap::new();
		pairs.insert("BTC/BTC".to_string(), pair());

		let engine = ReverseEngine::new(
			Network::Regtest,
			store.clone(),
			chains,
			lightning.clone(),
			wallets,
			keys,
			Arc::new(SwapLocks::new()),
			Arc::new(TimeoutWatcher::new()),
			pairs,
			Arc::new(RoutingHintsEngine::new(test_pubkey(42))),
			ReverseConfig::default(),
		);
		Harness { engine, store, chain, lightning, wallet }
	}

	fn create_request(preimage_hash: [u8; 32]) -> CreateReverseRequest {
		CreateReverseRequest {
			from: "BTC".to_string(),
			to: "BTC".to_string(),
			preimage_hash,
			claim_public_key: test_pubkey(11),
			invoice_amount_sat: None,
			onchain_amount_sat: Some(500_000),
			pair_hash: None,
			referral_id: None,
			description_hash: None,
			offer: None,
			address: None,
			address_signature: None,
		}
	}

	fn claim_transaction(lockup_txid: Txid, vout: u32, preimage: Option<[u8; 32]>) -> Transaction {
		let mut witness = Witness::new();
		witness.push([0u8; 64]);
		if let Some(preimage) = preimage {
			witness.push(preimage);
		}
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint { txid: lockup_txid, vout },
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness,
			}],
			output: vec![TxOut {
				value: Amount::from_sat(499_000),
				script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
			}],
		}
	}

	#[tokio::test]
	async fn test_create_issues_hold_invoice_with_hint() {
		let harness = harness();
		let preimage = {
			let mut preimage = [0u8; 32];
			preimage[31] = 1;
			preimage
		};
		let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();

		let created = harness.engine.create(create_request(preimage_hash)).await.unwrap();
		assert!(created.lockup_address.starts_with("bcrt1p"));
		assert_eq!(created.onchain_amount_sat, 500_000);
		// 40 bps on top of the onchain amount.
		let hold = harness.lightning.hold_invoices.lock().unwrap();
		assert_eq!(hold.len(), 1);
		assert_eq!(hold[0].preimage_hash, preimage_hash);
		assert_eq!(hold[0].amount_msat, 502_000_000);
		assert_eq!(hold[0].routing_hints.len(), 1);
		assert_eq!(hold[0].memo, "Send to BTC address");

		let swap = harness.store.get_reverse_swap(&created.id).unwrap().unwrap();
		assert_eq!(swap.status, SwapStatus::InvoiceSet);
	}

	#[tokio::test]
	async fn test_lockup_waits_for_invoice_accept() {
		let harness = harness();
		let preimage_hash = sha256::Hash::hash(&[2u8; 32]).to_byte_array();
		harness.engine.create(create_request(preimage_hash)).await.unwrap();

		// No lockup before the invoice is held.
		assert!(harness.wallet.sent.lock().unwrap().is_empty());

		harness.engine.on_invoice_accepted(preimage_hash).await.unwrap();
		let sent = harness.wallet.sent.lock().unwrap();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].1, 500_000);
	}

	#[tokio::test]
	async fn test_claim_reveals_preimage_and_settles() {
		let harness = harness();
		let preimage = {
			let mut preimage = [0u8; 32];
			preimage[31] = 1;
			preimage
		};
		let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();
		let created = harness.engine.create(create_request(preimage_hash)).await.unwrap();
		harness.engine.on_invoice_accepted(preimage_hash).await.unwrap();

		let swap = harness.store.get_reverse_swap(&created.id).unwrap().unwrap();
		assert_eq!(swap.status, SwapStatus::TransactionMempool);
		let lockup_txid = swap.lockup_txid.unwrap();

		harness.engine.on_output_found(&created.id, lockup_txid, 0, true).await.unwrap();
		assert_eq!(
			harness.store.get_reverse_swap(&created.id).unwrap().unwrap().status,
			SwapStatus::TransactionConfirmed
		);

		let claim = claim_transaction(lockup_txid, 0, Some(preimage));
		harness.engine.on_outpoint_spent(&created.id, &claim).await.unwrap();

		assert_eq!(harness.lightning.settled.lock().unwrap().as_slice(), &[preimage]);
		let swap = harness.store.get_reverse_swap(&created.id).unwrap().unwrap();
		assert_eq!(swap.status, SwapStatus::TransactionClaimed);
		assert_eq!(swap.preimage, Some(preimage));
	}

	#[tokio::test]
	async fn test_spend_without_preimage_never_settles() {
		let harness = harness();
		let preimage_hash = sha256::Hash::hash(&[3u8; 32]).to_byte_array();
		let created = harness.engine.create(create_request(preimage_hash)).await.unwrap();
		harness.engine.on_invoice_accepted(preimage_hash).await.unwrap();
		let lockup_txid =
			harness.store.get_reverse_swap(&created.id).unwrap().unwrap().lockup_txid.unwrap();

		let spend = claim_transaction(lockup_txid, 0, None);
		harness.engine.on_outpoint_spent(&created.id, &spend).await.unwrap();

		assert!(harness.lightning.settled.lock().unwrap().is_empty());
		assert_eq!(
			harness.store.get_reverse_swap(&created.id).unwrap().unwrap().status,
			SwapStatus::TransactionMempool
		);
	}

	#[tokio::test]
	async fn test_wrong_preimage_never_settles() {
		let harness = harness();
		let preimage_hash = sha256::Hash::hash(&[4u8; 32]).to_byte_array();
		let created = harness.engine.create(create_request(preimage_hash)).await.unwrap();
		harness.engine.on_invoice_accepted(preimage_hash).await.unwrap();
		let lockup_txid =
			harness.store.get_reverse_swap(&created.id).unwrap().unwrap().lockup_txid.unwrap();

		let spend = claim_transaction(lockup_txid, 0, Some([9u8; 32]));
		harness.engine.on_outpoint_spent(&created.id, &spend).await.unwrap();

		assert!(harness.lightning.settled.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_expiry_before_lockup_cancels_invoice_only() {
		let harness = harness();
		let preimage_hash = sha256::Hash::hash(&[5u8; 32]).to_byte_array();
		let created = harness.engine.create(create_request(preimage_hash)).await.unwrap();

		harness.engine.on_expiry(&created.id).await.unwrap();

		assert_eq!(
			harness.lightning.cancelled_invoices.lock().unwrap().as_slice(),
			&[preimage_hash]
		);
		assert!(harness.chain.broadcast.lock().unwrap().is_empty());
		assert_eq!(
			harness.store.get_reverse_swap(&created.id).unwrap().unwrap().status,
			SwapStatus::SwapExpired
		);
	}

	#[tokio::test]
	async fn test_expiry_after_lockup_refunds() {
		let harness = harness();
		let preimage_hash = sha256::Hash::hash(&[6u8; 32]).to_byte_array();
		let created = harness.engine.create(create_request(preimage_hash)).await.unwrap();
		harness.engine.on_invoice_accepted(preimage_hash).await.unwrap();

		// Make the lockup transaction visible to the chain client so the
		// refund builder can locate its output.
		let swap = harness.store.get_reverse_swap(&created.id).unwrap().unwrap();
		let tree = SwapTree::from_parts(
			&swap.claim_leaf_hex,
			&swap.refund_leaf_hex,
			&swap.claim_public_key,
			&swap.refund_public_key,
		)
		.unwrap();
		let secp = Secp256k1::new();
		let lockup = Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::null(),
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(500_000),
				script_pubkey: tree.script_pubkey(&secp, Network::Regtest).unwrap(),
			}],
		};
		// Overwrite the recorded txid with the constructed transaction's.
		harness
			.store
			.set_lockup(
				SwapType::Reverse,
				&created.id,
				&lockup.compute_txid(),
				0,
				500_000,
				false,
			)
			.unwrap();
		harness.chain.insert_transaction(lockup, 1);

		harness.engine.on_expiry(&created.id).await.unwrap();

		assert_eq!(
			harness.lightning.cancelled_invoices.lock().unwrap().as_slice(),
			&[preimage_hash]
		);
		let broadcast = harness.chain.broadcast.lock().unwrap();
		assert_eq!(broadcast.len(), 1);
		assert_eq!(
			broadcast[0].lock_time,
			LockTime::from_height(swap.timeout_block_height).unwrap()
		);
		assert_eq!(
			harness.store.get_reverse_swap(&created.id).unwrap().unwrap().status,
			SwapStatus::TransactionRefunded
		);
	}

	#[tokio::test]
	async fn test_description_hash_must_be_32_bytes() {
		let harness = harness();
		let mut request = create_request(sha256::Hash::hash(&[7u8; 32]).to_byte_array());
		request.description_hash = Some(vec![0u8; 31]);
		assert!(matches!(
			harness.engine.create(request).await,
			Err(SwapError::Hints(_))
		));
	}

	// The offer example from the BOLT12 specification.
	const TEST_OFFER: &str = "lno1pqps7sjqpgtyzm3qv4uxzmtsd3jjqer9wd3hy6tsw35k7msjzfpy7nz5yqcny\
		grfdej82um5wf5k2uckyypwa3eyt44h6txtxquqh7lz5djge4afgfjn7k4rgrkuag0jsd5xvxg";

	#[tokio::test]
	async fn test_offer_descriptor_has_no_routing_hints() {
		let harness = harness();
		let mut request = create_request(sha256::Hash::hash(&[10u8; 32]).to_byte_array());
		request.offer = Some(TEST_OFFER.to_string());

		harness.engine.create(request).await.unwrap();

		let hold = harness.lightning.hold_invoices.lock().unwrap();
		assert_eq!(hold.len(), 1);
		assert!(hold[0].routing_hints.is_empty());
	}

	#[tokio::test]
	async fn test_invalid_offer_is_rejected() {
		let harness = harness();
		let mut request = create_request(sha256::Hash::hash(&[11u8; 32]).to_byte_array());
		request.offer = Some("lno1notanoffer".to_string());
		assert!(matches!(harness.engine.create(request).await, Err(SwapError::Hints(_))));
	}

	#[tokio::test]
	async fn test_amount_is_required() {
		let harness = harness();
		let mut request = create_request(sha256::Hash::hash(&[8u8; 32]).to_byte_array());
		request.onchain_amount_sat = None;
		assert!(matches!(
			harness.engine.create(request).await,
			Err(SwapError::MissingAmount)
		));
	}
}
