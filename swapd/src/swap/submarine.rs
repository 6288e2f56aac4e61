// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The submarine swap lifecycle: accept an onchain deposit, pay the
//! Lightning invoice, claim the deposit once the invoice settled.
//!
//! Every handler takes the per-swap lock before touching the record, so
//! chain events, Lightning results, expiries and API calls targeting the
//! same swap serialise. Transitions between suspension points are atomic;
//! all status writes go through the store's predecessor validation.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{All, Message, PublicKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::transaction::Version;
use bitcoin::{
	Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
	Witness,
};
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::chain::ChainBackend;
use crate::chain::SwapRef;
use crate::lightning::{decode_invoice, LightningClient, PayInvoiceRequest};
use crate::swap::htlc::{SwapTree, CLAIM_TX_VBYTES};
use crate::swap::nursery::NurseryEvent;
use crate::swap::status::{SwapStatus, SwapUpdate};
use crate::swap::timeout::TimeoutWatcher;
use crate::swap::{
	chain_currency, generate_swap_id, split_pair, Pair, Swap, SwapError, SwapLocks, SwapType,
};
use crate::io::persist::{StoreError, SwapStore};
use crate::util::backoff::Backoff;
use crate::util::key_provider::KeyProvider;
use crate::wallet::WalletProvider;

#[derive(Debug, Clone)]
pub struct SubmarineConfig {
	pub max_payment_attempts: u32,
	pub payment_timeout: Duration,
	pub payment_retry_base: Duration,
	pub max_routing_fee_ppm: u64,
	pub cooperative_claim_timeout: Duration,
	/// Blocks a mempool lockup may stay unknown to the node before the swap
	/// is failed.
	pub mempool_eviction_grace_blocks: u32,
}

impl Default for SubmarineConfig {
	fn default() -> Self {
		Self {
			max_payment_attempts: 5,
			payment_timeout: Duration::from_secs(300),
			payment_retry_base: Duration::from_secs(2),
			max_routing_fee_ppm: 10_000,
			cooperative_claim_timeout: Duration::from_secs(120),
			mempool_eviction_grace_blocks: 3,
		}
	}
}

/// Parameters of `POST /swap/submarine` after request validation.
#[derive(Debug, Clone)]
pub struct CreateSubmarineRequest {
	pub from: String,
	pub to: String,
	pub invoice: String,
	pub refund_public_key: PublicKey,
	pub pair_hash: Option<String>,
	pub referral_id: Option<String>,
	pub channel: Option<ChannelRequest>,
}

/// "Open a channel on arrival" attachment.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
	pub private: bool,
	pub inbound_liquidity_percent: u32,
}

#[derive(Debug, Clone)]
pub struct CreatedSubmarine {
	pub id: String,
	pub address: String,
	pub bip21: String,
	pub claim_public_key: PublicKey,
	pub claim_leaf_hex: String,
	pub refund_leaf_hex: String,
	pub timeout_block_height: u32,
	pub expected_amount_sat: u64,
	pub accept_zero_conf: bool,
}

pub struct SubmarineEngine {
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
	nursery_events: mpsc::Sender<NurseryEvent>,
	config: SubmarineConfig,
	eviction_misses: Mutex<HashMap<String, u32>>,
}

impl SubmarineEngine {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		network: Network, store: Arc<SwapStore>, chains: HashMap<String, ChainBackend>,
		lightning: Arc<dyn LightningClient>, wallets: HashMap<String, Arc<dyn WalletProvider>>,
		keys: Arc<KeyProvider>, locks: Arc<SwapLocks>, timeouts: Arc<TimeoutWatcher>,
		pairs: HashMap<String, Pair>, nursery_events: mpsc::Sender<NurseryEvent>,
		config: SubmarineConfig,
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
			nursery_events,
			config,
			eviction_misses: Mutex::new(HashMap::new()),
		}
	}

	fn backend(&self, symbol: &str) -> Result<&ChainBackend, SwapError> {
		self.chains.get(symbol).ok_or_else(|| SwapError::UnknownCurrency(symbol.to_string()))
	}

	fn wallet(&self, symbol: &str) -> Result<&Arc<dyn WalletProvider>, SwapError> {
		self.wallets.get(symbol).ok_or_else(|| SwapError::UnknownCurrency(symbol.to_string()))
	}

	pub async fn create(
		&self, request: CreateSubmarineRequest,
	) -> Result<CreatedSubmarine, SwapError> {
		let (pair, order_side) = crate::swap::resolve_pair(
			&self.pairs,
			&request.from,
			&request.to,
			SwapType::Submarine,
		)?;
		let pair = pair.clone();
		if let Some(hash) = &request.pair_hash {
			if *hash != pair.hash() {
				return Err(SwapError::PairHashMismatch);
			}
		}

		let invoice = decode_invoice(&request.invoice)
			.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?;
		if invoice.is_expired {
			return Err(SwapError::InvoiceExpired);
		}
		let invoice_amount_sat = invoice
			.amount_msat
			.map(|msat| msat / 1_000)
			.ok_or_else(|| SwapError::InvalidInvoice("amountless invoice".to_string()))?;
		if invoice_amount_sat < pair.min_amount_sat || invoice_amount_sat > pair.max_amount_sat {
			return Err(SwapError::AmountOutOfBounds {
				amount_sat: invoice_amount_sat,
				min_sat: pair.min_amount_sat,
				max_sat: pair.max_amount_sat,
			});
		}

		let expected_amount_sat = invoice_amount_sat
			+ pair.service_fee_sat(invoice_amount_sat)
			+ pair.claim_miner_fee_sat;

		let symbol = request.from.clone();
		let backend = self.backend(&symbol)?;
		let info = backend.client.blockchain_info().await?;
		let timeout_block_height = info.height + pair.timeout_delta_submarine;

		let (claim_key_index, claim_keypair) = self.keys.next_keypair(&symbol)?;
		let claim_public_key = claim_keypair.public_key();

		let tree = SwapTree::new(
			&claim_public_key,
			&request.refund_public_key,
			&invoice.payment_hash,
			timeout_block_height,
		)?;
		let address = tree.address(&self.secp, self.network)?;

		let swap = Swap {
			id: generate_swap_id(),
			pair: pair.symbol(),
			order_side,
			invoice: request.invoice.clone(),
			preimage_hash: invoice.payment_hash,
			refund_public_key: request.refund_public_key,
			claim_public_key,
			claim_key_index,
			claim_leaf_hex: tree.claim_leaf.to_hex_string(),
			refund_leaf_hex: tree.refund_leaf.to_hex_string(),
			htlc_address: address.to_string(),
			expected_amount_sat,
			accept_zero_conf: pair.zero_conf_enabled
				&& expected_amount_sat <= pair.max_zero_conf_amount_sat,
			timeout_block_height,
			lockup_txid: None,
			lockup_vout: None,
			onchain_amount_sat: None,
			paid_preimage: None,
			status: SwapStatus::SwapCreated,
			created_at: Utc::now().timestamp(),
		};
		self.store.create_swap(&swap)?;

		if let Some(channel) = &request.channel {
			let node_public_key = PublicKey::from_slice(&invoice.payee_pubkey)
				.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?;
			self.store.set_channel_creation(&crate::swap::ChannelCreation {
				swap_id: swap.id.clone(),
				node_public_key,
				private: channel.private,
				inbound_liquidity_percent: channel.inbound_liquidity_percent,
				funding_txid: None,
				funding_vout: None,
				status: crate::swap::ChannelCreationStatus::Attempted,
			})?;
		}

		backend.listener.watch_script(
			address.script_pubkey(),
			SwapRef { swap_type: SwapType::Submarine, id: swap.id.clone() },
		);
		self.timeouts.track(
			&symbol,
			timeout_block_height,
			SwapRef { swap_type: SwapType::Submarine, id: swap.id.clone() },
		);

		info!(
			"Created submarine swap {} on {} expecting {} sat",
			swap.id, symbol, expected_amount_sat
		);
		Ok(CreatedSubmarine {
			id: swap.id,
			bip21: format!(
				"bitcoin:{}?amount={}",
				address,
				Amount::from_sat(expected_amount_sat)
					.to_string_in(bitcoin::Denomination::Bitcoin)
			),
			address: address.to_string(),
			claim_public_key,
			claim_leaf_hex: tree.claim_leaf.to_hex_string(),
			refund_leaf_hex: tree.refund_leaf.to_hex_string(),
			timeout_block_height,
			expected_amount_sat,
			accept_zero_conf: swap.accept_zero_conf,
		})
	}

	/// Replaces the invoice of a swap whose lockup was not seen yet. The
	/// HTLC output commits to the payment hash, so the new invoice must
	/// reuse it.
	pub async fn set_invoice(
		&self, swap_id: &str, invoice: &str,
	) -> Result<u64, SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		if swap.status != SwapStatus::SwapCreated {
			return Err(SwapError::InvalidInvoice(
				"the invoice can no longer be changed".to_string(),
			));
		}

		let decoded =
			decode_invoice(invoice).map_err(|e| SwapError::InvalidInvoice(e.to_string()))?;
		if decoded.is_expired {
			return Err(SwapError::InvoiceExpired);
		}
		if decoded.payment_hash != swap.preimage_hash {
			return Err(SwapError::InvalidInvoice(
				"the invoice does not commit to the swap hash".to_string(),
			));
		}
		let invoice_amount_sat = decoded
			.amount_msat
			.map(|msat| msat / 1_000)
			.ok_or_else(|| SwapError::InvalidInvoice("amountless invoice".to_string()))?;
		let pair = self.pair_of(&swap)?;
		let expected_amount_sat = invoice_amount_sat
			+ pair.service_fee_sat(invoice_amount_sat)
			+ pair.claim_miner_fee_sat;

		self.store.set_invoice(swap_id, invoice, decoded.payment_hash, expected_amount_sat)?;
		self.set_status_logged(SwapUpdate::new(swap_id, SwapStatus::InvoiceSet));
		Ok(expected_amount_sat)
	}

	/// Re-arms watched scripts and timeout entries after a restart.
	pub async fn restore(&self) -> Result<(), SwapError> {
		for swap in self.store.pending_swaps()? {
			let symbol = self.swap_symbol(&swap)?;
			let backend = self.backend(&symbol)?;
			let tree = SwapTree::from_parts(
				&swap.claim_leaf_hex,
				&swap.refund_leaf_hex,
				&swap.claim_public_key,
				&swap.refund_public_key,
			)?;
			backend.listener.watch_script(
				tree.script_pubkey(&self.secp, self.network)?,
				SwapRef { swap_type: SwapType::Submarine, id: swap.id.clone() },
			);
			self.timeouts.track(
				&symbol,
				swap.timeout_block_height,
				SwapRef { swap_type: SwapType::Submarine, id: swap.id },
			);
		}
		Ok(())
	}

	fn swap_symbol(&self, swap: &Swap) -> Result<String, SwapError> {
		let (base, quote) = split_pair(&swap.pair)
			.ok_or_else(|| SwapError::UnknownPair(swap.pair.clone()))?;
		Ok(chain_currency(base, quote, swap.order_side, SwapType::Submarine))
	}

	fn pair_of(&self, swap: &Swap) -> Result<&Pair, SwapError> {
		self.pairs.get(&swap.pair).ok_or_else(|| SwapError::UnknownPair(swap.pair.clone()))
	}

	pub async fn on_output_found(
		self: &Arc<Self>, swap_id: &str, transaction: &Transaction, txid: Txid, vout: u32,
		amount_sat: u64, confirmed: bool,
	) -> Result<(), SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		if swap.status.is_terminal() {
			return Ok(());
		}

		if swap.lockup_txid.is_none() {
			self.store.set_lockup(SwapType::Submarine, swap_id, &txid, vout, amount_sat, false)?;
		}

		// Underpayment has no forward path except a refund.
		if amount_sat < swap.expected_amount_sat {
			warn!(
				"Lockup of swap {} underpaid: {} < {} sat",
				swap_id, amount_sat, swap.expected_amount_sat
			);
			self.set_status_logged(
				SwapUpdate::new(swap_id, SwapStatus::TransactionLockupFailed)
					.with_failure_reason("locked up less than expected")
					.with_transaction_id(&txid.to_string()),
			);
			return Ok(());
		}

		if confirmed {
			self.eviction_misses.lock().unwrap().remove(swap_id);
			if matches!(swap.status, SwapStatus::SwapCreated | SwapStatus::InvoiceSet) {
				self.set_status_logged(
					SwapUpdate::new(swap_id, SwapStatus::TransactionMempool)
						.with_transaction_id(&txid.to_string()),
				);
			}
			let status = self.current_status(swap_id)?;
			if status == SwapStatus::TransactionMempool {
				self.set_status_logged(
					SwapUpdate::new(swap_id, SwapStatus::TransactionConfirmed)
						.with_transaction_id(&txid.to_string()),
				);
			}
			self.lockup_eligible(swap_id).await?;
		} else if matches!(swap.status, SwapStatus::SwapCreated | SwapStatus::InvoiceSet) {
			let pair = self.pair_of(&swap)?.clone();
			let symbol = self.swap_symbol(&swap)?;
			let zero_conf =
				self.zero_conf_acceptable(&pair, &symbol, transaction, amount_sat).await?;
			if zero_conf {
				self.store.set_lockup(
					SwapType::Submarine,
					swap_id,
					&txid,
					vout,
					amount_sat,
					true,
				)?;
			}
			let mut update = SwapUpdate::new(swap_id, SwapStatus::TransactionMempool)
				.with_transaction_id(&txid.to_string());
			update.zero_conf_rejected = Some(!zero_conf);
			self.set_status_logged(update);
			if zero_conf {
				self.lockup_eligible(swap_id).await?;
			}
		}
		Ok(())
	}

	/// Zero-conf policy: pair permission, amount cap, no RBF signalling on
	/// the transaction or its unconfirmed ancestors, standard inputs, and a
	/// fee rate above the pair minimum.
	async fn zero_conf_acceptable(
		&self, pair: &Pair, symbol: &str, transaction: &Transaction, amount_sat: u64,
	) -> Result<bool, SwapError> {
		if !pair.zero_conf_enabled || amount_sat > pair.max_zero_conf_amount_sat {
			return Ok(false);
		}
		if transaction.input.iter().any(|input| input.sequence.is_rbf()) {
			debug!("Zero-conf rejected: lockup signals RBF");
			return Ok(false);
		}
		if transaction.input.iter().any(|input| !input.script_sig.is_empty()) {
			debug!("Zero-conf rejected: non-segwit input");
			return Ok(false);
		}

		let backend = self.backend(symbol)?;
		let mut input_value_sat = 0u64;
		for input in &transaction.input {
			let prev = match backend
				.client
				.raw_transaction_verbose(&input.previous_output.txid)
				.await
			{
				Ok(prev) => prev,
				Err(_) => return Ok(false),
			};
			if prev.confirmations == 0
				&& prev.transaction.input.iter().any(|ancestor| ancestor.sequence.is_rbf())
			{
				debug!("Zero-conf rejected: unconfirmed ancestor signals RBF");
				return Ok(false);
			}
			let prevout = prev
				.transaction
				.output
				.get(input.previous_output.vout as usize)
				.ok_or(SwapError::NoLockup)?;
			input_value_sat += prevout.value.to_sat();
		}

		let output_value_sat: u64 =
			transaction.output.iter().map(|output| output.value.to_sat()).sum();
		let fee_sat = input_value_sat.saturating_sub(output_value_sat);
		let fee_rate = fee_sat / transaction.vsize() as u64;
		Ok(fee_rate >= pair.min_lockup_fee_sat_vbyte)
	}

	/// The lockup can be relied upon; either pay the invoice or hand the
	/// swap to the channel nursery.
	async fn lockup_eligible(self: &Arc<Self>, swap_id: &str) -> Result<(), SwapError> {
		if self.store.get_channel_creation(swap_id)?.is_some() {
			let _ = self
				.nursery_events
				.send(NurseryEvent::LockupEligible { swap_id: swap_id.to_string() })
				.await;
			return Ok(());
		}
		let status = self.current_status(swap_id)?;
		if matches!(status, SwapStatus::TransactionMempool | SwapStatus::TransactionConfirmed) {
			self.spawn_payment(swap_id.to_string());
		}
		Ok(())
	}

	pub fn spawn_payment(self: &Arc<Self>, swap_id: String) {
		let engine = Arc::clone(self);
		tokio::spawn(async move {
			if let Err(e) = engine.pay_invoice_task(&swap_id).await {
				error!("Invoice payment of swap {} failed: {}", swap_id, e);
			}
		});
	}

	async fn pay_invoice_task(self: &Arc<Self>, swap_id: &str) -> Result<(), SwapError> {
		let swap = {
			let _guard = self.locks.lock(swap_id).await;
			let swap = self
				.store
				.get_swap(swap_id)?
				.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
			if !matches!(
				swap.status,
				SwapStatus::TransactionMempool | SwapStatus::TransactionConfirmed
			) {
				return Ok(());
			}
			self.set_status_logged(SwapUpdate::new(swap_id, SwapStatus::InvoicePending));
			swap
		};

		let backoff = Backoff::new(self.config.payment_retry_base, Duration::from_secs(60));
		let deadline = Instant::now() + self.config.payment_timeout;

		for attempt in 0..self.config.max_payment_attempts {
			let request = PayInvoiceRequest {
				invoice: swap.invoice.clone(),
				max_fee_ppm: self.config.max_routing_fee_ppm,
				outgoing_channel_id: None,
				timeout_secs: self.config.payment_timeout.as_secs(),
			};
			match self.lightning.pay_invoice(request).await {
				Ok(preimage) => {
					self.finish_invoice_paid(swap_id, preimage).await?;
					return Ok(());
				},
				Err(e) if e.is_terminal_payment_failure() => {
					warn!("Invoice of swap {} is unpayable: {}", swap_id, e);
					let _guard = self.locks.lock(swap_id).await;
					self.set_status_logged(
						SwapUpdate::new(swap_id, SwapStatus::InvoiceFailedToPay)
							.with_failure_reason(&e.to_string()),
					);
					return Ok(());
				},
				Err(e) => {
					warn!(
						"Payment attempt {} for swap {} failed transiently: {}",
						attempt + 1,
						swap_id,
						e
					);
				},
			}

			if Instant::now() + backoff.delay(attempt) >= deadline {
				break;
			}
			sleep(backoff.delay(attempt)).await;

			// The swap may have expired while we were backing off.
			if self.current_status(swap_id)?.is_terminal() {
				return Ok(());
			}
		}

		let _guard = self.locks.lock(swap_id).await;
		if !self.current_status(swap_id)?.is_terminal() {
			self.set_status_logged(
				SwapUpdate::new(swap_id, SwapStatus::InvoiceFailedToPay)
					.with_failure_reason("payment attempts exhausted"),
			);
		}
		Ok(())
	}

	/// Invoice settled: record the preimage and enter the claim phase. The
	/// cooperative claim and the script-path fallback race; the wall-clock
	/// deadline arms the fallback.
	pub async fn finish_invoice_paid(
		self: &Arc<Self>, swap_id: &str, preimage: [u8; 32],
	) -> Result<(), SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		self.store.set_preimage(SwapType::Submarine, swap_id, preimage)?;
		self.set_status_logged(SwapUpdate::new(swap_id, SwapStatus::InvoicePaid));
		self.set_status_logged(SwapUpdate::new(swap_id, SwapStatus::TransactionClaimPending));
		self.timeouts
			.track_wall_clock(swap_id, Instant::now() + self.config.cooperative_claim_timeout);
		Ok(())
	}

	/// A fully signed cooperative claim arrived before the fallback fired.
	pub async fn broadcast_cooperative_claim(
		&self, swap_id: &str, transaction: Transaction,
	) -> Result<Txid, SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		let symbol = self.swap_symbol(&swap)?;
		let backend = self.backend(&symbol)?;
		let txid = backend.client.send_raw_transaction(&transaction).await?;
		self.timeouts.untrack_wall_clock(swap_id);
		let _ = self.store.add_transaction_label(
			&txid,
			&symbol,
			&format!("cooperative claim of swap {}", swap_id),
		);
		self.set_status_logged(
			SwapUpdate::new(swap_id, SwapStatus::TransactionClaimed)
				.with_transaction_id(&txid.to_string()),
		);
		Ok(txid)
	}

	/// Wall-clock fallback: claim via the script path using the revealed
	/// preimage.
	pub async fn cooperative_claim_fallback(self: &Arc<Self>, swap_id: &str) {
		if let Err(e) = self.script_path_claim(swap_id).await {
			error!("Script-path claim of swap {} failed: {}", swap_id, e);
		}
	}

	async fn script_path_claim(&self, swap_id: &str) -> Result<Txid, SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		if swap.status != SwapStatus::TransactionClaimPending {
			return Err(SwapError::SwapNotFound(swap_id.to_string()));
		}
		let preimage = swap.paid_preimage.ok_or(SwapError::NoLockup)?;
		let lockup_txid = swap.lockup_txid.ok_or(SwapError::NoLockup)?;
		let lockup_vout = swap.lockup_vout.ok_or(SwapError::NoLockup)?;
		let amount_sat = swap.onchain_amount_sat.ok_or(SwapError::NoLockup)?;

		let symbol = self.swap_symbol(&swap)?;
		let backend = self.backend(&symbol)?;
		let wallet = self.wallet(&symbol)?;
		let destination = Address::from_str(&wallet.get_address().await?)
			.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?
			.require_network(self.network)
			.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?;

		let tree = SwapTree::from_parts(
			&swap.claim_leaf_hex,
			&swap.refund_leaf_hex,
			&swap.claim_public_key,
			&swap.refund_public_key,
		)?;

		let fee_sat = backend.client.estimate_fee_sat_vbyte().await? * CLAIM_TX_VBYTES;
		let mut transaction = Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint { txid: lockup_txid, vout: lockup_vout },
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(amount_sat.saturating_sub(fee_sat)),
				script_pubkey: destination.script_pubkey(),
			}],
		};

		let prevout = TxOut {
			value: Amount::from_sat(amount_sat),
			script_pubkey: tree.script_pubkey(&self.secp, self.network)?,
		};
		let leaf_hash = TapLeafHash::from_script(&tree.claim_leaf, LeafVersion::TapScript);
		let sighash = SighashCache::new(&transaction)
			.taproot_script_spend_signature_hash(
				0,
				&Prevouts::All(&[prevout]),
				leaf_hash,
				TapSighashType::Default,
			)
			.map_err(|e| SwapError::InvalidInvoice(e.to_string()))?;

		let keypair = self.keys.keypair(&symbol, swap.claim_key_index)?;
		let signature = self
			.secp
			.sign_schnorr_no_aux_rand(&Message::from_digest(sighash.to_byte_array()), &keypair);

		let control_block = tree.claim_control_block(&self.secp)?;
		let mut witness = Witness::new();
		witness.push(signature.as_ref());
		witness.push(preimage);
		witness.push(tree.claim_leaf.as_bytes());
		witness.push(control_block.serialize());
		transaction.input[0].witness = witness;

		let txid = backend.client.send_raw_transaction(&transaction).await?;
		let _ = self.store.add_transaction_label(
			&txid,
			&symbol,
			&format!("claim of swap {}", swap_id),
		);
		info!("Claimed swap {} via script path in {}", swap_id, txid);
		self.set_status_logged(
			SwapUpdate::new(swap_id, SwapStatus::TransactionClaimed)
				.with_transaction_id(&txid.to_string()),
		);
		Ok(txid)
	}

	pub async fn on_output_retracted(&self, swap_id: &str) -> Result<(), SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let status = self.current_status(swap_id)?;
		match status {
			SwapStatus::TransactionConfirmed => {
				warn!("Lockup of swap {} was reorged out, rolling back", swap_id);
				self.set_status_logged(SwapUpdate::new(swap_id, SwapStatus::TransactionMempool));
			},
			status if status.is_terminal() => {},
			status => {
				// Past the point of no return; the payment pipeline already
				// relied on the lockup.
				warn!(
					"Lockup of swap {} was reorged out in status {}; keeping state",
					swap_id, status
				);
			},
		}
		Ok(())
	}

	/// Per-block housekeeping: detect lockups evicted from the mempool.
	pub async fn on_block(&self, symbol: &str) -> Result<(), SwapError> {
		let backend = self.backend(symbol)?;
		for swap in self.store.swaps_by_status(SwapStatus::TransactionMempool)? {
			if self.swap_symbol(&swap)? != symbol {
				continue;
			}
			let lockup_txid = match swap.lockup_txid {
				Some(txid) => txid,
				None => continue,
			};
			match backend.client.raw_transaction_verbose(&lockup_txid).await {
				Ok(_) => {
					self.eviction_misses.lock().unwrap().remove(&swap.id);
				},
				Err(_) => {
					let misses = {
						let mut eviction_misses = self.eviction_misses.lock().unwrap();
						let misses = eviction_misses.entry(swap.id.clone()).or_insert(0);
						*misses += 1;
						*misses
					};
					if misses > self.config.mempool_eviction_grace_blocks {
						let _guard = self.locks.lock(&swap.id).await;
						warn!("Lockup of swap {} disappeared from the mempool", swap.id);
						self.set_status_logged(
							SwapUpdate::new(&swap.id, SwapStatus::TransactionLockupFailed)
								.with_failure_reason("lockup transaction was evicted"),
						);
					}
				},
			}
		}
		Ok(())
	}

	/// Timeout watcher fired for this swap.
	pub async fn on_expiry(&self, swap_id: &str) -> Result<(), SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		if matches!(
			swap.status,
			SwapStatus::InvoicePaid
				| SwapStatus::TransactionClaimPending
				| SwapStatus::TransactionClaimed
		) || swap.status.is_terminal()
		{
			return Ok(());
		}

		if swap.status == SwapStatus::InvoicePending {
			if let Err(e) = self.lightning.cancel_payment(swap.preimage_hash).await {
				warn!("Failed to cancel pending payment of swap {}: {}", swap_id, e);
			}
		}
		self.set_status_logged(
			SwapUpdate::new(swap_id, SwapStatus::SwapExpired)
				.with_failure_reason("onchain HTLC timed out"),
		);
		let _ = self
			.nursery_events
			.send(NurseryEvent::SwapExpired { swap_id: swap_id.to_string() })
			.await;
		Ok(())
	}

	fn current_status(&self, swap_id: &str) -> Result<SwapStatus, SwapError> {
		Ok(self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?
			.status)
	}

	/// Illegal transitions are invariant violations; they are logged by the
	/// store and must not take down the event pipeline.
	fn set_status_logged(&self, update: SwapUpdate) {
		match self.store.set_status(SwapType::Submarine, update) {
			Ok(_) | Err(StoreError::IllegalTransition { .. }) => {},
			Err(e) => error!("Failed to persist status update: {}", e),
		}
	}
}

#[cfg(test)]
mod tests {
	use bitcoin::hashes::Hash;
	use tokio::sync::broadcast;

	use super::*;
	use crate::io::events::EventBus;
	use crate::lightning::LightningError;
	use crate::test_utils::{FakeChainClient, FakeLightningClient, FakeWallet};
	use crate::chain::listener::ChainListener;
	use crate::chain::ChainEvent;

	struct Harness {
		engine: Arc<SubmarineEngine>,
		store: Arc<SwapStore>,
		events: Arc<EventBus>,
		chain: Arc<FakeChainClient>,
		lightning: Arc<FakeLightningClient>,
		_chain_events: mpsc::Receiver<ChainEvent>,
		nursery_events: mpsc::Receiver<NurseryEvent>,
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
		let keys = Arc::new(
			KeyProvider::new(
				&[7u8; 32],
				Network::Regtest,
				&["BTC".to_string()],
				store.clone(),
			)
			.unwrap(),
		);
		let (nursery_tx, nursery_events) = mpsc::channel(64);

		let mut chains = HashMap::new();
		chains.insert(
			"BTC".to_string(),
			ChainBackend { client: chain.clone(), listener: listener.clone() },
		);
		let mut wallets: HashMap<String, Arc<dyn WalletProvider>> = HashMap::new();
		wallets.insert("BTC".to_string(), Arc::new(FakeWallet::default()));
		let mut pairs = HashMap::new();
		pairs.insert("BTC/BTC".to_string(), pair());

		let engine = Arc::new(SubmarineEngine::new(
			Network::Regtest,
			store.clone(),
			chains,
			lightning.clone(),
			wallets,
			keys,
			Arc::new(SwapLocks::new()),
			Arc::new(TimeoutWatcher::new()),
			pairs,
			nursery_tx,
			SubmarineConfig {
				payment_retry_base: Duration::from_millis(1),
				payment_timeout: Duration::from_secs(5),
				..SubmarineConfig::default()
			},
		));
		Harness { engine, store, events, chain, lightning, _chain_events, nursery_events }
	}

	fn insert_swap(harness: &Harness, expected_amount_sat: u64) -> Swap {
		let swap = Swap {
			expected_amount_sat,
			..crate::io::persist::sqlite_store::tests::test_swap(&generate_swap_id())
		};
		harness.store.create_swap(&swap).unwrap();
		swap
	}

	fn lockup_tx(amount_sat: u64) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint { txid: Txid::all_zeros(), vout: 0 },
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(amount_sat),
				script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
			}],
		}
	}

	fn statuses(rx: &mut broadcast::Receiver<SwapUpdate>, id: &str) -> Vec<SwapStatus> {
		let mut seen = Vec::new();
		while let Ok(update) = rx.try_recv() {
			if update.id == id {
				seen.push(update.status);
			}
		}
		seen
	}

	async fn settle_payments() {
		// Let the spawned payment task run to completion.
		for _ in 0..50 {
			tokio::task::yield_now().await;
		}
	}

	#[tokio::test]
	async fn test_happy_path_reaches_claim() {
		let harness = harness();
		let mut rx = harness.events.subscribe();
		let swap = insert_swap(&harness, 1_000_000);
		let transaction = lockup_tx(1_000_000);
		let txid = transaction.compute_txid();

		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 1_000_000, false)
			.await
			.unwrap();
		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 1_000_000, true)
			.await
			.unwrap();
		settle_payments().await;

		let seen = statuses(&mut rx, &swap.id);
		assert_eq!(seen[0], SwapStatus::SwapCreated);
		assert!(seen.contains(&SwapStatus::TransactionMempool));
		assert!(seen.contains(&SwapStatus::TransactionConfirmed));
		assert!(seen.contains(&SwapStatus::InvoicePaid));
		assert!(seen.contains(&SwapStatus::TransactionClaimPending));

		let read = harness.store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.paid_preimage, Some([1u8; 32]));

		// The fallback claim broadcasts a script-path spend.
		harness.engine.cooperative_claim_fallback(&swap.id).await;
		assert_eq!(harness.chain.broadcast.lock().unwrap().len(), 1);
		let read = harness.store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.status, SwapStatus::TransactionClaimed);
	}

	#[tokio::test]
	async fn test_underpaid_lockup_fails() {
		let harness = harness();
		let swap = insert_swap(&harness, 1_000_000);
		let transaction = lockup_tx(500_000);
		let txid = transaction.compute_txid();

		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 500_000, false)
			.await
			.unwrap();
		settle_payments().await;

		let read = harness.store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.status, SwapStatus::TransactionLockupFailed);
		assert!(harness.lightning.payments.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_zero_conf_within_limits_pays_before_confirmation() {
		let harness = harness();
		let swap = insert_swap(&harness, 50_000);
		// Fund the lockup from a confirmed parent so the ancestor check
		// passes and a fee can be computed.
		let parent = lockup_tx(60_000);
		harness.chain.insert_transaction(parent.clone(), 6);
		let mut transaction = lockup_tx(50_000);
		transaction.input[0].previous_output =
			OutPoint { txid: parent.compute_txid(), vout: 0 };
		let txid = transaction.compute_txid();

		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 50_000, false)
			.await
			.unwrap();
		settle_payments().await;

		assert_eq!(harness.lightning.payments.lock().unwrap().len(), 1);
		let read = harness.store.get_swap(&swap.id).unwrap().unwrap();
		assert!(read.accept_zero_conf);
		assert_eq!(read.status, SwapStatus::TransactionClaimPending);
	}

	#[tokio::test]
	async fn test_rbf_lockup_waits_for_confirmation() {
		let harness = harness();
		let swap = insert_swap(&harness, 50_000);
		let mut transaction = lockup_tx(50_000);
		transaction.input[0].sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;
		let txid = transaction.compute_txid();

		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 50_000, false)
			.await
			.unwrap();
		settle_payments().await;

		assert!(harness.lightning.payments.lock().unwrap().is_empty());
		let read = harness.store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.status, SwapStatus::TransactionMempool);
		assert!(!read.accept_zero_conf);
	}

	#[tokio::test]
	async fn test_terminal_payment_failure_flags_invoice() {
		let harness = harness();
		harness.lightning.pay_results.lock().unwrap().push_back(Err(LightningError::NoRoute {
			reason: "no path found".to_string(),
		}));
		let swap = insert_swap(&harness, 1_000_000);
		let transaction = lockup_tx(1_000_000);
		let txid = transaction.compute_txid();

		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 1_000_000, false)
			.await
			.unwrap();
		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 1_000_000, true)
			.await
			.unwrap();
		settle_payments().await;

		let read = harness.store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.status, SwapStatus::InvoiceFailedToPay);
	}

	#[tokio::test]
	async fn test_transient_failures_are_retried() {
		let harness = harness();
		{
			let mut results = harness.lightning.pay_results.lock().unwrap();
			results.push_back(Err(LightningError::Rpc { reason: "unavailable".to_string() }));
			results.push_back(Err(LightningError::PaymentTimedOut));
		}
		let swap = insert_swap(&harness, 1_000_000);
		let transaction = lockup_tx(1_000_000);
		let txid = transaction.compute_txid();

		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 1_000_000, true)
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;

		assert_eq!(harness.lightning.payments.lock().unwrap().len(), 3);
		let read = harness.store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.status, SwapStatus::TransactionClaimPending);
	}

	#[tokio::test]
	async fn test_reorg_rolls_back_to_mempool() {
		let harness = harness();
		let swap = insert_swap(&harness, 1_000_000);
		let transaction = lockup_tx(1_000_000);
		let txid = transaction.compute_txid();

		// Hand the swap a channel creation so the payment is deferred to the
		// nursery and the status stays at TransactionConfirmed.
		harness
			.store
			.set_channel_creation(&crate::swap::ChannelCreation {
				swap_id: swap.id.clone(),
				node_public_key: swap.refund_public_key,
				private: false,
				inbound_liquidity_percent: 25,
				funding_txid: None,
				funding_vout: None,
				status: crate::swap::ChannelCreationStatus::Attempted,
			})
			.unwrap();

		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 1_000_000, true)
			.await
			.unwrap();
		assert_eq!(
			harness.store.get_swap(&swap.id).unwrap().unwrap().status,
			SwapStatus::TransactionConfirmed
		);

		harness.engine.on_output_retracted(&swap.id).await.unwrap();
		assert_eq!(
			harness.store.get_swap(&swap.id).unwrap().unwrap().status,
			SwapStatus::TransactionMempool
		);
	}

	#[tokio::test]
	async fn test_expiry_cancels_pending_payment() {
		let harness = harness();
		let swap = insert_swap(&harness, 1_000_000);
		harness
			.store
			.set_status(
				SwapType::Submarine,
				SwapUpdate::new(&swap.id, SwapStatus::TransactionMempool),
			)
			.unwrap();
		harness
			.store
			.set_status(
				SwapType::Submarine,
				SwapUpdate::new(&swap.id, SwapStatus::InvoicePending),
			)
			.unwrap();

		harness.engine.on_expiry(&swap.id).await.unwrap();

		assert_eq!(
			harness.store.get_swap(&swap.id).unwrap().unwrap().status,
			SwapStatus::SwapExpired
		);
		assert_eq!(
			harness.lightning.cancelled_payments.lock().unwrap().as_slice(),
			&[swap.preimage_hash]
		);
	}

	#[tokio::test]
	async fn test_expiry_does_not_touch_paid_swaps() {
		let harness = harness();
		let swap = insert_swap(&harness, 1_000_000);
		let transaction = lockup_tx(1_000_000);
		let txid = transaction.compute_txid();
		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 1_000_000, true)
			.await
			.unwrap();
		settle_payments().await;

		harness.engine.on_expiry(&swap.id).await.unwrap();
		let read = harness.store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.status, SwapStatus::TransactionClaimPending);
	}

	#[tokio::test]
	async fn test_channel_swaps_are_handed_to_the_nursery() {
		let mut harness = harness();
		let swap = insert_swap(&harness, 1_000_000);
		harness
			.store
			.set_channel_creation(&crate::swap::ChannelCreation {
				swap_id: swap.id.clone(),
				node_public_key: swap.refund_public_key,
				private: true,
				inbound_liquidity_percent: 25,
				funding_txid: None,
				funding_vout: None,
				status: crate::swap::ChannelCreationStatus::Attempted,
			})
			.unwrap();

		let transaction = lockup_tx(1_000_000);
		let txid = transaction.compute_txid();
		harness
			.engine
			.on_output_found(&swap.id, &transaction, txid, 0, 1_000_000, true)
			.await
			.unwrap();
		settle_payments().await;

		// No direct payment; the nursery got the event instead.
		assert!(harness.lightning.payments.lock().unwrap().is_empty());
		match harness.nursery_events.try_recv().unwrap() {
			NurseryEvent::LockupEligible { swap_id } => assert_eq!(swap_id, swap.id),
			other => panic!("unexpected nursery event {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_mempool_eviction_grace() {
		let harness = harness();
		let swap = insert_swap(&harness, 1_000_000);
		// RBF lockup: held in mempool, not paid.
		let mut rbf_transaction = lockup_tx(1_000_000);
		rbf_transaction.input[0].sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;
		let txid = rbf_transaction.compute_txid();
		harness
			.engine
			.on_output_found(&swap.id, &rbf_transaction, txid, 0, 1_000_000, false)
			.await
			.unwrap();

		// The node never learned about the transaction; the swap only fails
		// once the grace period is over.
		let grace = SubmarineConfig::default().mempool_eviction_grace_blocks;
		for _ in 0..grace {
			harness.engine.on_block("BTC").await.unwrap();
			assert_eq!(
				harness.store.get_swap(&swap.id).unwrap().unwrap().status,
				SwapStatus::TransactionMempool
			);
		}
		harness.engine.on_block("BTC").await.unwrap();
		assert_eq!(
			harness.store.get_swap(&swap.id).unwrap().unwrap().status,
			SwapStatus::TransactionLockupFailed
		);
	}
}
