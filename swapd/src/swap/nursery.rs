// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel nursery: for submarine swaps that requested "open a channel
//! on arrival", it connects to the payee, opens the channel once the lockup
//! is eligible, waits for the channel to become active and then settles the
//! invoice through it.
//!
//! The nursery is the sole consumer of the global peer/channel events; the
//! submarine engine and the node adapter enqueue [`NurseryEvent`]s instead
//! of calling into it. Settlement runs under a global single-flight lock so
//! concurrent retries cannot double-pay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::chain::ChainClient;
use crate::io::persist::SwapStore;
use crate::lightning::{decode_invoice, LightningClient, LightningError, PayInvoiceRequest};
use crate::swap::status::{SwapStatus, SwapUpdate};
use crate::swap::submarine::SubmarineEngine;
use crate::swap::{ChannelCreationStatus, SwapError, SwapLocks, SwapType};

/// Events consumed by the nursery's run loop.
#[derive(Debug, Clone)]
pub enum NurseryEvent {
	/// The submarine lockup became reliable; open the channel now.
	LockupEligible { swap_id: String },
	PeerOnline { public_key: PublicKey },
	ChannelActive { funding_txid: Txid, funding_vout: u32 },
	SwapExpired { swap_id: String },
	/// The invoice was paid through another route.
	InvoicePaid { swap_id: String },
}

#[derive(Debug, Clone)]
pub struct NurseryConfig {
	pub base_retry: Duration,
	pub max_open_attempts: u32,
	/// Extra funding on top of the invoice amount so the new channel can
	/// carry the payment and its fees.
	pub funding_fee_buffer_sat: u64,
	pub max_routing_fee_ppm: u64,
	pub payment_timeout_secs: u64,
}

impl Default for NurseryConfig {
	fn default() -> Self {
		Self {
			base_retry: Duration::from_secs(15),
			max_open_attempts: 10,
			funding_fee_buffer_sat: 10_000,
			max_routing_fee_ppm: 10_000,
			payment_timeout_secs: 60,
		}
	}
}

/// Maximum value of the doubling retry counter; reaching it abandons the
/// channel creation (four settle attempts total).
const MAX_SETTLE_COUNTER: u32 = 4;

pub struct ChannelNursery {
	store: Arc<SwapStore>,
	lightning: Arc<dyn LightningClient>,
	chain: Arc<dyn ChainClient>,
	submarine: Arc<SubmarineEngine>,
	locks: Arc<SwapLocks>,
	settle_lock: tokio::sync::Mutex<()>,
	settle_counters: Mutex<HashMap<String, u32>>,
	config: NurseryConfig,
}

impl ChannelNursery {
	pub fn new(
		store: Arc<SwapStore>, lightning: Arc<dyn LightningClient>,
		chain: Arc<dyn ChainClient>, submarine: Arc<SubmarineEngine>, locks: Arc<SwapLocks>,
		config: NurseryConfig,
	) -> Self {
		Self {
			store,
			lightning,
			chain,
			submarine,
			locks,
			settle_lock: tokio::sync::Mutex::new(()),
			settle_counters: Mutex::new(HashMap::new()),
			config,
		}
	}

	pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<NurseryEvent>) {
		while let Some(event) = events.recv().await {
			match event {
				NurseryEvent::LockupEligible { swap_id } => {
					if let Err(e) = self.open_channel_for_swap(&swap_id).await {
						error!("Channel open for swap {} failed: {}", swap_id, e);
					}
				},
				NurseryEvent::PeerOnline { public_key } => {
					self.on_peer_online(&public_key).await;
				},
				NurseryEvent::ChannelActive { funding_txid, funding_vout: _ } => {
					if let Err(e) = self.on_channel_active(&funding_txid).await {
						error!("Channel activation handling failed: {}", e);
					}
				},
				NurseryEvent::SwapExpired { swap_id }
				| NurseryEvent::InvoicePaid { swap_id } => {
					self.abandon(&swap_id).await;
				},
			}
		}
	}

	/// Restart sweep: channel creations whose open never produced a funding
	/// transaction.
	pub async fn retry_opening_channels(&self) {
		let creations = match self.store.channel_creations_by_status(ChannelCreationStatus::Attempted)
		{
			Ok(creations) => creations,
			Err(e) => {
				error!("Failed to list attempted channel creations: {}", e);
				return;
			},
		};
		for creation in creations {
			if creation.funding_txid.is_some() {
				continue;
			}
			let eligible = matches!(
				self.store.get_swap(&creation.swap_id).ok().flatten().map(|swap| swap.status),
				Some(
					SwapStatus::TransactionMempool
						| SwapStatus::TransactionConfirmed
						| SwapStatus::InvoicePending
				)
			);
			if !eligible {
				continue;
			}
			if let Err(e) = self.open_channel_for_swap(&creation.swap_id).await {
				error!("Retrying channel open for swap {} failed: {}", creation.swap_id, e);
			}
		}
	}

	/// Restart sweep: channels that are open but whose invoice was never
	/// settled.
	pub async fn settle_created_channels(&self) {
		let creations = match self.store.channel_creations_by_status(ChannelCreationStatus::Created)
		{
			Ok(creations) => creations,
			Err(e) => {
				error!("Failed to list created channels: {}", e);
				return;
			},
		};
		for creation in creations {
			let claimed = matches!(
				self.store.get_swap(&creation.swap_id).ok().flatten().map(|swap| swap.status),
				Some(SwapStatus::TransactionClaimed)
			);
			if claimed {
				continue;
			}
			if let Err(e) = self.settle_channel(&creation.swap_id).await {
				error!("Settling channel of swap {} failed: {}", creation.swap_id, e);
			}
		}
	}

	async fn open_channel_for_swap(&self, swap_id: &str) -> Result<(), SwapError> {
		let _guard = self.locks.lock(swap_id).await;
		let swap = self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		let creation = match self.store.get_channel_creation(swap_id)? {
			Some(creation) => creation,
			None => return Ok(()),
		};
		if creation.funding_txid.is_some()
			|| matches!(
				creation.status,
				ChannelCreationStatus::Settled | ChannelCreationStatus::Abandoned
			) {
			return Ok(());
		}

		// BOLT12 invoices do not decode as BOLT11; size the channel off the
		// expected lockup in that case.
		let invoice_amount_sat = decode_invoice(&swap.invoice)
			.ok()
			.and_then(|invoice| invoice.amount_msat)
			.map(|msat| msat / 1_000)
			.unwrap_or(swap.expected_amount_sat);
		let funding_sat = invoice_amount_sat
			+ invoice_amount_sat * creation.inbound_liquidity_percent as u64 / 100
			+ self.config.funding_fee_buffer_sat;
		let sat_per_vbyte = self.chain.estimate_fee_sat_vbyte().await.unwrap_or(2);

		self.connect_if_needed(&creation.node_public_key).await;

		let mut reconnected = false;
		for attempt in 1..=self.config.max_open_attempts {
			match self
				.lightning
				.open_channel(&creation.node_public_key, funding_sat, creation.private, sat_per_vbyte)
				.await
			{
				Ok(response) => {
					let funding_txid = funding_txid_from_base64(&response.funding_txid_base64)
						.map_err(|e| SwapError::InvalidInvoice(e))?;
					self.store
						.set_channel_status(swap_id, ChannelCreationStatus::Attempted)?;
					self.store.set_channel_funding(
						swap_id,
						&funding_txid,
						response.output_index,
					)?;
					self.set_swap_status(swap_id, SwapStatus::ChannelCreated);
					info!(
						"Opened channel for swap {} with funding {}:{}",
						swap_id, funding_txid, response.output_index
					);
					return Ok(());
				},
				Err(e) => {
					let reason = e.to_string();
					if reason.contains("wallet is fully synced")
						|| reason.contains("Synchronizing blockchain")
					{
						// The node is still syncing; linear backoff.
						warn!(
							"Channel open for swap {} deferred (node syncing), attempt {}",
							swap_id, attempt
						);
						sleep(self.config.base_retry).await;
						continue;
					}
					if reason.contains("is not online") && !reconnected {
						reconnected = true;
						self.connect_if_needed(&creation.node_public_key).await;
						continue;
					}
					error!("Channel open for swap {} failed terminally: {}", swap_id, reason);
					self.store.set_channel_status(swap_id, ChannelCreationStatus::Abandoned)?;
					// The invoice can still be paid over existing routes.
					self.submarine.spawn_payment(swap_id.to_string());
					return Ok(());
				},
			}
		}

		warn!("Channel open for swap {} gave up after node-sync retries", swap_id);
		Ok(())
	}

	async fn connect_if_needed(&self, public_key: &PublicKey) {
		let connected = match self.lightning.list_peers().await {
			Ok(peers) => peers.contains(public_key),
			Err(_) => false,
		};
		if !connected {
			if let Err(e) = self.lightning.connect_peer(public_key, &[]).await {
				warn!("Failed to connect to peer {}: {}", public_key, e);
			}
		}
	}

	async fn on_peer_online(&self, public_key: &PublicKey) {
		// A peer coming online may unblock a pending open.
		let creations = match self.store.channel_creations_by_status(ChannelCreationStatus::Attempted)
		{
			Ok(creations) => creations,
			Err(_) => return,
		};
		for creation in creations {
			if creation.node_public_key == *public_key && creation.funding_txid.is_none() {
				if let Err(e) = self.open_channel_for_swap(&creation.swap_id).await {
					error!("Channel open for swap {} failed: {}", creation.swap_id, e);
				}
			}
		}
	}

	async fn on_channel_active(&self, funding_txid: &Txid) -> Result<(), SwapError> {
		let creation = match self.store.channel_creation_by_funding(funding_txid)? {
			Some(creation) => creation,
			None => return Ok(()),
		};
		if creation.status == ChannelCreationStatus::Attempted {
			self.store.set_channel_status(&creation.swap_id, ChannelCreationStatus::Created)?;
			info!("Channel of swap {} is active", creation.swap_id);
		}
		self.settle_channel(&creation.swap_id).await
	}

	/// Pays the swap invoice through the freshly opened channel. Guarded by
	/// the global `channel_settle` lock; retried on a doubling schedule
	/// (1x, 2x, 4x of the base retry) and abandoned when the counter
	/// exceeds [`MAX_SETTLE_COUNTER`].
	pub async fn settle_channel(&self, swap_id: &str) -> Result<(), SwapError> {
		let _settle = self.settle_lock.lock().await;
		let swap = self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))?;
		let creation = match self.store.get_channel_creation(swap_id)? {
			Some(creation) => creation,
			None => return Ok(()),
		};
		match creation.status {
			ChannelCreationStatus::Settled | ChannelCreationStatus::Abandoned => return Ok(()),
			_ => {},
		}
		if matches!(
			swap.status,
			SwapStatus::InvoicePaid
				| SwapStatus::TransactionClaimPending
				| SwapStatus::TransactionClaimed
		) {
			// Paid while we were not looking; nothing left to settle.
			self.store.set_channel_status(swap_id, ChannelCreationStatus::Settled)?;
			return Ok(());
		}

		let outgoing_channel_id = self.channel_id_for(&creation.funding_txid).await;

		loop {
			let request = PayInvoiceRequest {
				invoice: swap.invoice.clone(),
				max_fee_ppm: self.config.max_routing_fee_ppm,
				outgoing_channel_id,
				timeout_secs: self.config.payment_timeout_secs,
			};
			match self.lightning.pay_invoice(request).await {
				Ok(preimage) => {
					self.store.set_channel_status(swap_id, ChannelCreationStatus::Settled)?;
					self.settle_counters.lock().unwrap().remove(swap_id);
					self.submarine.finish_invoice_paid(swap_id, preimage).await?;
					info!("Settled invoice of swap {} through its new channel", swap_id);
					return Ok(());
				},
				Err(LightningError::PaymentFailed { reason })
					if reason.contains("invoice is already paid") =>
				{
					self.store.set_channel_status(swap_id, ChannelCreationStatus::Settled)?;
					self.settle_counters.lock().unwrap().remove(swap_id);
					return Ok(());
				},
				Err(e) => {
					let counter = {
						let mut counters = self.settle_counters.lock().unwrap();
						let counter = counters.entry(swap_id.to_string()).or_insert(1);
						let current = *counter;
						*counter *= 2;
						current
					};
					if counter > MAX_SETTLE_COUNTER {
						warn!(
							"Giving up settling swap {} through its channel: {}",
							swap_id, e
						);
						self.store
							.set_channel_status(swap_id, ChannelCreationStatus::Abandoned)?;
						return Ok(());
					}
					warn!(
						"Settling swap {} failed ({}); retrying with counter {}",
						swap_id, e, counter
					);
					sleep(self.config.base_retry * counter).await;
				},
			}
		}
	}

	async fn channel_id_for(&self, funding_txid: &Option<Txid>) -> Option<u64> {
		let funding_txid = (*funding_txid)?;
		self.lightning
			.list_channels()
			.await
			.ok()?
			.into_iter()
			.find(|channel| channel.funding_txid == funding_txid)
			.map(|channel| channel.short_channel_id)
	}

	async fn abandon(&self, swap_id: &str) {
		if let Ok(Some(creation)) = self.store.get_channel_creation(swap_id) {
			if matches!(
				creation.status,
				ChannelCreationStatus::Attempted | ChannelCreationStatus::Created
			) {
				if let Err(e) =
					self.store.set_channel_status(swap_id, ChannelCreationStatus::Abandoned)
				{
					error!("Failed to abandon channel creation of swap {}: {}", swap_id, e);
				}
			}
		}
	}

	fn set_swap_status(&self, swap_id: &str, status: SwapStatus) {
		if let Err(e) =
			self.store.set_status(SwapType::Submarine, SwapUpdate::new(swap_id, status))
		{
			warn!("Failed to set status {} on swap {}: {}", status, swap_id, e);
		}
	}
}

/// Funding txids arrive from the node in internal byte order, base64
/// encoded; reinterpret as a display-order txid.
pub fn funding_txid_from_base64(encoded: &str) -> Result<Txid, String> {
	let bytes = BASE64.decode(encoded).map_err(|e| e.to_string())?;
	let bytes: [u8; 32] =
		bytes.try_into().map_err(|_| "funding txid must be 32 bytes".to_string())?;
	Ok(Txid::from_byte_array(bytes))
}
