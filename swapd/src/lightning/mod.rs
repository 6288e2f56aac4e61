// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Lightning backend seam. The engines are agnostic to the node
//! implementation behind [`LightningClient`]; the adapter additionally feeds
//! typed [`LightningEvent`]s into the daemon's event loop.

use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;
use lightning::offers::offer::Offer;
use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescription};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LightningError {
	#[error("failed to connect to Lightning node")]
	FailedToConnect,
	#[error("failed to create invoice: {reason}")]
	InvoiceCreation { reason: String },
	#[error("invalid invoice: {reason}")]
	InvalidInvoice { reason: String },
	#[error("no route to destination: {reason}")]
	NoRoute { reason: String },
	#[error("invoice already expired")]
	InvoiceExpired,
	#[error("payment failed: {reason}")]
	PaymentFailed { reason: String },
	#[error("payment timed out")]
	PaymentTimedOut,
	#[error("failed to settle invoice: {reason}")]
	SettleFailed { reason: String },
	#[error("failed to cancel invoice: {reason}")]
	CancelFailed { reason: String },
	#[error("failed to connect to peer: {reason}")]
	ConnectPeerFailed { reason: String },
	#[error("failed to open channel: {reason}")]
	OpenChannelFailed { reason: String },
	#[error("lightning RPC failed: {reason}")]
	Rpc { reason: String },
}

impl LightningError {
	/// Terminal payment failures flip a submarine swap to
	/// `InvoiceFailedToPay`; everything else is retried with backoff.
	pub fn is_terminal_payment_failure(&self) -> bool {
		matches!(
			self,
			LightningError::NoRoute { .. }
				| LightningError::InvoiceExpired
				| LightningError::PaymentFailed { .. }
		)
	}
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
	pub public_key: PublicKey,
	pub block_height: u32,
	pub synced_to_chain: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
	pub remote_pubkey: PublicKey,
	pub short_channel_id: u64,
	pub funding_txid: Txid,
	pub funding_vout: u32,
	pub capacity_sat: u64,
	pub local_balance_sat: u64,
	pub active: bool,
	pub private: bool,
}

/// Funding outpoint as reported by the node; the txid arrives in the
/// node's internal byte order, base64 encoded.
#[derive(Debug, Clone)]
pub struct OpenChannelResponse {
	pub funding_txid_base64: String,
	pub output_index: u32,
}

/// A single hop hint embedded into a BOLT11 invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHint {
	pub src_node_id: PublicKey,
	pub short_channel_id: u64,
	pub fee_base_msat: u32,
	pub fee_proportional_millionths: u32,
	pub cltv_expiry_delta: u16,
}

#[derive(Debug, Clone)]
pub struct HoldInvoiceRequest {
	pub preimage_hash: [u8; 32],
	pub amount_msat: u64,
	pub memo: String,
	pub description_hash: Option<[u8; 32]>,
	pub expiry_secs: u64,
	pub routing_hints: Vec<RoutingHint>,
}

#[derive(Debug, Clone)]
pub struct PayInvoiceRequest {
	pub invoice: String,
	/// Maximum routing fee as parts-per-million of the amount.
	pub max_fee_ppm: u64,
	/// Restrict the first hop to this channel, e.g. one just opened by the
	/// nursery.
	pub outgoing_channel_id: Option<u64>,
	pub timeout_secs: u64,
}

/// Interface of the Lightning node the daemon orchestrates. Grounded on a
/// hold-invoice capable backend; all operations are idempotent on the node
/// side.
#[async_trait]
pub trait LightningClient: Send + Sync {
	async fn get_info(&self) -> Result<NodeInfo, LightningError>;

	/// Registers a hold invoice and returns the BOLT11 payment request.
	async fn add_hold_invoice(&self, request: HoldInvoiceRequest)
		-> Result<String, LightningError>;

	async fn settle_hold_invoice(&self, preimage: [u8; 32]) -> Result<(), LightningError>;

	async fn cancel_hold_invoice(&self, preimage_hash: [u8; 32]) -> Result<(), LightningError>;

	/// Pays a BOLT11 invoice and returns the preimage.
	async fn pay_invoice(&self, request: PayInvoiceRequest) -> Result<[u8; 32], LightningError>;

	/// Aborts an in-flight payment attempt for the given hash, if any.
	async fn cancel_payment(&self, payment_hash: [u8; 32]) -> Result<(), LightningError>;

	/// Pays a BOLT12 offer for the given amount and returns the preimage.
	async fn pay_offer(&self, offer: &str, amount_msat: u64) -> Result<[u8; 32], LightningError>;

	async fn connect_peer(
		&self, public_key: &PublicKey, address_hints: &[String],
	) -> Result<(), LightningError>;

	async fn open_channel(
		&self, public_key: &PublicKey, local_funding_sat: u64, private: bool,
		sat_per_vbyte: u64,
	) -> Result<OpenChannelResponse, LightningError>;

	async fn list_channels(&self) -> Result<Vec<ChannelInfo>, LightningError>;

	async fn list_peers(&self) -> Result<Vec<PublicKey>, LightningError>;

	/// Whether the node has a pending outgoing HTLC for the given hash;
	/// consulted by the refund policy gate.
	async fn has_pending_payment(&self, payment_hash: [u8; 32])
		-> Result<bool, LightningError>;
}

/// Events pushed by the node adapter into the daemon loop.
#[derive(Debug, Clone)]
pub enum LightningEvent {
	InvoiceAccepted { preimage_hash: [u8; 32] },
	InvoiceSettled { preimage_hash: [u8; 32] },
	InvoiceCancelled { preimage_hash: [u8; 32] },
	PeerOnline { public_key: PublicKey },
	ChannelActive { funding_txid: Txid, funding_vout: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceDescription {
	Direct(String),
	Hash([u8; 32]),
}

/// Version-agnostic view of a decoded BOLT11 invoice.
#[derive(Debug, Clone)]
pub struct DecodedInvoice {
	pub payment_hash: [u8; 32],
	pub amount_msat: Option<u64>,
	pub description: InvoiceDescription,
	pub payee_pubkey: [u8; 33],
	pub min_final_cltv_expiry_delta: u64,
	pub is_expired: bool,
}

pub fn decode_invoice(invoice: &str) -> Result<DecodedInvoice, LightningError> {
	let parsed = Bolt11Invoice::from_str(invoice)
		.map_err(|e| LightningError::InvalidInvoice { reason: e.to_string() })?;

	let description = match parsed.description() {
		Bolt11InvoiceDescription::Direct(description) => {
			InvoiceDescription::Direct(description.to_string())
		},
		Bolt11InvoiceDescription::Hash(hash) => {
			InvoiceDescription::Hash(hash.0.to_byte_array())
		},
	};

	Ok(DecodedInvoice {
		payment_hash: parsed.payment_hash().to_byte_array(),
		amount_msat: parsed.amount_milli_satoshis(),
		description,
		payee_pubkey: parsed.recover_payee_pub_key().serialize(),
		min_final_cltv_expiry_delta: parsed.min_final_cltv_expiry_delta(),
		is_expired: parsed.is_expired(),
	})
}

/// Version-agnostic view of a decoded BOLT12 offer.
#[derive(Debug, Clone)]
pub struct DecodedOffer {
	pub description: String,
	pub signing_pubkey: [u8; 33],
}

pub fn decode_offer(offer: &str) -> Result<DecodedOffer, LightningError> {
	let parsed = Offer::from_str(offer)
		.map_err(|e| LightningError::InvalidInvoice { reason: format!("{:?}", e) })?;

	Ok(DecodedOffer {
		description: parsed.description().to_string(),
		signing_pubkey: parsed.signing_pubkey().serialize(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_terminal_payment_failures() {
		assert!(LightningError::NoRoute { reason: "no path".to_string() }
			.is_terminal_payment_failure());
		assert!(LightningError::InvoiceExpired.is_terminal_payment_failure());
		assert!(LightningError::PaymentFailed { reason: "incorrect details".to_string() }
			.is_terminal_payment_failure());
		assert!(!LightningError::PaymentTimedOut.is_terminal_payment_failure());
		assert!(!LightningError::Rpc { reason: "unavailable".to_string() }
			.is_terminal_payment_failure());
	}

	#[test]
	fn test_decode_rejects_garbage() {
		assert!(decode_invoice("lnbcrt1notaninvoice").is_err());
		assert!(decode_offer("lno1notanoffer").is_err());
	}
}
