// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Invoice descriptors and routing hints for reverse swaps.
//!
//! Hold invoices issued for reverse swaps carry a synthetic routing hint
//! towards a well-known channel-id so wallets treat the service as a routing
//! hop. The hint is only emitted for BOLT11; BOLT12 offers carry their own
//! payee identity, which is instead used to verify client address
//! signatures.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{schnorr, Message, PublicKey, VerifyOnly};
use bitcoin::Amount;
use bitcoin::Denomination;
use thiserror::Error;

use crate::lightning::{decode_offer, LightningError, RoutingHint};

/// Funding coordinates of the well-known synthetic channel.
pub const SYNTHETIC_CHANNEL_BLOCK: u32 = 542_409;
pub const SYNTHETIC_CHANNEL_TX: u32 = 1_308;
pub const SYNTHETIC_CHANNEL_VOUT: u16 = 0;

const SYNTHETIC_HINT_FEE_BASE_MSAT: u32 = 0;
const SYNTHETIC_HINT_FEE_PPM: u32 = 21;
const SYNTHETIC_HINT_CLTV_DELTA: u16 = 81;

#[derive(Debug, Error)]
pub enum HintsError {
	#[error("description hash must be exactly 32 bytes")]
	DescriptionHashLength,
	#[error("invalid address signature")]
	InvalidAddressSignature,
	#[error("invalid signature encoding")]
	InvalidSignatureEncoding,
	#[error(transparent)]
	Invoice(#[from] LightningError),
}

/// Packs (block, tx index, output index) into a short channel id.
pub fn pack_short_channel_id(block: u32, tx: u32, vout: u16) -> u64 {
	((block as u64) << 40) | ((tx as u64) << 16) | vout as u64
}

/// Inverse of [`pack_short_channel_id`].
pub fn unpack_short_channel_id(short_channel_id: u64) -> (u32, u32, u16) {
	(
		(short_channel_id >> 40) as u32,
		((short_channel_id >> 16) & 0xff_ffff) as u32,
		(short_channel_id & 0xffff) as u16,
	)
}

/// What the hold invoice of a reverse swap should carry.
#[derive(Debug, Clone)]
pub struct InvoiceDescriptor {
	pub memo: String,
	pub description_hash: Option<[u8; 32]>,
	pub routing_hints: Vec<RoutingHint>,
}

pub struct RoutingHintsEngine {
	secp: Secp256k1<VerifyOnly>,
	node_public_key: PublicKey,
}

impl RoutingHintsEngine {
	pub fn new(node_public_key: PublicKey) -> Self {
		Self { secp: Secp256k1::verification_only(), node_public_key }
	}

	/// The synthetic last-hop hint embedded into BOLT11 hold invoices.
	pub fn synthetic_hint(&self) -> RoutingHint {
		RoutingHint {
			src_node_id: self.node_public_key,
			short_channel_id: pack_short_channel_id(
				SYNTHETIC_CHANNEL_BLOCK,
				SYNTHETIC_CHANNEL_TX,
				SYNTHETIC_CHANNEL_VOUT,
			),
			fee_base_msat: SYNTHETIC_HINT_FEE_BASE_MSAT,
			fee_proportional_millionths: SYNTHETIC_HINT_FEE_PPM,
			cltv_expiry_delta: SYNTHETIC_HINT_CLTV_DELTA,
		}
	}

	/// Descriptor for a BOLT11 hold invoice.
	pub fn bolt11_descriptor(
		&self, sending_symbol: &str, description_hash: Option<&[u8]>,
	) -> Result<InvoiceDescriptor, HintsError> {
		let description_hash = description_hash.map(check_description_hash).transpose()?;
		Ok(InvoiceDescriptor {
			memo: invoice_memo(sending_symbol),
			description_hash,
			routing_hints: vec![self.synthetic_hint()],
		})
	}

	/// Descriptor derived from a decoded BOLT12 offer. No routing hint is
	/// produced; when a refund address signature is supplied it must verify
	/// against the offer's signing key.
	pub fn bolt12_descriptor(
		&self, offer: &str, address_signature: Option<(&str, &[u8])>,
	) -> Result<InvoiceDescriptor, HintsError> {
		let decoded = decode_offer(offer)?;
		if let Some((address, signature)) = address_signature {
			let payee = PublicKey::from_slice(&decoded.signing_pubkey)
				.map_err(|_| HintsError::InvalidAddressSignature)?;
			self.verify_address_signature(address, signature, &payee)?;
		}
		Ok(InvoiceDescriptor {
			memo: decoded.description,
			description_hash: None,
			routing_hints: Vec::new(),
		})
	}

	/// Verifies a Schnorr signature over SHA256 of the address string by the
	/// given key.
	pub fn verify_address_signature(
		&self, address: &str, signature: &[u8], public_key: &PublicKey,
	) -> Result<(), HintsError> {
		let signature = schnorr::Signature::from_slice(signature)
			.map_err(|_| HintsError::InvalidSignatureEncoding)?;
		let digest = sha256::Hash::hash(address.as_bytes()).to_byte_array();
		let message = Message::from_digest(digest);
		self.secp
			.verify_schnorr(&signature, &message, &public_key.x_only_public_key().0)
			.map_err(|_| HintsError::InvalidAddressSignature)
	}

	/// BIP21 parameters for the user's refund address, emitted only after
	/// the signature over the address verified against the client's claim
	/// key.
	pub fn bip21_params(
		&self, address: &str, signature: &[u8], claim_public_key: &PublicKey, amount_sat: u64,
	) -> Result<String, HintsError> {
		self.verify_address_signature(address, signature, claim_public_key)?;
		Ok(format!(
			"bitcoin:{}?amount={}",
			address,
			Amount::from_sat(amount_sat).to_string_in(Denomination::Bitcoin)
		))
	}
}

/// Memo of a reverse swap hold invoice.
pub fn invoice_memo(sending_symbol: &str) -> String {
	format!("Send to {} address", sending_symbol)
}

/// What the claimant receives: the locked amount minus the miner fee of the
/// claim transaction.
pub fn received_amount(onchain_amount_sat: u64, claim_miner_fee_sat: u64) -> u64 {
	onchain_amount_sat.saturating_sub(claim_miner_fee_sat)
}

/// Description hashes must be exactly 32 bytes.
pub fn check_description_hash(hash: &[u8]) -> Result<[u8; 32], HintsError> {
	hash.try_into().map_err(|_| HintsError::DescriptionHashLength)
}
