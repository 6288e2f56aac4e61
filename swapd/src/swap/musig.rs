// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Cooperative musig2 signing of taproot HTLC spends.
//!
//! Sessions are single-round: the client sends its public nonce together
//! with the spending transaction, the service answers with its own nonce and
//! a partial signature over the key-path sighash. Nonces are generated fresh
//! from OS randomness on every call and nothing is persisted per session.
//!
//! Policy gates:
//! - a submarine refund is only signed while the swap cannot complete
//!   anymore (or its invoice was never paid and no outgoing HTLC is in
//!   flight), otherwise a malicious client could race the service out of its
//!   claim;
//! - a reverse claim is only signed for the correct preimage while the hold
//!   invoice is held, and releasing the signature settles the invoice.

use std::sync::Arc;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::{Keypair, Secp256k1};
use bitcoin::secp256k1::All;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{Amount, Network, Transaction, TxOut};
use log::{error, info, warn};
use musig2::{AggNonce, PartialSignature, PubNonce, SecNonce};
use rand::RngCore;
use thiserror::Error;

use crate::io::persist::{StoreError, SwapStore};
use crate::lightning::{LightningClient, LightningError};
use crate::swap::htlc::{key_agg_context, HtlcError, SwapTree};
use crate::swap::status::{SwapStatus, SwapUpdate};
use crate::swap::{chain_currency, split_pair, SwapType};
use crate::util::key_provider::{KeyProvider, KeyProviderError};

#[derive(Debug, Error)]
pub enum SignerError {
	#[error("swap {0} not found")]
	SwapNotFound(String),
	#[error("swap is not eligible for a refund")]
	NotEligibleForRefund,
	#[error("preimage does not match the swap hash")]
	PreimageMismatch,
	#[error("hold invoice is not in accepted state")]
	InvoiceNotAccepted,
	#[error("invalid transaction: {0}")]
	InvalidTransaction(String),
	#[error("signing session failed: {0}")]
	Session(String),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Lightning(#[from] LightningError),
	#[error(transparent)]
	Htlc(#[from] HtlcError),
	#[error(transparent)]
	Keys(#[from] KeyProviderError),
}

/// The service's half of a cooperative session.
#[derive(Debug, Clone)]
pub struct PartialSigResponse {
	pub pub_nonce: [u8; 66],
	pub partial_signature: [u8; 32],
}

pub struct CooperativeSigner {
	secp: Secp256k1<All>,
	network: Network,
	store: Arc<SwapStore>,
	lightning: Arc<dyn LightningClient>,
	keys: Arc<KeyProvider>,
}

impl CooperativeSigner {
	pub fn new(
		network: Network, store: Arc<SwapStore>, lightning: Arc<dyn LightningClient>,
		keys: Arc<KeyProvider>,
	) -> Self {
		Self { secp: Secp256k1::new(), network, store, lightning, keys }
	}

	/// Signs the refund of a submarine swap lockup.
	pub async fn sign_swap_refund(
		&self, swap_id: &str, client_pub_nonce: [u8; 66], transaction: Transaction,
		input_index: usize,
	) -> Result<PartialSigResponse, SignerError> {
		let swap = self
			.store
			.get_swap(swap_id)?
			.ok_or_else(|| SignerError::SwapNotFound(swap_id.to_string()))?;

		let failed = matches!(
			swap.status,
			SwapStatus::SwapExpired
				| SwapStatus::InvoiceFailedToPay
				| SwapStatus::TransactionLockupFailed
		);
		if !failed {
			// Still in flight: refunds are only safe while the invoice was
			// never paid and no outgoing HTLC could still deliver the
			// preimage.
			if swap.paid_preimage.is_some()
				|| self.lightning.has_pending_payment(swap.preimage_hash).await?
			{
				warn!("Rejecting refund signature for swap {}: not eligible", swap.id);
				return Err(SignerError::NotEligibleForRefund);
			}
		}

		let amount_sat = swap
			.onchain_amount_sat
			.ok_or_else(|| SignerError::InvalidTransaction("no lockup recorded".to_string()))?;

		let (base, quote) = split_pair(&swap.pair)
			.ok_or_else(|| SignerError::InvalidTransaction("malformed pair".to_string()))?;
		let symbol = chain_currency(base, quote, swap.order_side, SwapType::Submarine);
		let keypair = self.keys.keypair(&symbol, swap.claim_key_index)?;

		let tree = SwapTree::from_parts(
			&swap.claim_leaf_hex,
			&swap.refund_leaf_hex,
			&swap.claim_public_key,
			&swap.refund_public_key,
		)?;

		let response = self.sign_key_spend(
			&tree,
			&keypair,
			amount_sat,
			client_pub_nonce,
			&transaction,
			input_index,
		)?;
		info!("Signed cooperative refund for swap {}", swap.id);

		// With the signature out, the refund is in the client's hands; a
		// failed swap has nothing left to wait for.
		if failed && swap.status != SwapStatus::SwapExpired {
			if let Err(e) = self.store.set_status(
				SwapType::Submarine,
				SwapUpdate::new(&swap.id, SwapStatus::SwapExpired)
					.with_failure_reason("refunded cooperatively"),
			) {
				error!("Failed to expire refunded swap {}: {}", swap.id, e);
			}
		}
		Ok(response)
	}

	/// Signs the claim of a reverse swap lockup and settles the held invoice
	/// before the signature is released.
	pub async fn sign_reverse_swap_claim(
		&self, swap_id: &str, preimage: [u8; 32], client_pub_nonce: [u8; 66],
		transaction: Transaction, input_index: usize,
	) -> Result<PartialSigResponse, SignerError> {
		let swap = self
			.store
			.get_reverse_swap(swap_id)?
			.ok_or_else(|| SignerError::SwapNotFound(swap_id.to_string()))?;

		if sha256::Hash::hash(&preimage).to_byte_array() != swap.preimage_hash {
			error!("Preimage mismatch in cooperative claim for reverse swap {}", swap.id);
			return Err(SignerError::PreimageMismatch);
		}

		// The lockup is only ever broadcast while the inbound HTLC is held,
		// so any status before the lockup means the invoice is not accepted.
		if !matches!(
			swap.status,
			SwapStatus::TransactionMempool | SwapStatus::TransactionConfirmed
		) {
			return Err(SignerError::InvoiceNotAccepted);
		}

		let (base, quote) = split_pair(&swap.pair)
			.ok_or_else(|| SignerError::InvalidTransaction("malformed pair".to_string()))?;
		let symbol = chain_currency(base, quote, swap.order_side, SwapType::Reverse);
		let keypair = self.keys.keypair(&symbol, swap.refund_key_index)?;

		let tree = SwapTree::from_parts(
			&swap.claim_leaf_hex,
			&swap.refund_leaf_hex,
			&swap.claim_public_key,
			&swap.refund_public_key,
		)?;

		// The sighash binds the preimage holder's claim output; computing
		// the signature before settling means a settle failure never leaks
		// a partial signature for an unsettled invoice.
		let response = self.sign_key_spend(
			&tree,
			&keypair,
			swap.onchain_amount_sat,
			client_pub_nonce,
			&transaction,
			input_index,
		)?;

		self.lightning.settle_hold_invoice(preimage).await?;
		info!("Settled hold invoice of reverse swap {} via cooperative claim", swap.id);

		if let Err(e) = self.store.set_preimage(SwapType::Reverse, &swap.id, preimage) {
			error!("Failed to persist preimage of reverse swap {}: {}", swap.id, e);
		}
		if let Err(e) = self.store.set_status(
			SwapType::Reverse,
			SwapUpdate::new(&swap.id, SwapStatus::TransactionClaimed),
		) {
			error!("Failed to mark reverse swap {} as claimed: {}", swap.id, e);
		}

		Ok(response)
	}

	/// One round of musig2 over the taproot key-path sighash of
	/// `transaction[input_index]` spending the HTLC output.
	fn sign_key_spend(
		&self, tree: &SwapTree, keypair: &Keypair, prevout_amount_sat: u64,
		client_pub_nonce: [u8; 66], transaction: &Transaction, input_index: usize,
	) -> Result<PartialSigResponse, SignerError> {
		if transaction.input.len() != 1 || input_index != 0 {
			return Err(SignerError::InvalidTransaction(
				"expected a single-input spend of the lockup".to_string(),
			));
		}

		let spend_info = tree.spend_info(&self.secp)?;
		let merkle_root = spend_info
			.merkle_root()
			.ok_or_else(|| SignerError::Session("missing merkle root".to_string()))?;

		let prevout = TxOut {
			value: Amount::from_sat(prevout_amount_sat),
			script_pubkey: tree.script_pubkey(&self.secp, self.network)?,
		};
		let mut cache = SighashCache::new(transaction);
		let sighash = cache
			.taproot_key_spend_signature_hash(
				input_index,
				&Prevouts::All(&[prevout]),
				TapSighashType::Default,
			)
			.map_err(|e| SignerError::InvalidTransaction(e.to_string()))?;
		let message = sighash.to_byte_array();

		let key_agg_ctx = key_agg_context(&tree.claim_pubkey, &tree.refund_pubkey)?;
		let key_agg_ctx = key_agg_ctx
			.with_taproot_tweak(&merkle_root.to_byte_array())
			.map_err(|e| SignerError::Session(e.to_string()))?;

		let seckey = musig2::secp::Scalar::from_slice(&keypair.secret_key().secret_bytes())
			.map_err(|_| SignerError::Session("invalid secret key".to_string()))?;

		let mut nonce_seed = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut nonce_seed);
		let secnonce = SecNonce::build(nonce_seed)
			.with_seckey(seckey)
			.with_message(&message)
			.build();
		let our_pub_nonce = secnonce.public_nonce();

		let client_nonce = PubNonce::from_bytes(&client_pub_nonce)
			.map_err(|e| SignerError::Session(e.to_string()))?;
		let agg_nonce = AggNonce::sum([client_nonce, our_pub_nonce.clone()]);

		let partial: PartialSignature =
			musig2::sign_partial(&key_agg_ctx, seckey, secnonce, &agg_nonce, message)
				.map_err(|e| SignerError::Session(e.to_string()))?;

		Ok(PartialSigResponse {
			pub_nonce: our_pub_nonce.serialize(),
			partial_signature: partial.serialize(),
		})
	}
}
