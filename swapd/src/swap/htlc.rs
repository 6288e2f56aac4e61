// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Taproot HTLCs. The output commits to a claim leaf (preimage + claim key)
//! and a refund leaf (CLTV + refund key) under an internal key that is the
//! musig2 aggregate of both parties' keys, so cooperative spends stay
//! indistinguishable from ordinary key-path spends.

use bitcoin::key::Secp256k1;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CLTV, OP_DROP, OP_EQUALVERIFY, OP_SHA256};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{self, PublicKey, XOnlyPublicKey};
use bitcoin::taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo};
use bitcoin::{Address, Network, ScriptBuf};
use musig2::KeyAggContext;
use thiserror::Error;

/// Estimated virtual size of a script-path claim revealing the preimage.
pub const CLAIM_TX_VBYTES: u64 = 138;
/// Estimated virtual size of a cooperative key-path spend.
pub const COOPERATIVE_TX_VBYTES: u64 = 94;
/// Estimated virtual size of a script-path refund.
pub const REFUND_TX_VBYTES: u64 = 127;

#[derive(Debug, Error)]
pub enum HtlcError {
	#[error("key aggregation failed: {0}")]
	KeyAggregation(String),
	#[error("taproot construction failed")]
	TaprootBuild,
	#[error("invalid script: {0}")]
	InvalidScript(String),
}

/// The two tapscript leaves of a swap output plus the aggregated internal
/// key. Key order is always (claim, refund).
#[derive(Debug, Clone)]
pub struct SwapTree {
	pub claim_leaf: ScriptBuf,
	pub refund_leaf: ScriptBuf,
	pub claim_pubkey: PublicKey,
	pub refund_pubkey: PublicKey,
	pub internal_key: XOnlyPublicKey,
}

impl SwapTree {
	pub fn new(
		claim_pubkey: &PublicKey, refund_pubkey: &PublicKey, preimage_hash: &[u8; 32],
		timeout_block_height: u32,
	) -> Result<Self, HtlcError> {
		let claim_leaf = Builder::new()
			.push_opcode(OP_SHA256)
			.push_slice(preimage_hash)
			.push_opcode(OP_EQUALVERIFY)
			.push_x_only_key(&claim_pubkey.x_only_public_key().0)
			.push_opcode(OP_CHECKSIG)
			.into_script();

		let refund_leaf = Builder::new()
			.push_int(timeout_block_height as i64)
			.push_opcode(OP_CLTV)
			.push_opcode(OP_DROP)
			.push_x_only_key(&refund_pubkey.x_only_public_key().0)
			.push_opcode(OP_CHECKSIG)
			.into_script();

		Ok(Self {
			claim_leaf,
			refund_leaf,
			claim_pubkey: *claim_pubkey,
			refund_pubkey: *refund_pubkey,
			internal_key: aggregate_internal_key(claim_pubkey, refund_pubkey)?,
		})
	}

	/// Rebuilds a tree from persisted leaf scripts and the original keys.
	pub fn from_parts(
		claim_leaf_hex: &str, refund_leaf_hex: &str, claim_pubkey: &PublicKey,
		refund_pubkey: &PublicKey,
	) -> Result<Self, HtlcError> {
		Ok(Self {
			claim_leaf: ScriptBuf::from_hex(claim_leaf_hex)
				.map_err(|e| HtlcError::InvalidScript(e.to_string()))?,
			refund_leaf: ScriptBuf::from_hex(refund_leaf_hex)
				.map_err(|e| HtlcError::InvalidScript(e.to_string()))?,
			claim_pubkey: *claim_pubkey,
			refund_pubkey: *refund_pubkey,
			internal_key: aggregate_internal_key(claim_pubkey, refund_pubkey)?,
		})
	}

	pub fn spend_info<C: secp256k1::Verification>(
		&self, secp: &Secp256k1<C>,
	) -> Result<TaprootSpendInfo, HtlcError> {
		TaprootBuilder::new()
			.add_leaf(1, self.claim_leaf.clone())
			.and_then(|builder| builder.add_leaf(1, self.refund_leaf.clone()))
			.map_err(|_| HtlcError::TaprootBuild)?
			.finalize(secp, self.internal_key)
			.map_err(|_| HtlcError::TaprootBuild)
	}

	pub fn address<C: secp256k1::Verification>(
		&self, secp: &Secp256k1<C>, network: Network,
	) -> Result<Address, HtlcError> {
		let spend_info = self.spend_info(secp)?;
		Ok(Address::p2tr(secp, self.internal_key, spend_info.merkle_root(), network))
	}

	pub fn script_pubkey<C: secp256k1::Verification>(
		&self, secp: &Secp256k1<C>, network: Network,
	) -> Result<ScriptBuf, HtlcError> {
		Ok(self.address(secp, network)?.script_pubkey())
	}

	pub fn claim_control_block<C: secp256k1::Verification>(
		&self, secp: &Secp256k1<C>,
	) -> Result<ControlBlock, HtlcError> {
		self.spend_info(secp)?
			.control_block(&(self.claim_leaf.clone(), LeafVersion::TapScript))
			.ok_or(HtlcError::TaprootBuild)
	}

	pub fn refund_control_block<C: secp256k1::Verification>(
		&self, secp: &Secp256k1<C>,
	) -> Result<ControlBlock, HtlcError> {
		self.spend_info(secp)?
			.control_block(&(self.refund_leaf.clone(), LeafVersion::TapScript))
			.ok_or(HtlcError::TaprootBuild)
	}
}

/// Musig2 aggregate of (claim, refund); the same ordering is used when
/// signing cooperative spends.
pub fn aggregate_internal_key(
	claim_pubkey: &PublicKey, refund_pubkey: &PublicKey,
) -> Result<XOnlyPublicKey, HtlcError> {
	let ctx = key_agg_context(claim_pubkey, refund_pubkey)?;
	let aggregated: musig2::secp::Point = ctx.aggregated_pubkey();
	let serialized = aggregated.serialize();
	XOnlyPublicKey::from_slice(&serialized[1..])
		.map_err(|e| HtlcError::KeyAggregation(e.to_string()))
}

/// Untweaked key-aggregation context in (claim, refund) order.
pub fn key_agg_context(
	claim_pubkey: &PublicKey, refund_pubkey: &PublicKey,
) -> Result<KeyAggContext, HtlcError> {
	let points = [claim_pubkey, refund_pubkey]
		.iter()
		.map(|pk| {
			musig2::secp::Point::from_slice(&pk.serialize())
				.map_err(|_| HtlcError::KeyAggregation("invalid public key".to_string()))
		})
		.collect::<Result<Vec<_>, _>>()?;
	KeyAggContext::new(points).map_err(|e| HtlcError::KeyAggregation(e.to_string()))
}

#[cfg(test)]
mod tests {
	use bitcoin::hashes::{sha256, Hash};

	use super::*;

	fn test_keys() -> (PublicKey, PublicKey) {
		(
			"0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
				.parse()
				.unwrap(),
			"02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
				.parse()
				.unwrap(),
		)
	}

	#[test]
	fn test_tree_builds_taproot_address() {
		let secp = Secp256k1::new();
		let (claim, refund) = test_keys();
		let hash = sha256::Hash::hash(b"preimage").to_byte_array();
		let tree = SwapTree::new(&claim, &refund, &hash, 800_000).unwrap();

		let address = tree.address(&secp, Network::Regtest).unwrap();
		assert!(address.to_string().starts_with("bcrt1p"));

		assert!(tree.claim_control_block(&secp).is_ok());
		assert!(tree.refund_control_block(&secp).is_ok());
	}

	#[test]
	fn test_leaves_commit_to_inputs() {
		let (claim, refund) = test_keys();
		let hash = sha256::Hash::hash(b"preimage").to_byte_array();
		let tree = SwapTree::new(&claim, &refund, &hash, 800_000).unwrap();

		let claim_bytes = tree.claim_leaf.as_bytes();
		assert!(claim_bytes.windows(hash.len()).any(|window| window == hash));

		let refund_xonly = refund.x_only_public_key().0.serialize();
		let refund_bytes = tree.refund_leaf.as_bytes();
		assert!(refund_bytes.windows(32).any(|window| window == refund_xonly));
	}

	#[test]
	fn test_from_parts_round_trip() {
		let secp = Secp256k1::new();
		let (claim, refund) = test_keys();
		let hash = sha256::Hash::hash(b"preimage").to_byte_array();
		let tree = SwapTree::new(&claim, &refund, &hash, 800_000).unwrap();

		let rebuilt = SwapTree::from_parts(
			&tree.claim_leaf.to_hex_string(),
			&tree.refund_leaf.to_hex_string(),
			&claim,
			&refund,
		)
		.unwrap();

		assert_eq!(
			tree.address(&secp, Network::Regtest).unwrap(),
			rebuilt.address(&secp, Network::Regtest).unwrap()
		);
	}

	#[test]
	fn test_key_order_matters() {
		let (claim, refund) = test_keys();
		let a = aggregate_internal_key(&claim, &refund).unwrap();
		let b = aggregate_internal_key(&refund, &claim).unwrap();
		assert_ne!(a, b);
	}
}
