// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::api::create_submarine::{LeafJson, SwapTreeJson};
use crate::api::error::ApiError;
use crate::api::{parse_hash32, parse_hex, parse_public_key, TAPSCRIPT_LEAF_VERSION};
use crate::service::Context;
use crate::swap::reverse::CreateReverseRequest;

pub(crate) const CREATE_REVERSE_PATH: &str = "swap/reverse";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateReverseApiRequest {
	pub(crate) from: String,
	pub(crate) to: String,
	pub(crate) preimage_hash: String,
	pub(crate) claim_public_key: String,
	pub(crate) invoice_amount: Option<u64>,
	pub(crate) onchain_amount: Option<u64>,
	pub(crate) pair_hash: Option<String>,
	pub(crate) referral_id: Option<String>,
	pub(crate) description_hash: Option<String>,
	pub(crate) offer: Option<String>,
	pub(crate) address: Option<String>,
	pub(crate) address_signature: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateReverseApiResponse {
	pub(crate) id: String,
	pub(crate) invoice: String,
	pub(crate) swap_tree: SwapTreeJson,
	pub(crate) lockup_address: String,
	pub(crate) refund_public_key: String,
	pub(crate) timeout_block_height: u32,
	pub(crate) onchain_amount: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub(crate) bip21: Option<String>,
}

pub(crate) async fn handle_create_reverse_request(
	context: Arc<Context>, request: CreateReverseApiRequest,
) -> Result<CreateReverseApiResponse, ApiError> {
	let preimage_hash = parse_hash32(&request.preimage_hash, "preimageHash")?;
	let claim_public_key = parse_public_key(&request.claim_public_key, "claimPublicKey")?;
	let description_hash = request
		.description_hash
		.as_deref()
		.map(|hash| parse_hex(hash, "descriptionHash"))
		.transpose()?;
	let address_signature = request
		.address_signature
		.as_deref()
		.map(|signature| parse_hex(signature, "addressSignature"))
		.transpose()?;

	let created = context
		.reverse
		.create(CreateReverseRequest {
			from: request.from,
			to: request.to,
			preimage_hash,
			claim_public_key,
			invoice_amount_sat: request.invoice_amount,
			onchain_amount_sat: request.onchain_amount,
			pair_hash: request.pair_hash,
			referral_id: request.referral_id,
			description_hash,
			offer: request.offer,
			address: request.address,
			address_signature,
		})
		.await?;

	Ok(CreateReverseApiResponse {
		id: created.id,
		invoice: created.invoice,
		swap_tree: SwapTreeJson {
			claim_leaf: LeafJson {
				version: TAPSCRIPT_LEAF_VERSION,
				output: created.claim_leaf_hex,
			},
			refund_leaf: LeafJson {
				version: TAPSCRIPT_LEAF_VERSION,
				output: created.refund_leaf_hex,
			},
		},
		lockup_address: created.lockup_address,
		refund_public_key: created.refund_public_key.to_string(),
		timeout_block_height: created.timeout_block_height,
		onchain_amount: created.onchain_amount_sat,
		bip21: created.bip21,
	})
}
