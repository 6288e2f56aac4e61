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

use crate::api::error::ApiError;
use crate::api::{parse_public_key, TAPSCRIPT_LEAF_VERSION};
use crate::service::Context;
use crate::swap::submarine::{ChannelRequest, CreateSubmarineRequest};

pub(crate) const CREATE_SUBMARINE_PATH: &str = "swap/submarine";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSubmarineApiRequest {
	pub(crate) from: String,
	pub(crate) to: String,
	pub(crate) invoice: String,
	pub(crate) refund_public_key: String,
	pub(crate) pair_hash: Option<String>,
	pub(crate) referral_id: Option<String>,
	pub(crate) channel: Option<ChannelApiRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChannelApiRequest {
	pub(crate) private: bool,
	pub(crate) inbound_liquidity: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SwapTreeJson {
	pub(crate) claim_leaf: LeafJson,
	pub(crate) refund_leaf: LeafJson,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LeafJson {
	pub(crate) version: u8,
	pub(crate) output: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSubmarineApiResponse {
	pub(crate) id: String,
	pub(crate) bip21: String,
	pub(crate) address: String,
	pub(crate) swap_tree: SwapTreeJson,
	pub(crate) claim_public_key: String,
	pub(crate) timeout_block_height: u32,
	pub(crate) accept_zero_conf: bool,
	pub(crate) expected_amount: u64,
}

pub(crate) async fn handle_create_submarine_request(
	context: Arc<Context>, request: CreateSubmarineApiRequest,
) -> Result<CreateSubmarineApiResponse, ApiError> {
	let refund_public_key = parse_public_key(&request.refund_public_key, "refundPublicKey")?;

	let created = context
		.submarine
		.create(CreateSubmarineRequest {
			from: request.from,
			to: request.to,
			invoice: request.invoice,
			refund_public_key,
			pair_hash: request.pair_hash,
			referral_id: request.referral_id,
			channel: request.channel.map(|channel| ChannelRequest {
				private: channel.private,
				inbound_liquidity_percent: channel.inbound_liquidity,
			}),
		})
		.await?;

	Ok(CreateSubmarineApiResponse {
		id: created.id,
		bip21: created.bip21,
		address: created.address,
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
		claim_public_key: created.claim_public_key.to_string(),
		timeout_block_height: created.timeout_block_height,
		accept_zero_conf: created.accept_zero_conf,
		expected_amount: created.expected_amount_sat,
	})
}
