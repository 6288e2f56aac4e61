// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::api::error::ApiError;
use crate::service::Context;
use crate::swap::SwapType;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairLimitsJson {
	pub(crate) minimal: u64,
	pub(crate) maximal: u64,
	pub(crate) maximal_zero_conf: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairFeesJson {
	/// Service fee in percent.
	pub(crate) percentage: f64,
	pub(crate) miner_fees: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairJson {
	pub(crate) hash: String,
	pub(crate) rate: f64,
	pub(crate) limits: PairLimitsJson,
	pub(crate) fees: PairFeesJson,
	pub(crate) timeout_delta: u32,
}

#[derive(Serialize)]
pub(crate) struct GetPairsResponse {
	pub(crate) pairs: BTreeMap<String, PairJson>,
}

pub(crate) async fn handle_get_pairs_request(
	context: Arc<Context>, swap_type: SwapType,
) -> Result<GetPairsResponse, ApiError> {
	let pairs = context
		.pairs
		.values()
		.map(|pair| {
			let timeout_delta = match swap_type {
				SwapType::Reverse => pair.timeout_delta_reverse,
				_ => pair.timeout_delta_submarine,
			};
			(
				pair.symbol(),
				PairJson {
					hash: pair.hash(),
					rate: pair.rate_ppm as f64 / 1_000_000.0,
					limits: PairLimitsJson {
						minimal: pair.min_amount_sat,
						maximal: pair.max_amount_sat,
						maximal_zero_conf: if pair.zero_conf_enabled {
							pair.max_zero_conf_amount_sat
						} else {
							0
						},
					},
					fees: PairFeesJson {
						percentage: pair.fee_percentage_bps as f64 / 100.0,
						miner_fees: pair.claim_miner_fee_sat,
					},
					timeout_delta,
				},
			)
		})
		.collect();
	Ok(GetPairsResponse { pairs })
}
