// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::sync::Arc;

use bitcoin::consensus::encode::serialize_hex;
use serde::Serialize;

use crate::api::error::{ApiError, ApiErrorCode};
use crate::service::Context;
use crate::swap::{chain_currency, split_pair, SwapType};

/// Average block interval used for the timeout ETA.
const BLOCK_INTERVAL_SECS: u64 = 600;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LockupTransactionResponse {
	pub(crate) id: String,
	pub(crate) hex: String,
	pub(crate) timeout_block_height: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub(crate) timeout_eta: Option<u64>,
}

pub(crate) async fn handle_lockup_transaction_request(
	context: Arc<Context>, swap_id: &str,
) -> Result<LockupTransactionResponse, ApiError> {
	let swap = context
		.store
		.get_swap(swap_id)?
		.ok_or_else(|| ApiError::new(ApiErrorCode::SwapNotFound, format!("swap {swap_id} not found")))?;
	let lockup_txid = swap.lockup_txid.ok_or_else(|| {
		ApiError::new(ApiErrorCode::SwapNotFound, "no lockup transaction recorded")
	})?;

	let (base, quote) = split_pair(&swap.pair)
		.ok_or_else(|| ApiError::new(ApiErrorCode::InternalError, "malformed pair"))?;
	let symbol = chain_currency(base, quote, swap.order_side, SwapType::Submarine);
	let backend = context
		.chains
		.get(&symbol)
		.ok_or_else(|| ApiError::new(ApiErrorCode::ChainUnavailable, "unknown chain"))?;

	let transaction = backend
		.client
		.raw_transaction_verbose(&lockup_txid)
		.await
		.map_err(|e| ApiError::new(ApiErrorCode::ChainUnavailable, e.to_string()))?;
	let info = backend
		.client
		.blockchain_info()
		.await
		.map_err(|e| ApiError::new(ApiErrorCode::ChainUnavailable, e.to_string()))?;

	let timeout_eta = swap
		.timeout_block_height
		.checked_sub(info.height)
		.map(|blocks| blocks as u64 * BLOCK_INTERVAL_SECS);

	Ok(LockupTransactionResponse {
		id: swap.id,
		hex: serialize_hex(&transaction.transaction),
		timeout_block_height: swap.timeout_block_height,
		timeout_eta,
	})
}
