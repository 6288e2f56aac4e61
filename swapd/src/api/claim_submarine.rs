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
use crate::api::parse_transaction;
use crate::service::Context;

pub(crate) const CLAIM_SUBMARINE_PATH: &str = "swap/submarine/claim";

/// A fully signed cooperative claim submitted before the script-path
/// fallback fires.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClaimSubmarineApiRequest {
	pub(crate) id: String,
	pub(crate) transaction: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClaimSubmarineApiResponse {
	pub(crate) transaction_id: String,
}

pub(crate) async fn handle_claim_submarine_request(
	context: Arc<Context>, request: ClaimSubmarineApiRequest,
) -> Result<ClaimSubmarineApiResponse, ApiError> {
	let transaction = parse_transaction(&request.transaction)?;
	let txid = context.submarine.broadcast_cooperative_claim(&request.id, transaction).await?;
	Ok(ClaimSubmarineApiResponse { transaction_id: txid.to_string() })
}
