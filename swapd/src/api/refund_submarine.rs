// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::sync::Arc;

use hex::DisplayHex;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::{parse_pub_nonce, parse_transaction};
use crate::service::Context;

pub(crate) const REFUND_SUBMARINE_PATH: &str = "swap/submarine/refund";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefundSubmarineApiRequest {
	pub(crate) id: String,
	pub(crate) pub_nonce: String,
	pub(crate) transaction: String,
	pub(crate) index: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PartialSignatureResponse {
	pub(crate) pub_nonce: String,
	pub(crate) partial_signature: String,
}

pub(crate) async fn handle_refund_submarine_request(
	context: Arc<Context>, request: RefundSubmarineApiRequest,
) -> Result<PartialSignatureResponse, ApiError> {
	let client_pub_nonce = parse_pub_nonce(&request.pub_nonce, "pubNonce")?;
	let transaction = parse_transaction(&request.transaction)?;

	let response = context
		.signer
		.sign_swap_refund(&request.id, client_pub_nonce, transaction, request.index)
		.await?;

	Ok(PartialSignatureResponse {
		pub_nonce: response.pub_nonce.to_lower_hex_string(),
		partial_signature: response.partial_signature.to_lower_hex_string(),
	})
}
