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
use crate::service::Context;

pub(crate) const SET_INVOICE_PATH: &str = "swap/submarine/invoice";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetInvoiceApiRequest {
	pub(crate) id: String,
	pub(crate) invoice: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetInvoiceApiResponse {
	pub(crate) expected_amount: u64,
}

pub(crate) async fn handle_set_invoice_request(
	context: Arc<Context>, request: SetInvoiceApiRequest,
) -> Result<SetInvoiceApiResponse, ApiError> {
	let expected_amount =
		context.submarine.set_invoice(&request.id, &request.invoice).await?;
	Ok(SetInvoiceApiResponse { expected_amount })
}
