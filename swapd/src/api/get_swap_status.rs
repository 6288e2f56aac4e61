// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::sync::Arc;

use crate::api::error::{ApiError, ApiErrorCode};
use crate::service::Context;
use crate::swap::status::SwapUpdate;

/// Latest status snapshot of any swap type; late subscribers get the most
/// recent update only.
pub(crate) async fn handle_get_swap_status_request(
	context: Arc<Context>, swap_id: &str,
) -> Result<SwapUpdate, ApiError> {
	if let Some(update) = context.events.latest(swap_id) {
		return Ok(update);
	}
	match context.store.get_status(swap_id)? {
		Some((_, status)) => Ok(SwapUpdate::new(swap_id, status)),
		None => Err(ApiError::new(
			ApiErrorCode::SwapNotFound,
			format!("swap {swap_id} not found"),
		)),
	}
}
