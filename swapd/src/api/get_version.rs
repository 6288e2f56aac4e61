// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use serde::Serialize;

pub(crate) const GET_VERSION_PATH: &str = "version";

#[derive(Serialize)]
pub(crate) struct GetVersionResponse {
	pub(crate) version: &'static str,
}

pub(crate) fn handle_get_version_request() -> GetVersionResponse {
	GetVersionResponse { version: env!("CARGO_PKG_VERSION") }
}
