// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

pub mod sqlite_store;

use thiserror::Error;

use crate::swap::status::SwapStatus;

pub use sqlite_store::SwapStore;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] rusqlite::Error),
	#[error("swap {id} not found")]
	NotFound { id: String },
	#[error("illegal status transition for swap {id}: {from} -> {to}")]
	IllegalTransition { id: String, from: SwapStatus, to: SwapStatus },
	#[error("corrupt record for swap {id}: {reason}")]
	Corrupt { id: String, reason: String },
}
