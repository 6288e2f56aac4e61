// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Capability interface over wallet providers. Concrete adapters (core
//! wallet, external signers, token wallets) live outside the engine;
//! capabilities are probed through the trait instead of matching RPC error
//! strings.

use async_trait::async_trait;
use bitcoin::Txid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
	#[error("wallet RPC failed: {0}")]
	Rpc(String),
	#[error("insufficient funds: need {needed_sat} sat, have {available_sat} sat")]
	InsufficientFunds { needed_sat: u64, available_sat: u64 },
	#[error("operation not supported by this wallet")]
	NotSupported,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WalletBalance {
	pub confirmed_sat: u64,
	pub unconfirmed_sat: u64,
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
	fn symbol(&self) -> &str;

	async fn get_address(&self) -> Result<String, WalletError>;

	async fn get_balance(&self) -> Result<WalletBalance, WalletError>;

	async fn send_to_address(
		&self, address: &str, amount_sat: u64, sat_per_vbyte: Option<u64>,
	) -> Result<Txid, WalletError>;

	async fn sweep_wallet(&self, address: &str) -> Result<Txid, WalletError>;

	/// Token wallets additionally expose allowance management; callers must
	/// probe before use.
	fn supports_approval(&self) -> bool {
		false
	}

	async fn approve(&self, _spender: &str, _amount: u64) -> Result<(), WalletError> {
		Err(WalletError::NotSupported)
	}
}
