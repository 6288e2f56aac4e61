// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! BIP32 derivation of service-owned swap keys. The per-currency derivation
//! cursor lives in the swap store so an index is never handed out twice.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::key::{Keypair, Secp256k1};
use bitcoin::secp256k1::All;
use bitcoin::Network;
use thiserror::Error;

use crate::io::persist::{StoreError, SwapStore};

#[derive(Debug, Error)]
pub enum KeyProviderError {
	#[error("unknown currency {0}")]
	UnknownCurrency(String),
	#[error("derivation failed: {0}")]
	Derivation(String),
	#[error(transparent)]
	Store(#[from] StoreError),
}

pub struct KeyProvider {
	secp: Secp256k1<All>,
	master: Xpriv,
	accounts: HashMap<String, u32>,
	store: Arc<SwapStore>,
}

impl KeyProvider {
	/// `symbols` assigns one hardened account per currency, in configuration
	/// order.
	pub fn new(
		seed: &[u8], network: Network, symbols: &[String], store: Arc<SwapStore>,
	) -> Result<Self, KeyProviderError> {
		let master = Xpriv::new_master(network, seed)
			.map_err(|e| KeyProviderError::Derivation(e.to_string()))?;
		let accounts = symbols
			.iter()
			.enumerate()
			.map(|(account, symbol)| (symbol.clone(), account as u32))
			.collect();
		Ok(Self { secp: Secp256k1::new(), master, accounts, store })
	}

	/// Derives the keypair at an index previously handed out.
	pub fn keypair(&self, symbol: &str, index: u32) -> Result<Keypair, KeyProviderError> {
		let account = *self
			.accounts
			.get(symbol)
			.ok_or_else(|| KeyProviderError::UnknownCurrency(symbol.to_string()))?;
		let path = DerivationPath::from(vec![
			ChildNumber::from_hardened_idx(44).expect("constant is in range"),
			ChildNumber::from_hardened_idx(0).expect("constant is in range"),
			ChildNumber::from_hardened_idx(account)
				.map_err(|e| KeyProviderError::Derivation(e.to_string()))?,
			ChildNumber::from_normal_idx(index)
				.map_err(|e| KeyProviderError::Derivation(e.to_string()))?,
		]);
		let derived = self
			.master
			.derive_priv(&self.secp, &path)
			.map_err(|e| KeyProviderError::Derivation(e.to_string()))?;
		Ok(Keypair::from_secret_key(&self.secp, &derived.private_key))
	}

	/// Hands out the next unused keypair for the currency and advances the
	/// persisted cursor.
	pub fn next_keypair(&self, symbol: &str) -> Result<(u32, Keypair), KeyProviderError> {
		let index = self.store.next_key_index(symbol)?;
		Ok((index, self.keypair(symbol, index)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::io::events::EventBus;

	fn provider() -> KeyProvider {
		let store = Arc::new(SwapStore::in_memory(Arc::new(EventBus::new(16))).unwrap());
		KeyProvider::new(&[42u8; 32], Network::Regtest, &["BTC".to_string()], store).unwrap()
	}

	#[test]
	fn test_next_keypair_never_repeats() {
		let provider = provider();
		let (index_a, keypair_a) = provider.next_keypair("BTC").unwrap();
		let (index_b, keypair_b) = provider.next_keypair("BTC").unwrap();
		assert_ne!(index_a, index_b);
		assert_ne!(keypair_a.public_key(), keypair_b.public_key());
	}

	#[test]
	fn test_keypair_is_deterministic_per_index() {
		let provider = provider();
		let (index, keypair) = provider.next_keypair("BTC").unwrap();
		let again = provider.keypair("BTC", index).unwrap();
		assert_eq!(keypair.public_key(), again.public_key());
	}

	#[test]
	fn test_unknown_currency_is_rejected() {
		let provider = provider();
		assert!(matches!(
			provider.keypair("DOGE", 0),
			Err(KeyProviderError::UnknownCurrency(_))
		));
	}
}
