// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use bitcoin::consensus::encode;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;
use hex::FromHex;

use crate::api::error::ApiError;

pub(crate) mod claim_reverse;
pub(crate) mod claim_submarine;
pub(crate) mod create_reverse;
pub(crate) mod create_submarine;
pub(crate) mod error;
pub(crate) mod get_pairs;
pub(crate) mod get_swap_status;
pub(crate) mod get_version;
pub(crate) mod lockup_transaction;
pub(crate) mod refund_submarine;
pub(crate) mod set_invoice;

/// Tapscript leaf version of taproot swap trees.
pub(crate) const TAPSCRIPT_LEAF_VERSION: u8 = 0xc0;

pub(crate) fn parse_public_key(value: &str, field: &str) -> Result<PublicKey, ApiError> {
	value
		.parse()
		.map_err(|_| ApiError::invalid_request(format!("{field} is not a valid public key")))
}

pub(crate) fn parse_hex(value: &str, field: &str) -> Result<Vec<u8>, ApiError> {
	Vec::<u8>::from_hex(value)
		.map_err(|_| ApiError::invalid_request(format!("{field} is not valid hex")))
}

/// Hashes on the wire must decode to exactly 32 bytes.
pub(crate) fn parse_hash32(value: &str, field: &str) -> Result<[u8; 32], ApiError> {
	parse_hex(value, field)?
		.try_into()
		.map_err(|_| ApiError::invalid_request(format!("{field} must be 32 bytes")))
}

pub(crate) fn parse_pub_nonce(value: &str, field: &str) -> Result<[u8; 66], ApiError> {
	parse_hex(value, field)?
		.try_into()
		.map_err(|_| ApiError::invalid_request(format!("{field} must be 66 bytes")))
}

pub(crate) fn parse_transaction(value: &str) -> Result<Transaction, ApiError> {
	let bytes = parse_hex(value, "transaction")?;
	encode::deserialize(&bytes)
		.map_err(|_| ApiError::invalid_request("transaction is not consensus-valid"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hash_length_is_enforced() {
		assert!(parse_hash32(&"00".repeat(32), "preimageHash").is_ok());
		assert!(parse_hash32(&"00".repeat(31), "preimageHash").is_err());
		assert!(parse_hash32(&"00".repeat(33), "preimageHash").is_err());
		assert!(parse_hash32("zz", "preimageHash").is_err());
	}

	#[test]
	fn test_pub_nonce_length_is_enforced() {
		assert!(parse_pub_nonce(&"02".repeat(66), "pubNonce").is_ok());
		assert!(parse_pub_nonce(&"02".repeat(64), "pubNonce").is_err());
	}
}
