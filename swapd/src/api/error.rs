// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use hyper::StatusCode;
use serde::Serialize;

use crate::io::persist::StoreError;
use crate::swap::hints::HintsError;
use crate::swap::musig::SignerError;
use crate::swap::SwapError;

pub(crate) struct ApiError {
	// The error message containing a generic description of the error
	// condition in English. It is intended for a human audience only and
	// should not be parsed to extract any information programmatically.
	pub(crate) message: String,

	// The error code uniquely identifying an error condition. It is meant
	// to be read and understood programmatically by code that
	// detects/handles errors by type.
	pub(crate) code: ApiErrorCode,
}

impl ApiError {
	pub(crate) fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
		Self { message: message.into(), code }
	}

	pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
		Self::new(ApiErrorCode::InvalidRequest, message)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApiErrorCode {
	/// The request was missing a required argument, or an argument was
	/// invalid, incomplete or in the wrong format.
	InvalidRequest,
	SwapNotFound,
	PairNotFound,
	AmountOutOfBounds,
	InvalidInvoice,
	NotEligibleForRefund,
	InvalidPreimage,
	InvoiceNotAccepted,
	SigningFailed,
	InvalidAddressSignature,
	InvalidDescriptionHash,
	ChainUnavailable,
	LightningUnavailable,
	InternalError,
}

impl ApiErrorCode {
	/// Wire format: `<PREFIX>.<N>` where the prefix identifies the
	/// subsystem.
	pub(crate) fn as_str(&self) -> &'static str {
		match self {
			ApiErrorCode::InvalidRequest => "SWAP.1",
			ApiErrorCode::SwapNotFound => "SWAP.2",
			ApiErrorCode::PairNotFound => "SWAP.3",
			ApiErrorCode::AmountOutOfBounds => "SWAP.4",
			ApiErrorCode::InvalidInvoice => "SWAP.5",
			ApiErrorCode::InternalError => "SWAP.6",
			ApiErrorCode::NotEligibleForRefund => "SIGNER.1",
			ApiErrorCode::InvalidPreimage => "SIGNER.2",
			ApiErrorCode::InvoiceNotAccepted => "SIGNER.3",
			ApiErrorCode::SigningFailed => "SIGNER.4",
			ApiErrorCode::InvalidAddressSignature => "HINTS.1",
			ApiErrorCode::InvalidDescriptionHash => "HINTS.2",
			ApiErrorCode::ChainUnavailable => "CHAIN.1",
			ApiErrorCode::LightningUnavailable => "LN.1",
		}
	}

	pub(crate) fn status(&self) -> StatusCode {
		match self {
			ApiErrorCode::SwapNotFound => StatusCode::NOT_FOUND,
			ApiErrorCode::ChainUnavailable
			| ApiErrorCode::LightningUnavailable
			| ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
			_ => StatusCode::BAD_REQUEST,
		}
	}
}

/// The JSON error envelope.
#[derive(Serialize)]
pub(crate) struct ErrorResponse {
	pub(crate) error: String,
	pub(crate) code: &'static str,
}

impl From<&ApiError> for ErrorResponse {
	fn from(error: &ApiError) -> Self {
		Self { error: error.message.clone(), code: error.code.as_str() }
	}
}

impl From<SwapError> for ApiError {
	fn from(error: SwapError) -> Self {
		let code = match &error {
			SwapError::SwapNotFound(_) => ApiErrorCode::SwapNotFound,
			SwapError::UnknownPair(_)
			| SwapError::UnknownCurrency(_)
			| SwapError::PairHashMismatch => ApiErrorCode::PairNotFound,
			SwapError::AmountOutOfBounds { .. } | SwapError::MissingAmount => {
				ApiErrorCode::AmountOutOfBounds
			},
			SwapError::InvalidInvoice(_) | SwapError::InvoiceExpired => {
				ApiErrorCode::InvalidInvoice
			},
			SwapError::Hints(e) => return hints_code(e, error.to_string()),
			SwapError::Chain(_) => ApiErrorCode::ChainUnavailable,
			SwapError::Lightning(_) => ApiErrorCode::LightningUnavailable,
			_ => ApiErrorCode::InternalError,
		};
		ApiError::new(code, error.to_string())
	}
}

impl From<SignerError> for ApiError {
	fn from(error: SignerError) -> Self {
		let code = match &error {
			SignerError::SwapNotFound(_) => ApiErrorCode::SwapNotFound,
			SignerError::NotEligibleForRefund => ApiErrorCode::NotEligibleForRefund,
			SignerError::PreimageMismatch => ApiErrorCode::InvalidPreimage,
			SignerError::InvoiceNotAccepted => ApiErrorCode::InvoiceNotAccepted,
			SignerError::InvalidTransaction(_) => ApiErrorCode::InvalidRequest,
			SignerError::Session(_) | SignerError::Htlc(_) => ApiErrorCode::SigningFailed,
			SignerError::Lightning(_) => ApiErrorCode::LightningUnavailable,
			_ => ApiErrorCode::InternalError,
		};
		ApiError::new(code, error.to_string())
	}
}

impl From<HintsError> for ApiError {
	fn from(error: HintsError) -> Self {
		let message = error.to_string();
		hints_code(&error, message)
	}
}

impl From<StoreError> for ApiError {
	fn from(error: StoreError) -> Self {
		match &error {
			StoreError::NotFound { .. } => {
				ApiError::new(ApiErrorCode::SwapNotFound, error.to_string())
			},
			_ => ApiError::new(ApiErrorCode::InternalError, error.to_string()),
		}
	}
}

fn hints_code(error: &HintsError, message: String) -> ApiError {
	let code = match error {
		HintsError::DescriptionHashLength => ApiErrorCode::InvalidDescriptionHash,
		HintsError::InvalidAddressSignature | HintsError::InvalidSignatureEncoding => {
			ApiErrorCode::InvalidAddressSignature
		},
		HintsError::Invoice(_) => ApiErrorCode::InvalidInvoice,
	};
	ApiError::new(code, message)
}
