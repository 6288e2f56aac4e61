// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::claim_reverse::{handle_claim_reverse_request, CLAIM_REVERSE_PATH};
use crate::api::claim_submarine::{handle_claim_submarine_request, CLAIM_SUBMARINE_PATH};
use crate::api::create_reverse::{handle_create_reverse_request, CREATE_REVERSE_PATH};
use crate::api::create_submarine::{handle_create_submarine_request, CREATE_SUBMARINE_PATH};
use crate::api::error::{ApiError, ErrorResponse};
use crate::api::get_pairs::handle_get_pairs_request;
use crate::api::get_swap_status::handle_get_swap_status_request;
use crate::api::get_version::{handle_get_version_request, GET_VERSION_PATH};
use crate::api::lockup_transaction::handle_lockup_transaction_request;
use crate::api::refund_submarine::{handle_refund_submarine_request, REFUND_SUBMARINE_PATH};
use crate::api::set_invoice::{handle_set_invoice_request, SET_INVOICE_PATH};
use crate::chain::ChainBackend;
use crate::io::events::EventBus;
use crate::io::persist::SwapStore;
use crate::swap::musig::CooperativeSigner;
use crate::swap::reverse::ReverseEngine;
use crate::swap::submarine::SubmarineEngine;
use crate::swap::{Pair, SwapType};

pub(crate) struct Context {
	pub(crate) submarine: Arc<SubmarineEngine>,
	pub(crate) reverse: Arc<ReverseEngine>,
	pub(crate) signer: Arc<CooperativeSigner>,
	pub(crate) store: Arc<SwapStore>,
	pub(crate) events: Arc<EventBus>,
	pub(crate) chains: HashMap<String, ChainBackend>,
	pub(crate) pairs: HashMap<String, Pair>,
}

#[derive(Clone)]
pub(crate) struct SwapService {
	context: Arc<Context>,
}

impl SwapService {
	pub(crate) fn new(context: Arc<Context>) -> Self {
		Self { context }
	}
}

impl Service<Request<Incoming>> for SwapService {
	type Response = Response<Full<Bytes>>;
	type Error = hyper::Error;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn call(&self, req: Request<Incoming>) -> Self::Future {
		let context = Arc::clone(&self.context);
		Box::pin(route(context, req))
	}
}

async fn route(
	context: Arc<Context>, req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	// Exclude '/' from path pattern matching.
	let path = req.uri().path().trim_matches('/').to_string();

	match path.as_str() {
		CREATE_SUBMARINE_PATH if method == Method::POST => {
			handle_request(context, req, StatusCode::CREATED, handle_create_submarine_request)
				.await
		},
		CREATE_SUBMARINE_PATH => {
			json_response(handle_get_pairs_request(context, SwapType::Submarine).await, StatusCode::OK)
		},
		CREATE_REVERSE_PATH if method == Method::POST => {
			handle_request(context, req, StatusCode::CREATED, handle_create_reverse_request).await
		},
		CREATE_REVERSE_PATH => {
			json_response(handle_get_pairs_request(context, SwapType::Reverse).await, StatusCode::OK)
		},
		SET_INVOICE_PATH if method == Method::POST => {
			handle_request(context, req, StatusCode::OK, handle_set_invoice_request).await
		},
		CLAIM_SUBMARINE_PATH if method == Method::POST => {
			handle_request(context, req, StatusCode::OK, handle_claim_submarine_request).await
		},
		REFUND_SUBMARINE_PATH if method == Method::POST => {
			handle_request(context, req, StatusCode::OK, handle_refund_submarine_request).await
		},
		CLAIM_REVERSE_PATH if method == Method::POST => {
			handle_request(context, req, StatusCode::OK, handle_claim_reverse_request).await
		},
		GET_VERSION_PATH => {
			json_response::<_, ApiError>(Ok(handle_get_version_request()), StatusCode::OK)
		},
		_ => {
			let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
			match segments.as_slice() {
				["swap", "submarine", id, "transaction"] if method == Method::GET => {
					json_response(
						handle_lockup_transaction_request(context, id).await,
						StatusCode::OK,
					)
				},
				["swap", id] if method == Method::GET => json_response(
					handle_get_swap_status_request(context, id).await,
					StatusCode::OK,
				),
				_ => {
					let error =
						ApiError::invalid_request(format!("Unknown request: {}", path));
					error_response(&error)
				},
			}
		},
	}
}

async fn handle_request<T, R, F, Fut>(
	context: Arc<Context>, request: Request<Incoming>, success_status: StatusCode, handler: F,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
	T: DeserializeOwned,
	R: Serialize,
	F: FnOnce(Arc<Context>, T) -> Fut,
	Fut: Future<Output = Result<R, ApiError>>,
{
	// TODO: we should bound the amount of data we read to avoid allocating too much memory.
	let bytes = request.into_body().collect().await?.to_bytes();
	match serde_json::from_slice::<T>(&bytes) {
		Ok(request) => json_response(handler(context, request).await, success_status),
		Err(_) => error_response(&ApiError::invalid_request("Malformed request.")),
	}
}

fn json_response<R: Serialize, E: Into<ApiError>>(
	result: Result<R, E>, success_status: StatusCode,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	match result {
		Ok(response) => {
			let body = serde_json::to_vec(&response)
				.unwrap_or_else(|_| b"{}".to_vec());
			Ok(Response::builder()
				.status(success_status)
				.header("content-type", "application/json")
				.body(Full::new(Bytes::from(body)))
				// unwrap safety: body only errors when previous chained calls failed.
				.unwrap())
		},
		Err(error) => error_response(&error.into()),
	}
}

fn error_response(error: &ApiError) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let body = serde_json::to_vec(&ErrorResponse::from(error))
		.unwrap_or_else(|_| b"{}".to_vec());
	Ok(Response::builder()
		.status(error.code.status())
		.header("content-type", "application/json")
		.body(Full::new(Bytes::from(body)))
		// unwrap safety: body only errors when previous chained calls failed.
		.unwrap())
}
