// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

mod api;
mod chain;
mod io;
mod lightning;
mod service;
mod swap;
#[cfg(test)]
mod test_utils;
mod util;
mod wallet;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::fs;

use clap::Parser;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::chain::listener::ChainListener;
use crate::chain::{ChainBackend, ChainEvent};
use crate::io::bitcoind::{run_chain_poller, BitcoindClient, CoreWallet};
use crate::io::events::EventBus;
use crate::io::lnd::{run_lightning_poller, LndClient};
use crate::io::persist::SwapStore;
use crate::lightning::{LightningClient, LightningEvent};
use crate::service::{Context, SwapService};
use crate::swap::hints::RoutingHintsEngine;
use crate::swap::musig::CooperativeSigner;
use crate::swap::nursery::{ChannelNursery, NurseryConfig, NurseryEvent};
use crate::swap::reverse::{ReverseConfig, ReverseEngine};
use crate::swap::submarine::{SubmarineConfig, SubmarineEngine};
use crate::swap::timeout::TimeoutWatcher;
use crate::swap::{Pair, SwapLocks, SwapType};
use crate::util::config::{load_config, ArgsConfig};
use crate::util::key_provider::KeyProvider;
use crate::util::logger::Logger;
use crate::wallet::WalletProvider;

const CHAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
const LIGHTNING_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CORE_WALLET_NAME: &str = "swapd";

fn main() {
	let args = ArgsConfig::parse();
	let config = match load_config(&args) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Invalid configuration: {}", e);
			std::process::exit(-1);
		},
	};

	if let Err(e) = Logger::init(config.log_level, config.log_file_path.as_deref()) {
		eprintln!("Failed to set up logger: {}", e);
		std::process::exit(-1);
	}

	let seed = match fs::read(&config.seed_file_path) {
		Ok(seed) if seed.len() >= 32 => seed,
		Ok(_) => {
			eprintln!("Seed file must hold at least 32 bytes.");
			std::process::exit(-1);
		},
		Err(e) => {
			eprintln!("Failed to read seed file: {}", e);
			std::process::exit(-1);
		},
	};

	let macaroon = match &config.lightning_macaroon_path {
		Some(path) => match fs::read(path) {
			Ok(macaroon) => Some(macaroon),
			Err(e) => {
				eprintln!("Failed to read macaroon file: {}", e);
				std::process::exit(-1);
			},
		},
		None => None,
	};

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(runtime) => Arc::new(runtime),
		Err(e) => {
			eprintln!("Failed to setup tokio runtime: {}", e);
			std::process::exit(-1);
		},
	};

	info!("Starting up on {}...", config.network);

	runtime.block_on(async {
		let events = Arc::new(EventBus::new(1_024));
		let store = match SwapStore::new(PathBuf::from(&config.storage_dir_path), events.clone())
		{
			Ok(store) => Arc::new(store),
			Err(e) => {
				eprintln!("Failed to open swap store: {}", e);
				std::process::exit(-1);
			},
		};

		let bitcoind = Arc::new(BitcoindClient::new(
			config.bitcoind_rpc_addr,
			&config.bitcoind_rpc_user,
			&config.bitcoind_rpc_password,
		));
		let lnd = match LndClient::new(&config.lightning_rpc_addr, macaroon.as_deref()) {
			Ok(lnd) => Arc::new(lnd),
			Err(e) => {
				eprintln!("Failed to build Lightning client: {}", e);
				std::process::exit(-1);
			},
		};
		let node_info = match lnd.get_info().await {
			Ok(info) => info,
			Err(e) => {
				eprintln!("Failed to reach Lightning node: {}", e);
				std::process::exit(-1);
			},
		};
		info!("Connected to Lightning node {}", node_info.public_key);

		let pairs: HashMap<String, Pair> =
			config.pairs.iter().map(|pair| (pair.symbol(), pair.clone())).collect();
		let symbols: Vec<String> = config
			.pairs
			.iter()
			.flat_map(|pair| [pair.base.clone(), pair.quote.clone()])
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect();

		let (chain_events_tx, mut chain_events) = mpsc::channel::<ChainEvent>(1_024);
		let mut chains: HashMap<String, ChainBackend> = HashMap::new();
		let mut wallets: HashMap<String, Arc<dyn WalletProvider>> = HashMap::new();
		for symbol in &symbols {
			let listener = Arc::new(ChainListener::new(symbol, chain_events_tx.clone()));
			chains.insert(
				symbol.clone(),
				ChainBackend { client: bitcoind.clone(), listener: listener.clone() },
			);
			wallets.insert(
				symbol.clone(),
				Arc::new(CoreWallet::new(bitcoind.clone(), CORE_WALLET_NAME, symbol)),
			);
			tokio::spawn(run_chain_poller(bitcoind.clone(), listener, CHAIN_POLL_INTERVAL));
		}

		let keys = match KeyProvider::new(&seed, config.network, &symbols, store.clone()) {
			Ok(keys) => Arc::new(keys),
			Err(e) => {
				eprintln!("Failed to build key provider: {}", e);
				std::process::exit(-1);
			},
		};
		let locks = Arc::new(SwapLocks::new());
		let timeouts = Arc::new(TimeoutWatcher::new());
		let hints = Arc::new(RoutingHintsEngine::new(node_info.public_key));

		let (nursery_events_tx, nursery_events) = mpsc::channel::<NurseryEvent>(256);

		let submarine = Arc::new(SubmarineEngine::new(
			config.network,
			store.clone(),
			chains.clone(),
			lnd.clone(),
			wallets.clone(),
			keys.clone(),
			locks.clone(),
			timeouts.clone(),
			pairs.clone(),
			nursery_events_tx.clone(),
			SubmarineConfig::default(),
		));
		let reverse = Arc::new(ReverseEngine::new(
			config.network,
			store.clone(),
			chains.clone(),
			lnd.clone(),
			wallets.clone(),
			keys.clone(),
			locks.clone(),
			timeouts.clone(),
			pairs.clone(),
			hints,
			ReverseConfig::default(),
		));
		let signer = Arc::new(CooperativeSigner::new(
			config.network,
			store.clone(),
			lnd.clone(),
			keys.clone(),
		));
		let nursery = Arc::new(ChannelNursery::new(
			store.clone(),
			lnd.clone(),
			bitcoind.clone(),
			submarine.clone(),
			locks.clone(),
			NurseryConfig::default(),
		));

		// Re-arm persisted swaps and finish interrupted channel work.
		if let Err(e) = submarine.restore().await {
			error!("Failed to restore submarine swaps: {}", e);
		}
		if let Err(e) = reverse.restore().await {
			error!("Failed to restore reverse swaps: {}", e);
		}
		nursery.retry_opening_channels().await;
		nursery.settle_created_channels().await;
		tokio::spawn(Arc::clone(&nursery).run(nursery_events));

		let (lightning_events_tx, mut lightning_events) = mpsc::channel::<LightningEvent>(256);
		tokio::spawn(run_lightning_poller(
			lnd.clone(),
			store.clone(),
			lightning_events_tx,
			LIGHTNING_POLL_INTERVAL,
		));

		let context = Arc::new(Context {
			submarine: submarine.clone(),
			reverse: reverse.clone(),
			signer,
			store: store.clone(),
			events: events.clone(),
			chains: chains.clone(),
			pairs,
		});

		let mut sigterm_stream = match tokio::signal::unix::signal(SignalKind::terminate()) {
			Ok(stream) => stream,
			Err(e) => {
				eprintln!("Failed to register for SIGTERM stream: {}", e);
				std::process::exit(-1);
			},
		};
		let rest_svc_listener = TcpListener::bind(config.rest_service_addr)
			.await
			.expect("Failed to bind listening port");
		info!("REST API listening on {}", config.rest_service_addr);

		loop {
			let wall_deadline = timeouts
				.next_wall_clock_deadline()
				.unwrap_or_else(|| Instant::now() + Duration::from_secs(3_600));

			tokio::select! {
				event = chain_events.recv() => {
					let event = match event {
						Some(event) => event,
						None => break,
					};
					handle_chain_event(event, &submarine, &reverse, &timeouts).await;
				}
				event = lightning_events.recv() => {
					let event = match event {
						Some(event) => event,
						None => break,
					};
					handle_lightning_event(event, &reverse, &nursery_events_tx).await;
				}
				_ = tokio::time::sleep_until(wall_deadline) => {
					for swap_id in timeouts.drain_due_wall_clock(Instant::now()) {
						submarine.cooperative_claim_fallback(&swap_id).await;
					}
				}
				res = rest_svc_listener.accept() => {
					match res {
						Ok((stream, _)) => {
							let io_stream = TokioIo::new(stream);
							let swap_service = SwapService::new(Arc::clone(&context));
							tokio::spawn(async move {
								if let Err(err) = http1::Builder::new()
									.serve_connection(io_stream, swap_service)
									.await
								{
									warn!("Failed to serve connection: {}", err);
								}
							});
						},
						Err(e) => warn!("Failed to accept connection: {}", e),
					}
				}
				_ = tokio::signal::ctrl_c() => {
					info!("Received CTRL-C, shutting down..");
					break;
				}
				_ = sigterm_stream.recv() => {
					info!("Received SIGTERM, shutting down..");
					break;
				}
			}
		}
	});

	info!("Shutdown complete..");
}

async fn handle_chain_event(
	event: ChainEvent, submarine: &Arc<SubmarineEngine>, reverse: &Arc<ReverseEngine>,
	timeouts: &Arc<TimeoutWatcher>,
) {
	match event {
		ChainEvent::OutputFound { swap, transaction, txid, vout, amount_sat, confirmed, .. } => {
			let result = match swap.swap_type {
				SwapType::Submarine => {
					submarine
						.on_output_found(&swap.id, &transaction, txid, vout, amount_sat, confirmed)
						.await
				},
				SwapType::Reverse => reverse.on_output_found(&swap.id, txid, vout, confirmed).await,
				SwapType::Chain => Ok(()),
			};
			if let Err(e) = result {
				error!("Failed to handle lockup of swap {}: {}", swap.id, e);
			}
		},
		ChainEvent::OutputRetracted { swap, .. } => {
			if swap.swap_type == SwapType::Submarine {
				if let Err(e) = submarine.on_output_retracted(&swap.id).await {
					error!("Failed to handle retraction of swap {}: {}", swap.id, e);
				}
			}
		},
		ChainEvent::OutpointSpent { swap, spending_transaction, .. } => {
			if let Err(e) = reverse.on_outpoint_spent(&swap.id, &spending_transaction).await {
				error!("Failed to handle spend of swap {}: {}", swap.id, e);
			}
		},
		ChainEvent::BlockConnected { symbol, height } => {
			if let Err(e) = submarine.on_block(&symbol).await {
				error!("Block housekeeping on {} failed: {}", symbol, e);
			}
			for due in timeouts.drain_due(&symbol, height) {
				let result = match due.swap_type {
					SwapType::Submarine => submarine.on_expiry(&due.id).await,
					SwapType::Reverse => reverse.on_expiry(&due.id).await,
					SwapType::Chain => Ok(()),
				};
				if let Err(e) = result {
					error!("Failed to expire swap {}: {}", due.id, e);
				}
			}
		},
	}
}

async fn handle_lightning_event(
	event: LightningEvent, reverse: &Arc<ReverseEngine>,
	nursery_events: &mpsc::Sender<NurseryEvent>,
) {
	match event {
		LightningEvent::InvoiceAccepted { preimage_hash } => {
			if let Err(e) = reverse.on_invoice_accepted(preimage_hash).await {
				error!("Failed to handle accepted invoice: {}", e);
			}
		},
		LightningEvent::InvoiceCancelled { preimage_hash } => {
			if let Err(e) = reverse.on_invoice_cancelled(preimage_hash).await {
				error!("Failed to handle cancelled invoice: {}", e);
			}
		},
		LightningEvent::InvoiceSettled { .. } => {},
		LightningEvent::PeerOnline { public_key } => {
			let _ = nursery_events.send(NurseryEvent::PeerOnline { public_key }).await;
		},
		LightningEvent::ChannelActive { funding_txid, funding_vout } => {
			let _ = nursery_events
				.send(NurseryEvent::ChannelActive { funding_txid, funding_vout })
				.await;
		},
	}
}
