// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! SQLite-backed swap store. Every mutation runs in a single transaction;
//! `set_status` validates the predecessor set before updating and publishes
//! the update on the event bus only after the commit succeeded.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;
use hex::{DisplayHex, FromHex};
use log::error;
use rusqlite::{named_params, Connection, OptionalExtension, Row};

use crate::io::events::EventBus;
use crate::io::persist::StoreError;
use crate::swap::status::{SwapStatus, SwapUpdate};
use crate::swap::{
	ChainSwap, ChannelCreation, ChannelCreationStatus, OrderSide, ReverseSwap, Swap, SwapType,
};

const SWAPS_TABLE_NAME: &str = "swaps";
const REVERSE_SWAPS_TABLE_NAME: &str = "reverse_swaps";
const CHAIN_SWAPS_TABLE_NAME: &str = "chain_swaps";
const CHANNEL_CREATIONS_TABLE_NAME: &str = "channel_creations";
const KEY_INDICES_TABLE_NAME: &str = "key_indices";
const TRANSACTION_LABELS_TABLE_NAME: &str = "transaction_labels";

pub struct SwapStore {
	connection: Mutex<Connection>,
	events: Arc<EventBus>,
}

impl SwapStore {
	pub fn new(data_dir: PathBuf, events: Arc<EventBus>) -> Result<Self, StoreError> {
		std::fs::create_dir_all(&data_dir).map_err(|e| StoreError::Corrupt {
			id: String::new(),
			reason: format!("failed to create data dir: {}", e),
		})?;
		let connection = Connection::open(data_dir.join("swapd.sqlite"))?;
		Self::with_connection(connection, events)
	}

	pub fn in_memory(events: Arc<EventBus>) -> Result<Self, StoreError> {
		Self::with_connection(Connection::open_in_memory()?, events)
	}

	fn with_connection(connection: Connection, events: Arc<EventBus>) -> Result<Self, StoreError> {
		connection.execute_batch(&format!(
			"CREATE TABLE IF NOT EXISTS {SWAPS_TABLE_NAME} (
				id TEXT PRIMARY KEY,
				pair TEXT NOT NULL,
				order_side TEXT NOT NULL,
				invoice TEXT NOT NULL,
				preimage_hash TEXT NOT NULL,
				refund_public_key TEXT NOT NULL,
				claim_public_key TEXT NOT NULL,
				claim_key_index INTEGER NOT NULL,
				claim_leaf TEXT NOT NULL,
				refund_leaf TEXT NOT NULL,
				htlc_address TEXT NOT NULL,
				expected_amount_sat INTEGER NOT NULL,
				accept_zero_conf INTEGER NOT NULL,
				timeout_block_height INTEGER NOT NULL,
				lockup_txid TEXT,
				lockup_vout INTEGER,
				onchain_amount_sat INTEGER,
				paid_preimage TEXT,
				status TEXT NOT NULL,
				created_at INTEGER NOT NULL
			);
			CREATE TABLE IF NOT EXISTS {REVERSE_SWAPS_TABLE_NAME} (
				id TEXT PRIMARY KEY,
				pair TEXT NOT NULL,
				order_side TEXT NOT NULL,
				invoice TEXT NOT NULL,
				invoice_amount_sat INTEGER NOT NULL,
				onchain_amount_sat INTEGER NOT NULL,
				preimage_hash TEXT NOT NULL,
				claim_public_key TEXT NOT NULL,
				refund_public_key TEXT NOT NULL,
				refund_key_index INTEGER NOT NULL,
				claim_leaf TEXT NOT NULL,
				refund_leaf TEXT NOT NULL,
				lockup_address TEXT NOT NULL,
				timeout_block_height INTEGER NOT NULL,
				lockup_txid TEXT,
				preimage TEXT,
				status TEXT NOT NULL,
				created_at INTEGER NOT NULL
			);
			CREATE TABLE IF NOT EXISTS {CHAIN_SWAPS_TABLE_NAME} (
				id TEXT PRIMARY KEY,
				pair TEXT NOT NULL,
				order_side TEXT NOT NULL,
				preimage_hash TEXT NOT NULL,
				user_lockup_address TEXT NOT NULL,
				server_lockup_address TEXT NOT NULL,
				user_lockup_amount_sat INTEGER NOT NULL,
				server_lockup_amount_sat INTEGER NOT NULL,
				user_timeout_block_height INTEGER NOT NULL,
				server_timeout_block_height INTEGER NOT NULL,
				status TEXT NOT NULL,
				created_at INTEGER NOT NULL
			);
			CREATE TABLE IF NOT EXISTS {CHANNEL_CREATIONS_TABLE_NAME} (
				swap_id TEXT PRIMARY KEY,
				node_public_key TEXT NOT NULL,
				private INTEGER NOT NULL,
				inbound_liquidity_percent INTEGER NOT NULL,
				funding_txid TEXT,
				funding_vout INTEGER,
				status TEXT NOT NULL
			);
			CREATE TABLE IF NOT EXISTS {KEY_INDICES_TABLE_NAME} (
				symbol TEXT PRIMARY KEY,
				next_index INTEGER NOT NULL
			);
			CREATE TABLE IF NOT EXISTS {TRANSACTION_LABELS_TABLE_NAME} (
				txid TEXT PRIMARY KEY,
				symbol TEXT NOT NULL,
				label TEXT NOT NULL,
				created_at INTEGER NOT NULL
			);"
		))?;
		Ok(Self { connection: Mutex::new(connection), events })
	}

	fn table_for(swap_type: SwapType) -> &'static str {
		match swap_type {
			SwapType::Submarine => SWAPS_TABLE_NAME,
			SwapType::Reverse => REVERSE_SWAPS_TABLE_NAME,
			SwapType::Chain => CHAIN_SWAPS_TABLE_NAME,
		}
	}

	pub fn create_swap(&self, swap: &Swap) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		connection.execute(
			&format!(
				"INSERT INTO {SWAPS_TABLE_NAME} (id, pair, order_side, invoice, preimage_hash,
					refund_public_key, claim_public_key, claim_key_index, claim_leaf, refund_leaf,
					htlc_address, expected_amount_sat, accept_zero_conf, timeout_block_height,
					status, created_at)
				VALUES (:id, :pair, :order_side, :invoice, :preimage_hash, :refund_public_key,
					:claim_public_key, :claim_key_index, :claim_leaf, :refund_leaf, :htlc_address,
					:expected_amount_sat, :accept_zero_conf, :timeout_block_height, :status,
					:created_at)"
			),
			named_params! {
				":id": swap.id,
				":pair": swap.pair,
				":order_side": swap.order_side.to_string(),
				":invoice": swap.invoice,
				":preimage_hash": swap.preimage_hash.to_lower_hex_string(),
				":refund_public_key": swap.refund_public_key.to_string(),
				":claim_public_key": swap.claim_public_key.to_string(),
				":claim_key_index": swap.claim_key_index,
				":claim_leaf": swap.claim_leaf_hex,
				":refund_leaf": swap.refund_leaf_hex,
				":htlc_address": swap.htlc_address,
				":expected_amount_sat": swap.expected_amount_sat,
				":accept_zero_conf": swap.accept_zero_conf,
				":timeout_block_height": swap.timeout_block_height,
				":status": swap.status.as_str(),
				":created_at": swap.created_at,
			},
		)?;
		drop(connection);
		self.events.publish(SwapUpdate::new(&swap.id, swap.status));
		Ok(())
	}

	pub fn create_reverse_swap(&self, swap: &ReverseSwap) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		connection.execute(
			&format!(
				"INSERT INTO {REVERSE_SWAPS_TABLE_NAME} (id, pair, order_side, invoice,
					invoice_amount_sat, onchain_amount_sat, preimage_hash, claim_public_key,
					refund_public_key, refund_key_index, claim_leaf, refund_leaf, lockup_address,
					timeout_block_height, status, created_at)
				VALUES (:id, :pair, :order_side, :invoice, :invoice_amount_sat,
					:onchain_amount_sat, :preimage_hash, :claim_public_key, :refund_public_key,
					:refund_key_index, :claim_leaf, :refund_leaf, :lockup_address,
					:timeout_block_height, :status, :created_at)"
			),
			named_params! {
				":id": swap.id,
				":pair": swap.pair,
				":order_side": swap.order_side.to_string(),
				":invoice": swap.invoice,
				":invoice_amount_sat": swap.invoice_amount_sat,
				":onchain_amount_sat": swap.onchain_amount_sat,
				":preimage_hash": swap.preimage_hash.to_lower_hex_string(),
				":claim_public_key": swap.claim_public_key.to_string(),
				":refund_public_key": swap.refund_public_key.to_string(),
				":refund_key_index": swap.refund_key_index,
				":claim_leaf": swap.claim_leaf_hex,
				":refund_leaf": swap.refund_leaf_hex,
				":lockup_address": swap.lockup_address,
				":timeout_block_height": swap.timeout_block_height,
				":status": swap.status.as_str(),
				":created_at": swap.created_at,
			},
		)?;
		drop(connection);
		self.events.publish(SwapUpdate::new(&swap.id, swap.status));
		Ok(())
	}

	pub fn create_chain_swap(&self, swap: &ChainSwap) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		connection.execute(
			&format!(
				"INSERT INTO {CHAIN_SWAPS_TABLE_NAME} (id, pair, order_side, preimage_hash,
					user_lockup_address, server_lockup_address, user_lockup_amount_sat,
					server_lockup_amount_sat, user_timeout_block_height,
					server_timeout_block_height, status, created_at)
				VALUES (:id, :pair, :order_side, :preimage_hash, :user_lockup_address,
					:server_lockup_address, :user_lockup_amount_sat, :server_lockup_amount_sat,
					:user_timeout_block_height, :server_timeout_block_height, :status,
					:created_at)"
			),
			named_params! {
				":id": swap.id,
				":pair": swap.pair,
				":order_side": swap.order_side.to_string(),
				":preimage_hash": swap.preimage_hash.to_lower_hex_string(),
				":user_lockup_address": swap.user_lockup_address,
				":server_lockup_address": swap.server_lockup_address,
				":user_lockup_amount_sat": swap.user_lockup_amount_sat,
				":server_lockup_amount_sat": swap.server_lockup_amount_sat,
				":user_timeout_block_height": swap.user_timeout_block_height,
				":server_timeout_block_height": swap.server_timeout_block_height,
				":status": swap.status.as_str(),
				":created_at": swap.created_at,
			},
		)?;
		drop(connection);
		self.events.publish(SwapUpdate::new(&swap.id, swap.status));
		Ok(())
	}

	/// Applies a status update after validating it against the predecessor
	/// set of the target status. Rejected transitions leave the record
	/// unchanged and are reported as an invariant violation.
	pub fn set_status(
		&self, swap_type: SwapType, update: SwapUpdate,
	) -> Result<SwapUpdate, StoreError> {
		let table = Self::table_for(swap_type);
		{
			let mut connection = self.connection.lock().unwrap();
			let tx = connection.transaction()?;
			let current: Option<String> = tx
				.query_row(
					&format!("SELECT status FROM {table} WHERE id = :id"),
					named_params! { ":id": update.id },
					|row| row.get(0),
				)
				.optional()?;
			let current = match current {
				Some(current) => parse_status(&update.id, &current)?,
				None => return Err(StoreError::NotFound { id: update.id }),
			};
			if !update.status.can_follow(current) {
				error!(
					"Rejecting illegal status transition for swap {}: {} -> {}",
					update.id, current, update.status
				);
				return Err(StoreError::IllegalTransition {
					id: update.id,
					from: current,
					to: update.status,
				});
			}
			tx.execute(
				&format!("UPDATE {table} SET status = :status WHERE id = :id"),
				named_params! { ":status": update.status.as_str(), ":id": update.id },
			)?;
			tx.commit()?;
		}
		self.events.publish(update.clone());
		Ok(update)
	}

	pub fn set_lockup(
		&self, swap_type: SwapType, id: &str, txid: &Txid, vout: u32, amount_sat: u64,
		accept_zero_conf: bool,
	) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		let updated = match swap_type {
			SwapType::Submarine => connection.execute(
				&format!(
					"UPDATE {SWAPS_TABLE_NAME} SET lockup_txid = :txid, lockup_vout = :vout,
						onchain_amount_sat = :amount, accept_zero_conf = :zero_conf
					WHERE id = :id"
				),
				named_params! {
					":txid": txid.to_string(),
					":vout": vout,
					":amount": amount_sat,
					":zero_conf": accept_zero_conf,
					":id": id,
				},
			)?,
			SwapType::Reverse => connection.execute(
				&format!("UPDATE {REVERSE_SWAPS_TABLE_NAME} SET lockup_txid = :txid WHERE id = :id"),
				named_params! { ":txid": txid.to_string(), ":id": id },
			)?,
			SwapType::Chain => 0,
		};
		if updated == 0 {
			return Err(StoreError::NotFound { id: id.to_string() });
		}
		Ok(())
	}

	pub fn set_invoice(
		&self, id: &str, invoice: &str, preimage_hash: [u8; 32], expected_amount_sat: u64,
	) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		let updated = connection.execute(
			&format!(
				"UPDATE {SWAPS_TABLE_NAME} SET invoice = :invoice, preimage_hash = :hash,
					expected_amount_sat = :amount
				WHERE id = :id"
			),
			named_params! {
				":invoice": invoice,
				":hash": preimage_hash.to_lower_hex_string(),
				":amount": expected_amount_sat,
				":id": id,
			},
		)?;
		if updated == 0 {
			return Err(StoreError::NotFound { id: id.to_string() });
		}
		Ok(())
	}

	pub fn set_preimage(
		&self, swap_type: SwapType, id: &str, preimage: [u8; 32],
	) -> Result<(), StoreError> {
		let column = match swap_type {
			SwapType::Submarine => "paid_preimage",
			SwapType::Reverse => "preimage",
			SwapType::Chain => return Err(StoreError::NotFound { id: id.to_string() }),
		};
		let table = Self::table_for(swap_type);
		let connection = self.connection.lock().unwrap();
		let updated = connection.execute(
			&format!("UPDATE {table} SET {column} = :preimage WHERE id = :id"),
			named_params! { ":preimage": preimage.to_lower_hex_string(), ":id": id },
		)?;
		if updated == 0 {
			return Err(StoreError::NotFound { id: id.to_string() });
		}
		Ok(())
	}

	pub fn get_swap(&self, id: &str) -> Result<Option<Swap>, StoreError> {
		let connection = self.connection.lock().unwrap();
		connection
			.query_row(
				&format!("SELECT * FROM {SWAPS_TABLE_NAME} WHERE id = :id"),
				named_params! { ":id": id },
				row_to_swap,
			)
			.optional()
			.map_err(StoreError::from)
	}

	pub fn get_reverse_swap(&self, id: &str) -> Result<Option<ReverseSwap>, StoreError> {
		let connection = self.connection.lock().unwrap();
		connection
			.query_row(
				&format!("SELECT * FROM {REVERSE_SWAPS_TABLE_NAME} WHERE id = :id"),
				named_params! { ":id": id },
				row_to_reverse_swap,
			)
			.optional()
			.map_err(StoreError::from)
	}

	pub fn get_reverse_swap_by_preimage_hash(
		&self, preimage_hash: [u8; 32],
	) -> Result<Option<ReverseSwap>, StoreError> {
		let connection = self.connection.lock().unwrap();
		connection
			.query_row(
				&format!("SELECT * FROM {REVERSE_SWAPS_TABLE_NAME} WHERE preimage_hash = :hash"),
				named_params! { ":hash": preimage_hash.to_lower_hex_string() },
				row_to_reverse_swap,
			)
			.optional()
			.map_err(StoreError::from)
	}

	/// Looks up the current status of any swap type by id; used by the
	/// status endpoint.
	pub fn get_status(&self, id: &str) -> Result<Option<(SwapType, SwapStatus)>, StoreError> {
		let connection = self.connection.lock().unwrap();
		for (swap_type, table) in [
			(SwapType::Submarine, SWAPS_TABLE_NAME),
			(SwapType::Reverse, REVERSE_SWAPS_TABLE_NAME),
			(SwapType::Chain, CHAIN_SWAPS_TABLE_NAME),
		] {
			let status: Option<String> = connection
				.query_row(
					&format!("SELECT status FROM {table} WHERE id = :id"),
					named_params! { ":id": id },
					|row| row.get(0),
				)
				.optional()?;
			if let Some(status) = status {
				return Ok(Some((swap_type, parse_status(id, &status)?)));
			}
		}
		Ok(None)
	}

	pub fn swaps_by_status(&self, status: SwapStatus) -> Result<Vec<Swap>, StoreError> {
		let connection = self.connection.lock().unwrap();
		let mut statement = connection
			.prepare(&format!("SELECT * FROM {SWAPS_TABLE_NAME} WHERE status = :status"))?;
		let swaps = statement
			.query_map(named_params! { ":status": status.as_str() }, row_to_swap)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(swaps)
	}

	/// All submarine swaps whose lifecycle is not over; re-watched on
	/// startup.
	pub fn pending_swaps(&self) -> Result<Vec<Swap>, StoreError> {
		let connection = self.connection.lock().unwrap();
		let mut statement =
			connection.prepare(&format!("SELECT * FROM {SWAPS_TABLE_NAME}"))?;
		let swaps = statement
			.query_map([], row_to_swap)?
			.collect::<Result<Vec<_>, _>>()?
			.into_iter()
			.filter(|swap: &Swap| !swap.status.is_terminal())
			.collect();
		Ok(swaps)
	}

	pub fn pending_reverse_swaps(&self) -> Result<Vec<ReverseSwap>, StoreError> {
		let connection = self.connection.lock().unwrap();
		let mut statement =
			connection.prepare(&format!("SELECT * FROM {REVERSE_SWAPS_TABLE_NAME}"))?;
		let swaps = statement
			.query_map([], row_to_reverse_swap)?
			.collect::<Result<Vec<_>, _>>()?
			.into_iter()
			.filter(|swap: &ReverseSwap| !swap.status.is_terminal())
			.collect();
		Ok(swaps)
	}

	pub fn set_channel_creation(&self, creation: &ChannelCreation) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		connection.execute(
			&format!(
				"INSERT INTO {CHANNEL_CREATIONS_TABLE_NAME} (swap_id, node_public_key, private,
					inbound_liquidity_percent, funding_txid, funding_vout, status)
				VALUES (:swap_id, :node_public_key, :private, :inbound_liquidity_percent,
					:funding_txid, :funding_vout, :status)
				ON CONFLICT(swap_id) DO UPDATE SET status = :status"
			),
			named_params! {
				":swap_id": creation.swap_id,
				":node_public_key": creation.node_public_key.to_string(),
				":private": creation.private,
				":inbound_liquidity_percent": creation.inbound_liquidity_percent,
				":funding_txid": creation.funding_txid.map(|txid| txid.to_string()),
				":funding_vout": creation.funding_vout,
				":status": creation.status.as_str(),
			},
		)?;
		Ok(())
	}

	pub fn set_channel_status(
		&self, swap_id: &str, status: ChannelCreationStatus,
	) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		let updated = connection.execute(
			&format!("UPDATE {CHANNEL_CREATIONS_TABLE_NAME} SET status = :status WHERE swap_id = :id"),
			named_params! { ":status": status.as_str(), ":id": swap_id },
		)?;
		if updated == 0 {
			return Err(StoreError::NotFound { id: swap_id.to_string() });
		}
		Ok(())
	}

	pub fn set_channel_funding(
		&self, swap_id: &str, funding_txid: &Txid, funding_vout: u32,
	) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		let updated = connection.execute(
			&format!(
				"UPDATE {CHANNEL_CREATIONS_TABLE_NAME} SET funding_txid = :txid,
					funding_vout = :vout
				WHERE swap_id = :id"
			),
			named_params! {
				":txid": funding_txid.to_string(),
				":vout": funding_vout,
				":id": swap_id,
			},
		)?;
		if updated == 0 {
			return Err(StoreError::NotFound { id: swap_id.to_string() });
		}
		Ok(())
	}

	pub fn get_channel_creation(
		&self, swap_id: &str,
	) -> Result<Option<ChannelCreation>, StoreError> {
		let connection = self.connection.lock().unwrap();
		connection
			.query_row(
				&format!("SELECT * FROM {CHANNEL_CREATIONS_TABLE_NAME} WHERE swap_id = :id"),
				named_params! { ":id": swap_id },
				row_to_channel_creation,
			)
			.optional()
			.map_err(StoreError::from)
	}

	pub fn channel_creation_by_funding(
		&self, funding_txid: &Txid,
	) -> Result<Option<ChannelCreation>, StoreError> {
		let connection = self.connection.lock().unwrap();
		connection
			.query_row(
				&format!("SELECT * FROM {CHANNEL_CREATIONS_TABLE_NAME} WHERE funding_txid = :txid"),
				named_params! { ":txid": funding_txid.to_string() },
				row_to_channel_creation,
			)
			.optional()
			.map_err(StoreError::from)
	}

	pub fn channel_creations_by_status(
		&self, status: ChannelCreationStatus,
	) -> Result<Vec<ChannelCreation>, StoreError> {
		let connection = self.connection.lock().unwrap();
		let mut statement = connection.prepare(&format!(
			"SELECT * FROM {CHANNEL_CREATIONS_TABLE_NAME} WHERE status = :status"
		))?;
		let creations = statement
			.query_map(named_params! { ":status": status.as_str() }, row_to_channel_creation)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(creations)
	}

	/// Returns the next derivation index for the symbol and advances the
	/// cursor, so service keys are never reused.
	pub fn next_key_index(&self, symbol: &str) -> Result<u32, StoreError> {
		let mut connection = self.connection.lock().unwrap();
		let tx = connection.transaction()?;
		let current: Option<u32> = tx
			.query_row(
				&format!("SELECT next_index FROM {KEY_INDICES_TABLE_NAME} WHERE symbol = :symbol"),
				named_params! { ":symbol": symbol },
				|row| row.get(0),
			)
			.optional()?;
		let index = current.unwrap_or(0);
		tx.execute(
			&format!(
				"INSERT INTO {KEY_INDICES_TABLE_NAME} (symbol, next_index)
				VALUES (:symbol, :next)
				ON CONFLICT(symbol) DO UPDATE SET next_index = :next"
			),
			named_params! { ":symbol": symbol, ":next": index + 1 },
		)?;
		tx.commit()?;
		Ok(index)
	}

	pub fn add_transaction_label(
		&self, txid: &Txid, symbol: &str, label: &str,
	) -> Result<(), StoreError> {
		let connection = self.connection.lock().unwrap();
		connection.execute(
			&format!(
				"INSERT OR REPLACE INTO {TRANSACTION_LABELS_TABLE_NAME}
					(txid, symbol, label, created_at)
				VALUES (:txid, :symbol, :label, :created_at)"
			),
			named_params! {
				":txid": txid.to_string(),
				":symbol": symbol,
				":label": label,
				":created_at": chrono::Utc::now().timestamp(),
			},
		)?;
		Ok(())
	}
}

fn parse_status(id: &str, status: &str) -> Result<SwapStatus, StoreError> {
	status.parse().map_err(|_| StoreError::Corrupt {
		id: id.to_string(),
		reason: format!("unknown status {status}"),
	})
}

fn parse_column<T: FromStr>(row: &Row, column: &str) -> Result<T, rusqlite::Error> {
	let value: String = row.get(column)?;
	value.parse::<T>().map_err(|_| invalid_column(column))
}

fn parse_optional_column<T: FromStr>(
	row: &Row, column: &str,
) -> Result<Option<T>, rusqlite::Error> {
	let value: Option<String> = row.get(column)?;
	value.map(|value| value.parse::<T>().map_err(|_| invalid_column(column))).transpose()
}

fn parse_hash_column(row: &Row, column: &str) -> Result<[u8; 32], rusqlite::Error> {
	let value: String = row.get(column)?;
	let bytes = Vec::<u8>::from_hex(&value).map_err(|_| invalid_column(column))?;
	bytes.try_into().map_err(|_| invalid_column(column))
}

fn parse_optional_hash_column(
	row: &Row, column: &str,
) -> Result<Option<[u8; 32]>, rusqlite::Error> {
	let value: Option<String> = row.get(column)?;
	match value {
		Some(value) => {
			let bytes = Vec::<u8>::from_hex(&value).map_err(|_| invalid_column(column))?;
			Ok(Some(bytes.try_into().map_err(|_| invalid_column(column))?))
		},
		None => Ok(None),
	}
}

fn invalid_column(column: &str) -> rusqlite::Error {
	rusqlite::Error::InvalidColumnName(column.to_string())
}

fn row_to_swap(row: &Row) -> Result<Swap, rusqlite::Error> {
	Ok(Swap {
		id: row.get("id")?,
		pair: row.get("pair")?,
		order_side: parse_column::<OrderSide>(row, "order_side")?,
		invoice: row.get("invoice")?,
		preimage_hash: parse_hash_column(row, "preimage_hash")?,
		refund_public_key: parse_column::<PublicKey>(row, "refund_public_key")?,
		claim_public_key: parse_column::<PublicKey>(row, "claim_public_key")?,
		claim_key_index: row.get("claim_key_index")?,
		claim_leaf_hex: row.get("claim_leaf")?,
		refund_leaf_hex: row.get("refund_leaf")?,
		htlc_address: row.get("htlc_address")?,
		expected_amount_sat: row.get("expected_amount_sat")?,
		accept_zero_conf: row.get("accept_zero_conf")?,
		timeout_block_height: row.get("timeout_block_height")?,
		lockup_txid: parse_optional_column::<Txid>(row, "lockup_txid")?,
		lockup_vout: row.get("lockup_vout")?,
		onchain_amount_sat: row.get("onchain_amount_sat")?,
		paid_preimage: parse_optional_hash_column(row, "paid_preimage")?,
		status: parse_column::<SwapStatus>(row, "status")?,
		created_at: row.get("created_at")?,
	})
}

fn row_to_reverse_swap(row: &Row) -> Result<ReverseSwap, rusqlite::Error> {
	Ok(ReverseSwap {
		id: row.get("id")?,
		pair: row.get("pair")?,
		order_side: parse_column::<OrderSide>(row, "order_side")?,
		invoice: row.get("invoice")?,
		invoice_amount_sat: row.get("invoice_amount_sat")?,
		onchain_amount_sat: row.get("onchain_amount_sat")?,
		preimage_hash: parse_hash_column(row, "preimage_hash")?,
		claim_public_key: parse_column::<PublicKey>(row, "claim_public_key")?,
		refund_public_key: parse_column::<PublicKey>(row, "refund_public_key")?,
		refund_key_index: row.get("refund_key_index")?,
		claim_leaf_hex: row.get("claim_leaf")?,
		refund_leaf_hex: row.get("refund_leaf")?,
		lockup_address: row.get("lockup_address")?,
		timeout_block_height: row.get("timeout_block_height")?,
		lockup_txid: parse_optional_column::<Txid>(row, "lockup_txid")?,
		preimage: parse_optional_hash_column(row, "preimage")?,
		status: parse_column::<SwapStatus>(row, "status")?,
		created_at: row.get("created_at")?,
	})
}

fn row_to_channel_creation(row: &Row) -> Result<ChannelCreation, rusqlite::Error> {
	Ok(ChannelCreation {
		swap_id: row.get("swap_id")?,
		node_public_key: parse_column::<PublicKey>(row, "node_public_key")?,
		private: row.get("private")?,
		inbound_liquidity_percent: row.get("inbound_liquidity_percent")?,
		funding_txid: parse_optional_column::<Txid>(row, "funding_txid")?,
		funding_vout: row.get("funding_vout")?,
		status: parse_column::<ChannelCreationStatus>(row, "status")?,
	})
}

#[cfg(test)]
pub(crate) mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::swap::generate_swap_id;

	pub(crate) fn test_swap(id: &str) -> Swap {
		let refund_public_key: PublicKey =
			"0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
				.parse()
				.unwrap();
		Swap {
			id: id.to_string(),
			pair: "BTC/BTC".to_string(),
			order_side: OrderSide::Sell,
			invoice: "lnbcrt10m1example".to_string(),
			preimage_hash: [7u8; 32],
			refund_public_key,
			claim_public_key:
				"02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
					.parse()
					.unwrap(),
			claim_key_index: 0,
			claim_leaf_hex: "51".to_string(),
			refund_leaf_hex: "52".to_string(),
			htlc_address: "bcrt1qexample".to_string(),
			expected_amount_sat: 1_000_000,
			accept_zero_conf: false,
			timeout_block_height: 1_000,
			lockup_txid: None,
			lockup_vout: None,
			onchain_amount_sat: None,
			paid_preimage: None,
			status: SwapStatus::SwapCreated,
			created_at: 1_700_000_000,
		}
	}

	fn store() -> SwapStore {
		SwapStore::in_memory(Arc::new(EventBus::new(64))).unwrap()
	}

	#[test]
	fn test_create_and_read_back() {
		let store = store();
		let swap = test_swap(&generate_swap_id());
		store.create_swap(&swap).unwrap();

		let read = store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.id, swap.id);
		assert_eq!(read.preimage_hash, swap.preimage_hash);
		assert_eq!(read.refund_public_key, swap.refund_public_key);
		assert_eq!(read.status, SwapStatus::SwapCreated);
		assert_eq!(read.lockup_txid, None);
	}

	#[test]
	fn test_set_status_enforces_predecessors() {
		let store = store();
		let swap = test_swap("aaaaaaaaaaaaaaaa");
		store.create_swap(&swap).unwrap();

		// Legal: created -> mempool -> confirmed.
		store
			.set_status(
				SwapType::Submarine,
				SwapUpdate::new(&swap.id, SwapStatus::TransactionMempool),
			)
			.unwrap();
		store
			.set_status(
				SwapType::Submarine,
				SwapUpdate::new(&swap.id, SwapStatus::TransactionConfirmed),
			)
			.unwrap();

		// Illegal: confirmed -> claimed without paying the invoice first is
		// fine for reverse swaps but a submarine claim requires InvoicePaid;
		// claimed does allow confirmed as predecessor, so use an actually
		// illegal one: confirmed -> created.
		let err = store
			.set_status(SwapType::Submarine, SwapUpdate::new(&swap.id, SwapStatus::SwapCreated))
			.unwrap_err();
		assert!(matches!(err, StoreError::IllegalTransition { .. }));

		// The record is unchanged.
		let read = store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.status, SwapStatus::TransactionConfirmed);
	}

	#[test]
	fn test_set_status_publishes_on_success_only() {
		let events = Arc::new(EventBus::new(64));
		let store = SwapStore::with_connection(Connection::open_in_memory().unwrap(), events.clone())
			.unwrap();
		let swap = test_swap("bbbbbbbbbbbbbbbb");
		store.create_swap(&swap).unwrap();

		store
			.set_status(
				SwapType::Submarine,
				SwapUpdate::new(&swap.id, SwapStatus::TransactionMempool),
			)
			.unwrap();
		assert_eq!(events.latest(&swap.id).unwrap().status, SwapStatus::TransactionMempool);

		let _ = store
			.set_status(SwapType::Submarine, SwapUpdate::new(&swap.id, SwapStatus::SwapCreated));
		assert_eq!(events.latest(&swap.id).unwrap().status, SwapStatus::TransactionMempool);
	}

	#[test]
	fn test_set_status_unknown_swap() {
		let store = store();
		let err = store
			.set_status(SwapType::Submarine, SwapUpdate::new("missing", SwapStatus::SwapExpired))
			.unwrap_err();
		assert!(matches!(err, StoreError::NotFound { .. }));
	}

	#[test]
	fn test_lockup_and_preimage_round_trip() {
		let store = store();
		let swap = test_swap("cccccccccccccccc");
		store.create_swap(&swap).unwrap();

		let txid: Txid = "059a4a673f9984e236037b04317f7d042378227bfdd82e12dd55b0bf67a6773e"
			.parse()
			.unwrap();
		store.set_lockup(SwapType::Submarine, &swap.id, &txid, 1, 1_000_000, true).unwrap();
		store.set_preimage(SwapType::Submarine, &swap.id, [1u8; 32]).unwrap();

		let read = store.get_swap(&swap.id).unwrap().unwrap();
		assert_eq!(read.lockup_txid, Some(txid));
		assert_eq!(read.lockup_vout, Some(1));
		assert_eq!(read.onchain_amount_sat, Some(1_000_000));
		assert!(read.accept_zero_conf);
		assert_eq!(read.paid_preimage, Some([1u8; 32]));
	}

	#[test]
	fn test_chain_swap_round_trip() {
		let store = store();
		let swap = ChainSwap {
			id: "eeeeeeeeeeeeeeee".to_string(),
			pair: "BTC/L-BTC".to_string(),
			order_side: OrderSide::Buy,
			preimage_hash: [9u8; 32],
			user_lockup_address: "bcrt1quser".to_string(),
			server_lockup_address: "bcrt1qserver".to_string(),
			user_lockup_amount_sat: 250_000,
			server_lockup_amount_sat: 248_000,
			user_timeout_block_height: 800_288,
			server_timeout_block_height: 800_144,
			status: SwapStatus::SwapCreated,
			created_at: 1_700_000_000,
		};
		store.create_chain_swap(&swap).unwrap();

		assert_eq!(
			store.get_status(&swap.id).unwrap(),
			Some((SwapType::Chain, SwapStatus::SwapCreated))
		);
		store
			.set_status(SwapType::Chain, SwapUpdate::new(&swap.id, SwapStatus::TransactionMempool))
			.unwrap();
		assert_eq!(
			store.get_status(&swap.id).unwrap(),
			Some((SwapType::Chain, SwapStatus::TransactionMempool))
		);
	}

	#[test]
	fn test_key_index_cursor_advances() {
		let store = store();
		assert_eq!(store.next_key_index("BTC").unwrap(), 0);
		assert_eq!(store.next_key_index("BTC").unwrap(), 1);
		assert_eq!(store.next_key_index("L-BTC").unwrap(), 0);
		assert_eq!(store.next_key_index("BTC").unwrap(), 2);
	}

	#[test]
	fn test_channel_creation_round_trip() {
		let store = store();
		let swap = test_swap("dddddddddddddddd");
		store.create_swap(&swap).unwrap();

		let creation = ChannelCreation {
			swap_id: swap.id.clone(),
			node_public_key:
				"0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
					.parse()
					.unwrap(),
			private: true,
			inbound_liquidity_percent: 25,
			funding_txid: None,
			funding_vout: None,
			status: ChannelCreationStatus::Attempted,
		};
		store.set_channel_creation(&creation).unwrap();

		let txid: Txid = "059a4a673f9984e236037b04317f7d042378227bfdd82e12dd55b0bf67a6773e"
			.parse()
			.unwrap();
		store.set_channel_funding(&swap.id, &txid, 1).unwrap();
		store.set_channel_status(&swap.id, ChannelCreationStatus::Created).unwrap();

		let read = store.get_channel_creation(&swap.id).unwrap().unwrap();
		assert_eq!(read.funding_txid, Some(txid));
		assert_eq!(read.funding_vout, Some(1));
		assert_eq!(read.status, ChannelCreationStatus::Created);

		let created = store.channel_creations_by_status(ChannelCreationStatus::Created).unwrap();
		assert_eq!(created.len(), 1);
		assert_eq!(created[0].swap_id, swap.id);
	}
}
