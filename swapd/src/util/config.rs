// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::net::SocketAddr;
use std::str::FromStr;
use std::{fs, io};

use bitcoin::Network;
use clap::Parser;
use log::LevelFilter;
use serde::Deserialize;

use crate::swap::Pair;

/// Configuration for the swap daemon.
#[derive(Debug)]
pub struct Config {
	pub network: Network,
	pub rest_service_addr: SocketAddr,
	pub storage_dir_path: String,
	pub bitcoind_rpc_addr: SocketAddr,
	pub bitcoind_rpc_user: String,
	pub bitcoind_rpc_password: String,
	pub lightning_rpc_addr: String,
	pub lightning_macaroon_path: Option<String>,
	/// File holding the BIP32 seed the service swap keys derive from.
	pub seed_file_path: String,
	pub log_level: LevelFilter,
	pub log_file_path: Option<String>,
	pub pairs: Vec<Pair>,
}

/// A builder for `Config`.
#[derive(Default)]
struct ConfigBuilder {
	network: Option<Network>,
	rest_service_address: Option<String>,
	storage_dir_path: Option<String>,
	bitcoind_rpc_addr: Option<String>,
	bitcoind_rpc_user: Option<String>,
	bitcoind_rpc_password: Option<String>,
	lightning_rpc_addr: Option<String>,
	lightning_macaroon_path: Option<String>,
	seed_file_path: Option<String>,
	log_level: Option<String>,
	log_file_path: Option<String>,
	pairs: Vec<PairTomlConfig>,
}

impl ConfigBuilder {
	fn merge_toml(&mut self, toml: TomlConfig) {
		if let Some(node) = toml.node {
			self.network = node.network.or(self.network);
			self.rest_service_address =
				node.rest_service_address.or(self.rest_service_address.clone());
		}

		if let Some(storage) = toml.storage {
			self.storage_dir_path =
				storage.disk.and_then(|d| d.dir_path).or(self.storage_dir_path.clone());
		}

		if let Some(bitcoind) = toml.bitcoind {
			self.bitcoind_rpc_addr = bitcoind.rpc_address.or(self.bitcoind_rpc_addr.clone());
			self.bitcoind_rpc_user = bitcoind.rpc_user.or(self.bitcoind_rpc_user.clone());
			self.bitcoind_rpc_password =
				bitcoind.rpc_password.or(self.bitcoind_rpc_password.clone());
		}

		if let Some(lightning) = toml.lightning {
			self.lightning_rpc_addr = Some(lightning.rpc_address);
			self.lightning_macaroon_path =
				lightning.macaroon_path.or(self.lightning_macaroon_path.clone());
		}

		if let Some(swap) = toml.swap {
			self.seed_file_path = swap.seed_file.or(self.seed_file_path.clone());
		}

		if let Some(log) = toml.log {
			self.log_level = log.level.or(self.log_level.clone());
			self.log_file_path = log.file.or(self.log_file_path.clone());
		}

		if let Some(pairs) = toml.pair {
			self.pairs = pairs;
		}
	}

	fn merge_args(&mut self, args: &ArgsConfig) {
		if let Some(network) = args.network {
			self.network = Some(network);
		}

		if let Some(rest_service_address) = &args.rest_service_address {
			self.rest_service_address = Some(rest_service_address.clone());
		}

		if let Some(bitcoind_rpc_address) = &args.bitcoind_rpc_address {
			self.bitcoind_rpc_addr = Some(bitcoind_rpc_address.clone());
		}

		if let Some(bitcoind_rpc_user) = &args.bitcoind_rpc_user {
			self.bitcoind_rpc_user = Some(bitcoind_rpc_user.clone());
		}

		if let Some(bitcoind_rpc_password) = &args.bitcoind_rpc_password {
			self.bitcoind_rpc_password = Some(bitcoind_rpc_password.clone());
		}

		if let Some(lightning_rpc_address) = &args.lightning_rpc_address {
			self.lightning_rpc_addr = Some(lightning_rpc_address.clone());
		}

		if let Some(storage_dir_path) = &args.storage_dir_path {
			self.storage_dir_path = Some(storage_dir_path.clone());
		}

		if let Some(seed_file_path) = &args.seed_file_path {
			self.seed_file_path = Some(seed_file_path.clone());
		}
	}

	fn build(self) -> io::Result<Config> {
		let network = self.network.ok_or_else(|| missing_field_err("network"))?;

		let rest_service_addr = self
			.rest_service_address
			.ok_or_else(|| missing_field_err("rest_service_address"))?
			.parse::<SocketAddr>()
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

		let bitcoind_rpc_addr = self
			.bitcoind_rpc_addr
			.ok_or_else(|| missing_field_err("bitcoind_rpc_address"))?
			.parse::<SocketAddr>()
			.map_err(|e| {
				io::Error::new(io::ErrorKind::InvalidInput, format!("Invalid RPC addr: {}", e))
			})?;

		let bitcoind_rpc_user =
			self.bitcoind_rpc_user.ok_or_else(|| missing_field_err("bitcoind_rpc_user"))?;
		let bitcoind_rpc_password = self
			.bitcoind_rpc_password
			.ok_or_else(|| missing_field_err("bitcoind_rpc_password"))?;

		let lightning_rpc_addr = self
			.lightning_rpc_addr
			.ok_or_else(|| missing_field_err("lightning_rpc_address"))?;

		let seed_file_path =
			self.seed_file_path.ok_or_else(|| missing_field_err("seed_file"))?;

		let log_level = self
			.log_level
			.as_ref()
			.map(|level_str| {
				LevelFilter::from_str(level_str).map_err(|e| {
					io::Error::new(
						io::ErrorKind::InvalidInput,
						format!("Invalid log level configured: {}", e),
					)
				})
			})
			.transpose()?
			.unwrap_or(LevelFilter::Debug);

		let pairs = if self.pairs.is_empty() {
			vec![PairTomlConfig::default()]
		} else {
			self.pairs
		};
		let pairs = pairs.into_iter().map(Pair::from).collect();

		Ok(Config {
			network,
			rest_service_addr,
			storage_dir_path: self.storage_dir_path.unwrap_or_else(|| "./data".to_string()),
			bitcoind_rpc_addr,
			bitcoind_rpc_user,
			bitcoind_rpc_password,
			lightning_rpc_addr,
			lightning_macaroon_path: self.lightning_macaroon_path,
			seed_file_path,
			log_level,
			log_file_path: self.log_file_path,
			pairs,
		})
	}
}

/// Configuration loaded from a TOML file.
#[derive(Deserialize)]
pub struct TomlConfig {
	node: Option<NodeConfig>,
	storage: Option<StorageConfig>,
	bitcoind: Option<BitcoindConfig>,
	lightning: Option<LightningConfig>,
	swap: Option<SwapConfig>,
	log: Option<LogConfig>,
	pair: Option<Vec<PairTomlConfig>>,
}

#[derive(Deserialize)]
struct NodeConfig {
	network: Option<Network>,
	rest_service_address: Option<String>,
}

#[derive(Deserialize)]
struct StorageConfig {
	disk: Option<DiskConfig>,
}

#[derive(Deserialize)]
struct DiskConfig {
	dir_path: Option<String>,
}

#[derive(Deserialize)]
struct BitcoindConfig {
	rpc_address: Option<String>,
	rpc_user: Option<String>,
	rpc_password: Option<String>,
}

#[derive(Deserialize)]
struct LightningConfig {
	rpc_address: String,
	macaroon_path: Option<String>,
}

#[derive(Deserialize)]
struct SwapConfig {
	seed_file: Option<String>,
}

#[derive(Deserialize)]
struct LogConfig {
	level: Option<String>,
	file: Option<String>,
}

#[derive(Deserialize)]
struct PairTomlConfig {
	base: String,
	quote: String,
	#[serde(default = "default_rate_ppm")]
	rate_ppm: u64,
	#[serde(default = "default_fee_bps")]
	fee_percentage_bps: u32,
	#[serde(default = "default_min_amount")]
	min_amount_sat: u64,
	#[serde(default = "default_max_amount")]
	max_amount_sat: u64,
	#[serde(default = "default_max_zero_conf")]
	max_zero_conf_amount_sat: u64,
	#[serde(default = "default_true")]
	zero_conf_enabled: bool,
	#[serde(default = "default_min_lockup_fee")]
	min_lockup_fee_sat_vbyte: u64,
	#[serde(default = "default_claim_miner_fee")]
	claim_miner_fee_sat: u64,
	#[serde(default = "default_timeout_submarine")]
	timeout_delta_submarine: u32,
	#[serde(default = "default_timeout_reverse")]
	timeout_delta_reverse: u32,
	#[serde(default)]
	prepay_miner_fee: bool,
}

impl Default for PairTomlConfig {
	fn default() -> Self {
		Self {
			base: "BTC".to_string(),
			quote: "BTC".to_string(),
			rate_ppm: default_rate_ppm(),
			fee_percentage_bps: default_fee_bps(),
			min_amount_sat: default_min_amount(),
			max_amount_sat: default_max_amount(),
			max_zero_conf_amount_sat: default_max_zero_conf(),
			zero_conf_enabled: true,
			min_lockup_fee_sat_vbyte: default_min_lockup_fee(),
			claim_miner_fee_sat: default_claim_miner_fee(),
			timeout_delta_submarine: default_timeout_submarine(),
			timeout_delta_reverse: default_timeout_reverse(),
			prepay_miner_fee: false,
		}
	}
}

impl From<PairTomlConfig> for Pair {
	fn from(config: PairTomlConfig) -> Self {
		Pair {
			base: config.base,
			quote: config.quote,
			rate_ppm: config.rate_ppm,
			fee_percentage_bps: config.fee_percentage_bps,
			min_amount_sat: config.min_amount_sat,
			max_amount_sat: config.max_amount_sat,
			max_zero_conf_amount_sat: config.max_zero_conf_amount_sat,
			zero_conf_enabled: config.zero_conf_enabled,
			min_lockup_fee_sat_vbyte: config.min_lockup_fee_sat_vbyte,
			claim_miner_fee_sat: config.claim_miner_fee_sat,
			timeout_delta_submarine: config.timeout_delta_submarine,
			timeout_delta_reverse: config.timeout_delta_reverse,
			prepay_miner_fee: config.prepay_miner_fee,
		}
	}
}

fn default_rate_ppm() -> u64 {
	1_000_000
}
fn default_fee_bps() -> u32 {
	40
}
fn default_min_amount() -> u64 {
	10_000
}
fn default_max_amount() -> u64 {
	4_294_967
}
fn default_max_zero_conf() -> u64 {
	100_000
}
fn default_true() -> bool {
	true
}
fn default_min_lockup_fee() -> u64 {
	2
}
fn default_claim_miner_fee() -> u64 {
	1_000
}
fn default_timeout_submarine() -> u32 {
	1_008
}
fn default_timeout_reverse() -> u32 {
	144
}

#[derive(Parser, Debug)]
#[command(
	version,
	about = "Swap Daemon Configuration",
	long_about = None,
	override_usage = "swapd [config_path]"
)]
pub struct ArgsConfig {
	#[arg(required = false, help = "The configuration file for running the swap daemon.")]
	config_file: Option<String>,

	#[arg(long, env = "SWAPD_NETWORK", help = "The Bitcoin network to operate on.")]
	network: Option<Network>,

	#[arg(
		long,
		env = "SWAPD_REST_SERVICE_ADDRESS",
		help = "The address the REST API listens on."
	)]
	rest_service_address: Option<String>,

	#[arg(long, env = "SWAPD_BITCOIND_RPC_ADDRESS", help = "The Bitcoin node RPC address.")]
	bitcoind_rpc_address: Option<String>,

	#[arg(long, env = "SWAPD_BITCOIND_RPC_USER", help = "The Bitcoin node RPC user.")]
	bitcoind_rpc_user: Option<String>,

	#[arg(long, env = "SWAPD_BITCOIND_RPC_PASSWORD", help = "The Bitcoin node RPC password.")]
	bitcoind_rpc_password: Option<String>,

	#[arg(
		long,
		env = "SWAPD_LIGHTNING_RPC_ADDRESS",
		help = "The Lightning node RPC address."
	)]
	lightning_rpc_address: Option<String>,

	#[arg(long, env = "SWAPD_STORAGE_DIR_PATH", help = "The path where swapd persists its data.")]
	storage_dir_path: Option<String>,

	#[arg(long, env = "SWAPD_SEED_FILE", help = "File holding the BIP32 seed for swap keys.")]
	seed_file_path: Option<String>,
}

pub fn load_config(args: &ArgsConfig) -> io::Result<Config> {
	let mut builder = ConfigBuilder::default();

	if let Some(path) = &args.config_file {
		let content = fs::read_to_string(path).map_err(|e| {
			io::Error::new(e.kind(), format!("Failed to read config file '{:?}': {}", path, e))
		})?;
		let toml_config: TomlConfig = toml::from_str(&content).map_err(|e| {
			io::Error::new(
				io::ErrorKind::InvalidData,
				format!("Config file contains invalid TOML format: {}", e),
			)
		})?;

		builder.merge_toml(toml_config);
	}

	builder.merge_args(args);

	builder.build()
}

fn missing_field_err(field: &str) -> io::Error {
	io::Error::new(
		io::ErrorKind::InvalidInput,
		format!(
			"Missing `{}`. Please provide it via config file, CLI argument, or environment variable.",
			field
		),
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	const DEFAULT_CONFIG: &str = r#"
				[node]
				network = "regtest"
				rest_service_address = "127.0.0.1:9001"

				[storage.disk]
				dir_path = "/tmp/swapd"

				[log]
				level = "Trace"
				file = "/var/log/swapd.log"

				[bitcoind]
				rpc_address = "127.0.0.1:18443"
				rpc_user = "bitcoind-testuser"
				rpc_password = "bitcoind-testpassword"

				[lightning]
				rpc_address = "https://127.0.0.1:10009"

				[swap]
				seed_file = "/tmp/swapd/seed"

				[[pair]]
				base = "BTC"
				quote = "BTC"
				fee_percentage_bps = 50
				max_zero_conf_amount_sat = 200000
				"#;

	fn empty_args_config() -> ArgsConfig {
		ArgsConfig {
			config_file: None,
			network: None,
			rest_service_address: None,
			bitcoind_rpc_address: None,
			bitcoind_rpc_user: None,
			bitcoind_rpc_password: None,
			lightning_rpc_address: None,
			storage_dir_path: None,
			seed_file_path: None,
		}
	}

	#[test]
	fn test_config_from_file() {
		let storage_path = std::env::temp_dir();
		let config_file_name = "test_swapd_config_from_file.toml";

		fs::write(storage_path.join(config_file_name), DEFAULT_CONFIG).unwrap();

		let mut args_config = empty_args_config();
		args_config.config_file =
			Some(storage_path.join(config_file_name).to_string_lossy().to_string());

		let config = load_config(&args_config).unwrap();

		assert_eq!(config.network, Network::Regtest);
		assert_eq!(config.rest_service_addr, "127.0.0.1:9001".parse().unwrap());
		assert_eq!(config.storage_dir_path, "/tmp/swapd");
		assert_eq!(config.bitcoind_rpc_user, "bitcoind-testuser");
		assert_eq!(config.lightning_rpc_addr, "https://127.0.0.1:10009");
		assert_eq!(config.log_level, LevelFilter::Trace);
		assert_eq!(config.log_file_path.as_deref(), Some("/var/log/swapd.log"));
		assert_eq!(config.pairs.len(), 1);
		assert_eq!(config.pairs[0].fee_percentage_bps, 50);
		assert_eq!(config.pairs[0].max_zero_conf_amount_sat, 200_000);
		// Unset pair fields fall back to their defaults.
		assert_eq!(config.pairs[0].timeout_delta_submarine, 1_008);
	}

	#[test]
	fn test_config_missing_fields_in_file() {
		let storage_path = std::env::temp_dir();
		let config_file_name = "test_swapd_config_missing_fields.toml";

		let mut args_config = empty_args_config();
		args_config.config_file =
			Some(storage_path.join(config_file_name).to_string_lossy().to_string());

		macro_rules! validate_missing {
			($field:expr, $err_field:expr) => {
				let toml_config = DEFAULT_CONFIG
					.lines()
					.filter(|line| !line.trim_start().starts_with($field))
					.collect::<Vec<_>>()
					.join("\n");
				fs::write(storage_path.join(config_file_name), &toml_config).unwrap();
				let result = load_config(&args_config);
				assert!(result.is_err());
				let err = result.unwrap_err();
				assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
				assert!(err.to_string().contains($err_field), "{}", err);
			};
		}

		validate_missing!("network =", "network");
		validate_missing!("rest_service_address =", "rest_service_address");
		validate_missing!("rpc_password", "bitcoind_rpc_password");
		validate_missing!("seed_file =", "seed_file");

		// Dropping the whole [lightning] table is an error as well.
		let toml_config = DEFAULT_CONFIG
			.replace("[lightning]", "")
			.replace("rpc_address = \"https://127.0.0.1:10009\"", "");
		fs::write(storage_path.join(config_file_name), &toml_config).unwrap();
		let err = load_config(&args_config).unwrap_err();
		assert!(err.to_string().contains("lightning_rpc_address"), "{}", err);
	}

	#[test]
	fn test_args_config_overrides_file() {
		let storage_path = std::env::temp_dir();
		let config_file_name = "test_swapd_args_override.toml";

		fs::write(storage_path.join(config_file_name), DEFAULT_CONFIG).unwrap();

		let mut args_config = empty_args_config();
		args_config.config_file =
			Some(storage_path.join(config_file_name).to_string_lossy().to_string());
		args_config.network = Some(Network::Signet);
		args_config.rest_service_address = Some("127.0.0.1:9999".to_string());

		let config = load_config(&args_config).unwrap();
		assert_eq!(config.network, Network::Signet);
		assert_eq!(config.rest_service_addr, "127.0.0.1:9999".parse().unwrap());
		// Values not overridden keep the file's settings.
		assert_eq!(config.bitcoind_rpc_user, "bitcoind-testuser");
	}
}
