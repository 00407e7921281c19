use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

use tx_broadcaster_core::{
	api::ApiConfig,
	node::NodeConfig,
	store::postgres::PostgresConfig,
	types::{DispatcherConfig, WorkerConfig},
};

/// Representation of a configuration used by this project.
///
/// All durations are in milliseconds.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	#[serde(flatten)]
	pub api: ApiConfig,
	#[serde(flatten)]
	pub postgres: PostgresConfig,
	/// Base URL of the blockchain node.
	pub node_url: String,
	/// API key for the node's protected debug endpoints.
	pub node_api_key: String,
	/// Pause between the dispatcher's work-discovery passes (default: 1000).
	pub loop_delay: u64,
	/// Lease age after which a `processing` sequence may be taken over by
	/// another instance (default: 5000).
	pub sequence_ttl: u64,
	/// Grace window within which another worker's `processing` transaction
	/// row is left alone (default: 3000).
	pub tx_processing_ttl: u64,
	/// Number of heights the chain must advance past the last confirmation
	/// before a sequence is declared done (default: 6).
	pub heights_after_last_tx: i32,
	/// Delay between chain height polls (default: 1000).
	pub wait_for_next_height_delay: u64,
	/// Age at which a transaction's embedded timestamp makes it permanently
	/// invalid (default: 14400000, i.e. 4 hours).
	pub tx_outdate_time: u64,
	/// Delay between transaction status polls (default: 1000).
	pub wait_for_tx_status_delay: u64,
	/// Deadline of a single confirmation wait (default: 90000).
	pub wait_for_tx_timeout: u64,
	/// Log level (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format. Otherwise, plain
	/// text format is used (default: false).
	pub log_format_json: bool,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			api: Default::default(),
			postgres: Default::default(),
			node_url: "http://127.0.0.1:6869".to_string(),
			node_api_key: "".to_string(),
			loop_delay: 1000,
			sequence_ttl: 5000,
			tx_processing_ttl: 3000,
			heights_after_last_tx: 6,
			wait_for_next_height_delay: 1000,
			tx_outdate_time: 14_400_000,
			wait_for_tx_status_delay: 1000,
			wait_for_tx_timeout: 90_000,
			log_level: Level::INFO,
			log_format_json: false,
		}
	}
}

impl From<&RuntimeConfig> for DispatcherConfig {
	fn from(config: &RuntimeConfig) -> Self {
		DispatcherConfig {
			loop_delay: Duration::from_millis(config.loop_delay),
			sequence_ttl: Duration::from_millis(config.sequence_ttl),
		}
	}
}

impl From<&RuntimeConfig> for WorkerConfig {
	fn from(config: &RuntimeConfig) -> Self {
		WorkerConfig {
			tx_processing_ttl: Duration::from_millis(config.tx_processing_ttl),
			heights_after_last_tx: config.heights_after_last_tx,
			wait_for_next_height_delay: Duration::from_millis(config.wait_for_next_height_delay),
			tx_outdate_time: Duration::from_millis(config.tx_outdate_time),
		}
	}
}

impl From<&RuntimeConfig> for NodeConfig {
	fn from(config: &RuntimeConfig) -> Self {
		NodeConfig {
			base_url: config.node_url.clone(),
			api_key: config.node_api_key.clone(),
			wait_for_tx_status_delay: Duration::from_millis(config.wait_for_tx_status_delay),
			wait_for_tx_timeout: Duration::from_millis(config.wait_for_tx_timeout),
			wait_for_next_height_delay: Duration::from_millis(config.wait_for_next_height_delay),
		}
	}
}

mod tracing_level_format {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}
