//! Blockchain node interface.
//!
//! The engine talks to the node only through the [`Client`] trait;
//! [`http::HttpClient`] is the wire implementation. Retry behaviour lives in
//! the worker, not here: every call is one independent request, except the
//! two polling helpers (`wait_for_tx_status`, `wait_for_next_height`) whose
//! delays and deadline are part of the node configuration.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::Duration};
use strum::Display;

pub mod http;

pub use http::HttpClient;

/// Coarse classification of a node call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
	/// The node rejected a broadcast with HTTP 400.
	BroadcastClient,
	/// The node failed a broadcast with any other non-2xx status.
	BroadcastServer,
	/// The transaction-status endpoint returned a non-2xx status.
	GetTxStatus,
	/// The status poll exceeded `wait_for_tx_timeout`.
	WaitForTxStatusTimeout,
	/// The node reported the transaction as `not_found`.
	TxNotFound,
	/// Transport failures, undecodable responses, unexpected statuses.
	Internal,
}

/// A failed node call. Carries the coarse [`ErrorCode`] and, where the node
/// itself returned a numeric error code, that code too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
	code: ErrorCode,
	message: String,
	node_error_code: Option<i16>,
}

impl Error {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Error {
			code,
			message: message.into(),
			node_error_code: None,
		}
	}

	pub fn with_node_code(
		code: ErrorCode,
		message: impl Into<String>,
		node_error_code: Option<i16>,
	) -> Self {
		Error {
			code,
			message: message.into(),
			node_error_code,
		}
	}

	fn internal(message: impl fmt::Display) -> Self {
		Error::new(ErrorCode::Internal, message.to_string())
	}

	pub fn code(&self) -> ErrorCode {
		self.code
	}

	pub fn node_error_code(&self) -> Option<i16> {
		self.node_error_code
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for Error {}

/// Node-reported status of a transaction.
#[derive(Serialize, Deserialize, Display, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxStatus {
	NotFound,
	Unconfirmed,
	Confirmed,
}

/// Verdict of the node's debug-validate endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
	pub valid: bool,
	pub error_message: Option<String>,
}

/// Per transaction id: `true` iff the node-reported status is not `not_found`.
pub type Availability = HashMap<String, bool>;

/// Node connection parameters.
#[derive(Debug, Clone)]
pub struct NodeConfig {
	pub base_url: String,
	pub api_key: String,
	pub wait_for_tx_status_delay: Duration,
	pub wait_for_tx_timeout: Duration,
	pub wait_for_next_height_delay: Duration,
}

#[automock]
#[async_trait]
pub trait Client: Send + Sync {
	/// Validates a raw transaction against the node's current state.
	async fn validate_tx(&self, tx: &str) -> Result<ValidationResult, Error>;

	/// Broadcasts a raw transaction, returning the node-assigned id.
	async fn broadcast_tx(&self, tx: &str) -> Result<String, Error>;

	/// Polls the transaction status until it matches `status`, returning the
	/// height the node reported it at.
	async fn wait_for_tx_status(&self, tx_id: &str, status: TxStatus) -> Result<i32, Error>;

	async fn get_current_height(&self) -> Result<i32, Error>;

	/// Waits until the chain height strictly exceeds the value observed at entry.
	async fn wait_for_next_height(&self) -> Result<(), Error>;

	async fn get_txs_availability(&self, tx_ids: &[String]) -> Result<Availability, Error>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tx_status_uses_snake_case_wire_names() {
		assert_eq!(
			serde_json::from_str::<TxStatus>(r#""not_found""#).unwrap(),
			TxStatus::NotFound
		);
		assert_eq!(
			serde_json::from_str::<TxStatus>(r#""confirmed""#).unwrap(),
			TxStatus::Confirmed
		);
		assert_eq!(TxStatus::NotFound.to_string(), "not_found");
	}

	#[test]
	fn error_preserves_node_code() {
		let error = Error::with_node_code(ErrorCode::BroadcastClient, "State check failed", Some(112));
		assert_eq!(error.code(), ErrorCode::BroadcastClient);
		assert_eq!(error.node_error_code(), Some(112));
		assert_eq!(error.to_string(), "State check failed");
	}
}
