//! HTTP implementation of the node client.
//!
//! Endpoints used:
//!
//! * `GET /blocks/height` - current chain height
//! * `POST /debug/validate` - state validation of a raw transaction (API-key protected)
//! * `POST /transactions/broadcast` - transaction submission
//! * `GET /transactions/status?id=...` - single-transaction status poll
//! * `POST /transactions/status` - bulk status lookup (`{"ids": [...]}`)

use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use reqwest::{header::CONTENT_TYPE, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{Availability, Client, Error, ErrorCode, NodeConfig, TxStatus, ValidationResult};

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Deserialize)]
struct HeightResponse {
	height: i32,
}

#[derive(Deserialize)]
struct ValidateResponse {
	valid: bool,
	#[serde(default)]
	error: Option<String>,
}

#[derive(Deserialize)]
struct BroadcastResponse {
	id: String,
}

#[derive(Deserialize)]
struct TxStatusResponse {
	id: String,
	status: TxStatus,
	#[serde(default)]
	height: Option<i32>,
}

#[derive(Deserialize)]
struct NodeErrorResponse {
	#[serde(default)]
	error: Option<i16>,
	#[serde(default)]
	message: Option<String>,
}

#[derive(Serialize)]
struct TxsStatusRequest<'a> {
	ids: &'a [String],
}

#[derive(Clone)]
pub struct HttpClient {
	client: reqwest::Client,
	base_url: Url,
	api_key: String,
	wait_for_tx_status_delay: Duration,
	wait_for_tx_timeout: Duration,
	wait_for_next_height_delay: Duration,
}

impl HttpClient {
	pub fn new(config: &NodeConfig) -> Result<Self> {
		let base_url = Url::parse(&config.base_url)
			.wrap_err_with(|| format!("Invalid node URL: {}", config.base_url))?;

		Ok(HttpClient {
			client: reqwest::Client::new(),
			base_url,
			api_key: config.api_key.clone(),
			wait_for_tx_status_delay: config.wait_for_tx_status_delay,
			wait_for_tx_timeout: config.wait_for_tx_timeout,
			wait_for_next_height_delay: config.wait_for_next_height_delay,
		})
	}

	fn endpoint(&self, path: &str) -> Result<Url, Error> {
		self.base_url.join(path).map_err(Error::internal)
	}

	async fn get_tx_status(&self, tx_id: &str) -> Result<TxStatusResponse, Error> {
		let mut url = self.endpoint("/transactions/status")?;
		url.query_pairs_mut().append_pair("id", tx_id);

		let response = self
			.client
			.get(url)
			.send()
			.await
			.map_err(Error::internal)?;

		if response.status() != StatusCode::OK {
			return Err(Error::new(
				ErrorCode::GetTxStatus,
				response.status().to_string(),
			));
		}

		let statuses: Vec<TxStatusResponse> =
			response.json().await.map_err(Error::internal)?;
		statuses
			.into_iter()
			.next()
			.ok_or_else(|| Error::internal(format!("Empty status response for {tx_id}")))
	}
}

fn availability_from(statuses: Vec<TxStatusResponse>) -> Availability {
	statuses
		.into_iter()
		.map(|tx_status| (tx_status.id, tx_status.status != TxStatus::NotFound))
		.collect()
}

#[async_trait]
impl Client for HttpClient {
	async fn validate_tx(&self, tx: &str) -> Result<ValidationResult, Error> {
		let response = self
			.client
			.post(self.endpoint("/debug/validate")?)
			.header(CONTENT_TYPE, "application/json")
			.header(API_KEY_HEADER, &self.api_key)
			.body(tx.to_string())
			.send()
			.await
			.map_err(Error::internal)?;

		if response.status() != StatusCode::OK {
			return Err(Error::internal(format!(
				"Unexpected validate response status: {}",
				response.status()
			)));
		}

		let verdict: ValidateResponse = response.json().await.map_err(Error::internal)?;
		Ok(ValidationResult {
			valid: verdict.valid,
			error_message: verdict.error,
		})
	}

	async fn broadcast_tx(&self, tx: &str) -> Result<String, Error> {
		let response = self
			.client
			.post(self.endpoint("/transactions/broadcast")?)
			.header(CONTENT_TYPE, "application/json")
			.body(tx.to_string())
			.send()
			.await
			.map_err(Error::internal)?;

		match response.status() {
			StatusCode::OK => {
				let broadcasted: BroadcastResponse =
					response.json().await.map_err(Error::internal)?;
				Ok(broadcasted.id)
			},
			StatusCode::BAD_REQUEST => {
				let node_error: NodeErrorResponse =
					response.json().await.map_err(Error::internal)?;
				Err(Error::with_node_code(
					ErrorCode::BroadcastClient,
					node_error.message.unwrap_or_else(|| "Bad request".to_string()),
					node_error.error,
				))
			},
			status => Err(Error::new(ErrorCode::BroadcastServer, status.to_string())),
		}
	}

	async fn wait_for_tx_status(&self, tx_id: &str, status: TxStatus) -> Result<i32, Error> {
		let started = Instant::now();

		loop {
			let tx_status = self.get_tx_status(tx_id).await?;

			if tx_status.status == status {
				return Ok(tx_status.height.unwrap_or_default());
			}

			if tx_status.status == TxStatus::NotFound {
				return Err(Error::new(
					ErrorCode::TxNotFound,
					format!("Transaction {tx_id} is not found in the blockchain"),
				));
			}

			if started.elapsed() > self.wait_for_tx_timeout {
				return Err(Error::new(
					ErrorCode::WaitForTxStatusTimeout,
					"Wait for tx status time deadline is reached",
				));
			}

			tokio::time::sleep(self.wait_for_tx_status_delay).await;
		}
	}

	async fn get_current_height(&self) -> Result<i32, Error> {
		let response = self
			.client
			.get(self.endpoint("/blocks/height")?)
			.send()
			.await
			.map_err(Error::internal)?;

		if response.status() != StatusCode::OK {
			return Err(Error::internal(format!(
				"Unexpected height response status: {}",
				response.status()
			)));
		}

		let height: HeightResponse = response.json().await.map_err(Error::internal)?;
		Ok(height.height)
	}

	async fn wait_for_next_height(&self) -> Result<(), Error> {
		let entry_height = self.get_current_height().await?;
		debug!(entry_height, "Waiting for the next height");

		loop {
			tokio::time::sleep(self.wait_for_next_height_delay).await;

			if self.get_current_height().await? > entry_height {
				return Ok(());
			}
		}
	}

	async fn get_txs_availability(&self, tx_ids: &[String]) -> Result<Availability, Error> {
		let response = self
			.client
			.post(self.endpoint("/transactions/status")?)
			.json(&TxsStatusRequest { ids: tx_ids })
			.send()
			.await
			.map_err(Error::internal)?;

		if response.status() != StatusCode::OK {
			let node_error: NodeErrorResponse =
				response.json().await.map_err(Error::internal)?;
			return Err(Error::internal(
				node_error.message.unwrap_or_else(|| "Bulk status lookup failed".to_string()),
			));
		}

		let statuses: Vec<TxStatusResponse> =
			response.json().await.map_err(Error::internal)?;
		Ok(availability_from(statuses))
	}
}
