//! Worker: drives one sequence through its lifecycle to terminal success or
//! a classified failure.
//!
//! # Flow
//!
//! * Load the sequence's transactions, ordered by position
//! * For each transaction, resume the validate-broadcast-confirm cascade from
//!   exactly the state persisted in the store
//! * Before touching a not-yet-confirmed transaction, verify that none of the
//!   already-confirmed ones vanished from the chain (reorg check)
//! * Once everything is confirmed, wait until the chain advances
//!   `heights_after_last_tx` past the highest confirmation height
//!
//! The worker never writes the sequence's terminal `done`/`error` state; that
//! is the dispatcher's decision, driven by the returned [`WorkerError`]
//! variant. A `Recoverable` return leaves the sequence leasable, so a crash at
//! any point resumes from the last persisted per-transaction state.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tracing::{debug, error};

use crate::{
	node::{self, ErrorCode, TxStatus},
	store::Store,
	types::{SequenceState, SequenceTx, TxState, WorkerConfig},
};

static TX_DUPLICATE_RE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"Transaction (\w+) is already in the state on a height of \d+").unwrap()
});

static TX_TIMESTAMP_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"Transaction timestamp \d+ is more than \d+ms").unwrap());

#[derive(Deserialize)]
struct TxWithTimestamp {
	#[serde(default)]
	timestamp: Option<i64>,
}

/// Classified outcome of a worker run. The discriminant is the only thing
/// the dispatcher dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
	/// Transient condition; the sequence stays leasable and is retried.
	Recoverable { message: String },
	/// The sequence cannot proceed and terminates in `error`.
	NonRecoverable { message: String, code: i16 },
	/// A broken invariant; the dispatcher loop exits with this error.
	Fatal { message: String },
}

impl WorkerError {
	fn recoverable(message: impl fmt::Display) -> Self {
		WorkerError::Recoverable {
			message: message.to_string(),
		}
	}

	fn non_recoverable(message: impl Into<String>, code: i16) -> Self {
		WorkerError::NonRecoverable {
			message: message.into(),
			code,
		}
	}

	fn fatal(message: impl fmt::Display) -> Self {
		WorkerError::Fatal {
			message: message.to_string(),
		}
	}
}

impl fmt::Display for WorkerError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			WorkerError::Recoverable { message } => {
				write!(f, "Recoverable error with reason: {message}.")
			},
			WorkerError::NonRecoverable { message, .. } => {
				write!(f, "Non-recoverable error with reason: {message}.")
			},
			WorkerError::Fatal { message } => {
				write!(f, "Fatal error with reason: {message}.")
			},
		}
	}
}

impl std::error::Error for WorkerError {}

fn age(updated_at: DateTime<Utc>) -> Duration {
	Utc::now()
		.signed_duration_since(updated_at)
		.to_std()
		.unwrap_or_default()
}

fn confirmed_parts(tx: &SequenceTx) -> Result<(String, i32), WorkerError> {
	let Some(id) = tx.id.clone() else {
		return Err(WorkerError::fatal(format!(
			"Confirmed transaction without id: sequence {} position {}",
			tx.sequence_id, tx.position_in_sequence
		)));
	};
	Ok((id, tx.height.unwrap_or_default()))
}

pub struct Worker<S, N> {
	store: Arc<S>,
	node_client: Arc<N>,
	config: WorkerConfig,
}

impl<S: Store, N: node::Client> Worker<S, N> {
	pub fn new(store: Arc<S>, node_client: Arc<N>, config: WorkerConfig) -> Self {
		Worker {
			store,
			node_client,
			config,
		}
	}

	/// Runs the sequence to a terminal outcome. `Ok(())` means every
	/// transaction is confirmed and the quiescence window has passed; the
	/// caller commits the `done` state.
	pub async fn run(&self, sequence_id: i64) -> Result<(), WorkerError> {
		debug!(sequence_id, "Start processing sequence");

		let txs = self
			.store
			.get_sequence_txs_by_id(sequence_id)
			.await
			.map_err(WorkerError::fatal)?;

		debug!(sequence_id, txs_count = txs.len(), "Going to process txs");

		// node-assigned id -> confirmation height
		let mut confirmed_txs: HashMap<String, i32> = HashMap::new();

		for mut tx in txs {
			if tx.state == TxState::Confirmed {
				let (id, height) = confirmed_parts(&tx)?;
				confirmed_txs.insert(id, height);
				continue;
			}

			if !confirmed_txs.is_empty() {
				let confirmed_tx_ids: Vec<String> = confirmed_txs.keys().cloned().collect();
				self.check_txs_availability(sequence_id, &confirmed_tx_ids)
					.await?;
			}

			if tx.state == TxState::Processing && age(tx.updated_at) < self.config.tx_processing_ttl
			{
				debug!(
					sequence_id,
					position_in_sequence = tx.position_in_sequence,
					"Tx is under processing, processing TTL is not over"
				);
				return Err(WorkerError::recoverable(
					"error occurred while processing tx: tx is under processing, processing TTL is not over",
				));
			}

			match tx.state {
				TxState::Pending | TxState::Processing | TxState::Validated | TxState::Unconfirmed => {
					if let Err(worker_error) = self.process_tx(&mut tx).await {
						error!(
							sequence_id,
							position_in_sequence = tx.position_in_sequence,
							"Error occurred while processing tx: {worker_error}"
						);
						return Err(worker_error);
					}
					let (id, height) = confirmed_parts(&tx)?;
					confirmed_txs.insert(id, height);
				},
				TxState::Error => {
					return Err(WorkerError::non_recoverable(
						tx.error_message.clone().unwrap_or_default(),
						0,
					));
				},
				TxState::Confirmed => {},
			}
		}

		let last_height = confirmed_txs.values().copied().max().unwrap_or_default();
		let target_height = last_height + self.config.heights_after_last_tx;
		let confirmed_tx_ids: Vec<String> = confirmed_txs.keys().cloned().collect();

		self.wait_for_target_height(target_height, sequence_id, &confirmed_tx_ids)
			.await
	}

	/// Resumable cascade over the transaction's states. Entering at any state
	/// completes all later ones; each transition is store-persisted before
	/// the next state is attempted.
	async fn process_tx(&self, tx: &mut SequenceTx) -> Result<(), WorkerError> {
		loop {
			match tx.state {
				TxState::Pending => {
					debug!(
						sequence_id = tx.sequence_id,
						position_in_sequence = tx.position_in_sequence,
						"Process tx"
					);
					self.set_tx_state(tx, TxState::Processing).await?;
				},
				TxState::Processing => {
					debug!(
						sequence_id = tx.sequence_id,
						position_in_sequence = tx.position_in_sequence,
						"Validate tx"
					);
					self.validate_tx(tx).await?;
					self.set_tx_state(tx, TxState::Validated).await?;
				},
				TxState::Validated => {
					debug!(
						sequence_id = tx.sequence_id,
						position_in_sequence = tx.position_in_sequence,
						"Broadcast tx"
					);
					self.broadcast_tx(tx).await?;
					self.set_tx_state(tx, TxState::Unconfirmed).await?;
				},
				TxState::Unconfirmed => {
					let tx_id = tx.id.clone().ok_or_else(|| {
						WorkerError::fatal(format!(
							"Unconfirmed transaction without id: sequence {} position {}",
							tx.sequence_id, tx.position_in_sequence
						))
					})?;

					debug!(
						sequence_id = tx.sequence_id,
						position_in_sequence = tx.position_in_sequence,
						%tx_id,
						"Wait for tx confirmation"
					);

					match self
						.node_client
						.wait_for_tx_status(&tx_id, TxStatus::Confirmed)
						.await
					{
						Ok(height) => {
							self.store
								.set_sequence_tx_confirmed_state(
									tx.sequence_id,
									tx.position_in_sequence,
									height,
								)
								.await
								.map_err(WorkerError::fatal)?;
							tx.state = TxState::Confirmed;
							tx.height = Some(height);
						},
						Err(node_error) => {
							if node_error.code() == ErrorCode::TxNotFound {
								// the broadcast got lost, redo it on the next lease
								self.store
									.set_sequence_tx_state(
										tx.sequence_id,
										tx.position_in_sequence,
										TxState::Pending,
									)
									.await
									.map_err(WorkerError::fatal)?;
							}
							return Err(WorkerError::recoverable(node_error));
						},
					}
				},
				TxState::Confirmed => {
					debug!(
						sequence_id = tx.sequence_id,
						position_in_sequence = tx.position_in_sequence,
						tx_id = tx.id.as_deref().unwrap_or_default(),
						"Tx appeared in the blockchain"
					);
					return Ok(());
				},
				TxState::Error => return Ok(()),
			}
		}
	}

	async fn set_tx_state(&self, tx: &mut SequenceTx, state: TxState) -> Result<(), WorkerError> {
		self.store
			.set_sequence_tx_state(tx.sequence_id, tx.position_in_sequence, state)
			.await
			.map_err(WorkerError::fatal)?;
		tx.state = state;
		Ok(())
	}

	/// Validates the transaction, retrying on the next height for transient
	/// invalid verdicts. The first real failure reason is kept; later
	/// timestamp noise never overwrites it.
	async fn validate_tx(&self, tx: &mut SequenceTx) -> Result<(), WorkerError> {
		loop {
			let verdict = match self.node_client.validate_tx(&tx.tx).await {
				Ok(verdict) => verdict,
				Err(node_error) => {
					error!(
						sequence_id = tx.sequence_id,
						position_in_sequence = tx.position_in_sequence,
						"Error occurred while validating tx: {node_error}"
					);
					return Err(WorkerError::recoverable(node_error));
				},
			};

			if verdict.valid {
				// reset the error message that may have been set on a previous pass
				self.store
					.reset_sequence_tx_error_message(tx.sequence_id, tx.position_in_sequence)
					.await
					.map_err(WorkerError::fatal)?;
				tx.error_message = None;
				return Ok(());
			}

			debug!(
				sequence_id = tx.sequence_id,
				position_in_sequence = tx.position_in_sequence,
				"Invalid tx"
			);

			let message = verdict.error_message.unwrap_or_default();

			if TX_DUPLICATE_RE.is_match(&message) {
				// transaction is already in the blockchain
				return Ok(());
			}

			let is_timestamp_error = TX_TIMESTAMP_RE.is_match(&message);
			let is_outdated = self.is_tx_outdated(&tx.tx)?;
			if is_outdated {
				debug!(
					sequence_id = tx.sequence_id,
					position_in_sequence = tx.position_in_sequence,
					"Tx is outdated (local check)"
				);
			}

			if tx.error_message.is_none() {
				self.store
					.set_sequence_tx_error_message(
						tx.sequence_id,
						tx.position_in_sequence,
						&message,
					)
					.await
					.map_err(WorkerError::fatal)?;
				tx.error_message = Some(message.clone());
			}

			if !is_timestamp_error && !is_outdated {
				// transient per-height failure, e.g. a referenced transaction
				// not deep enough yet; retry after the next block
				self.node_client
					.wait_for_next_height()
					.await
					.map_err(WorkerError::recoverable)?;
				continue;
			}

			self.store
				.set_sequence_tx_state(tx.sequence_id, tx.position_in_sequence, TxState::Error)
				.await
				.map_err(WorkerError::fatal)?;

			let error_message = tx.error_message.clone().unwrap_or(message);
			return Err(WorkerError::non_recoverable(error_message, 0));
		}
	}

	/// Broadcasts the transaction and records the node-assigned id. A
	/// duplicate rejection is absorbed as success with the id captured from
	/// the node's message.
	async fn broadcast_tx(&self, tx: &mut SequenceTx) -> Result<(), WorkerError> {
		let tx_id = match self.node_client.broadcast_tx(&tx.tx).await {
			Ok(tx_id) => tx_id,
			Err(node_error) => {
				let message = node_error.to_string();
				let duplicate_tx_id = TX_DUPLICATE_RE
					.captures(&message)
					.map(|captures| captures[1].to_string());
				match duplicate_tx_id {
					// transaction is already in the blockchain
					Some(tx_id) => tx_id,
					None => {
						error!(
							sequence_id = tx.sequence_id,
							position_in_sequence = tx.position_in_sequence,
							"Error occurred while broadcasting tx: {node_error}"
						);

						if node_error.code() == ErrorCode::BroadcastClient {
							return Err(WorkerError::non_recoverable(
								message,
								node_error.node_error_code().unwrap_or_default(),
							));
						}

						return Err(WorkerError::recoverable(node_error));
					},
				}
			},
		};

		self.store
			.reset_sequence_tx_error_message(tx.sequence_id, tx.position_in_sequence)
			.await
			.map_err(WorkerError::fatal)?;
		tx.error_message = None;

		self.store
			.set_sequence_tx_id(tx.sequence_id, tx.position_in_sequence, &tx_id)
			.await
			.map_err(WorkerError::fatal)?;
		tx.id = Some(tx_id);

		Ok(())
	}

	/// Waits until the chain reaches `target_height`, refreshing the lease
	/// and re-checking confirmed transactions on every tick.
	async fn wait_for_target_height(
		&self,
		target_height: i32,
		sequence_id: i64,
		confirmed_tx_ids: &[String],
	) -> Result<(), WorkerError> {
		let current_height = self
			.node_client
			.get_current_height()
			.await
			.map_err(WorkerError::recoverable)?;

		debug!(
			sequence_id,
			confirmed_txs_count = confirmed_tx_ids.len(),
			target_height,
			current_height,
			"Start waiting for target height"
		);

		if current_height >= target_height {
			return Ok(());
		}

		loop {
			tokio::time::sleep(self.config.wait_for_next_height_delay).await;

			// lease heartbeat
			self.store
				.set_sequence_state_by_id(sequence_id, SequenceState::Processing)
				.await
				.map_err(WorkerError::fatal)?;

			self.check_txs_availability(sequence_id, confirmed_tx_ids)
				.await?;

			let current_height = self
				.node_client
				.get_current_height()
				.await
				.map_err(WorkerError::recoverable)?;

			if current_height >= target_height {
				debug!(sequence_id, "Blockchain reached target height");
				return Ok(());
			}
		}
	}

	/// Verifies that no confirmed transaction vanished from the chain. Every
	/// vanished transaction resets its position and all later ones back to
	/// `pending` before the worker surfaces the retry.
	async fn check_txs_availability(
		&self,
		sequence_id: i64,
		confirmed_tx_ids: &[String],
	) -> Result<(), WorkerError> {
		let availability = self
			.node_client
			.get_txs_availability(confirmed_tx_ids)
			.await
			.map_err(|node_error| {
				error!(sequence_id, "Error occurred while fetching txs statuses: {node_error}");
				WorkerError::recoverable(node_error)
			})?;

		let mut pulled_out = false;
		for (tx_id, is_available) in &availability {
			if !is_available {
				debug!(sequence_id, %tx_id, "One of confirmed txs was pulled out");
				self.store
					.set_sequence_txs_state_after(sequence_id, tx_id, TxState::Pending)
					.await
					.map_err(WorkerError::fatal)?;
				pulled_out = true;
			}
		}

		if pulled_out {
			return Err(WorkerError::recoverable(
				"one of confirmed txs was pulled out from the blockchain",
			));
		}

		Ok(())
	}

	/// Checks the transaction's embedded millisecond timestamp against
	/// `tx_outdate_time`. A payload that is not valid JSON breaks the
	/// admission invariant.
	fn is_tx_outdated(&self, tx: &str) -> Result<bool, WorkerError> {
		let parsed: TxWithTimestamp = serde_json::from_str(tx).map_err(|parse_error| {
			WorkerError::fatal(format!("Malformed transaction payload: {parse_error}"))
		})?;

		let Some(timestamp) = parsed.timestamp else {
			return Ok(false);
		};

		let age_ms = Utc::now().timestamp_millis() - timestamp;
		Ok(age_ms >= self.config.tx_outdate_time.as_millis() as i64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		node::{Error as NodeError, ErrorCode, MockClient, ValidationResult},
		store::MockStore,
	};
	use chrono::Duration as ChronoDuration;

	fn test_config() -> WorkerConfig {
		WorkerConfig {
			tx_processing_ttl: Duration::from_millis(3000),
			heights_after_last_tx: 6,
			wait_for_next_height_delay: Duration::from_millis(1),
			tx_outdate_time: Duration::from_millis(14_400_000),
		}
	}

	fn worker(store: MockStore, node_client: MockClient) -> Worker<MockStore, MockClient> {
		Worker::new(Arc::new(store), Arc::new(node_client), test_config())
	}

	fn tx_in_state(sequence_id: i64, position: i32, state: TxState) -> SequenceTx {
		SequenceTx {
			id: None,
			sequence_id,
			state,
			height: None,
			error_message: None,
			position_in_sequence: position,
			tx: format!(
				r#"{{"type":4,"timestamp":{}}}"#,
				Utc::now().timestamp_millis()
			),
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	fn confirmed_tx(sequence_id: i64, position: i32, tx_id: &str, height: i32) -> SequenceTx {
		let mut tx = tx_in_state(sequence_id, position, TxState::Confirmed);
		tx.id = Some(tx_id.to_string());
		tx.height = Some(height);
		tx
	}

	fn all_available(ids: &[String]) -> crate::node::Availability {
		ids.iter().cloned().map(|id| (id, true)).collect()
	}

	fn expect_tx_state_writes(store: &mut MockStore) {
		store
			.expect_set_sequence_tx_state()
			.returning(|_, _, _| Ok(()));
		store
			.expect_set_sequence_tx_id()
			.returning(|_, _, _| Ok(()));
		store
			.expect_set_sequence_tx_confirmed_state()
			.returning(|_, _, _| Ok(()));
		store
			.expect_reset_sequence_tx_error_message()
			.returning(|_, _| Ok(()));
	}

	#[tokio::test]
	async fn happy_path_confirms_all_txs_in_order() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| {
				Ok(vec![
					tx_in_state(sequence_id, 0, TxState::Pending),
					tx_in_state(sequence_id, 1, TxState::Pending),
					tx_in_state(sequence_id, 2, TxState::Pending),
				])
			});
		expect_tx_state_writes(&mut store);

		node_client
			.expect_validate_tx()
			.times(3)
			.returning(|_| {
				Ok(ValidationResult {
					valid: true,
					error_message: None,
				})
			});
		let mut broadcasted = 0;
		node_client.expect_broadcast_tx().times(3).returning(move |_| {
			broadcasted += 1;
			Ok(format!("TX{broadcasted}"))
		});
		let mut confirmed = 0;
		node_client
			.expect_wait_for_tx_status()
			.times(3)
			.returning(move |_, _| {
				confirmed += 1;
				Ok(99 + confirmed)
			});
		node_client
			.expect_get_txs_availability()
			.returning(|ids| Ok(all_available(ids)));
		node_client.expect_get_current_height().returning(|| Ok(108));

		assert_eq!(worker(store, node_client).run(1).await, Ok(()));
	}

	#[tokio::test]
	async fn transient_validation_failure_retries_after_next_height() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| Ok(vec![tx_in_state(sequence_id, 0, TxState::Pending)]));
		store
			.expect_set_sequence_tx_error_message()
			.withf(|_, _, message| message == "State check failed. Reason: referenced tx too fresh")
			.times(1)
			.returning(|_, _, _| Ok(()));
		expect_tx_state_writes(&mut store);

		let mut validations = 0;
		node_client.expect_validate_tx().times(2).returning(move |_| {
			validations += 1;
			if validations == 1 {
				Ok(ValidationResult {
					valid: false,
					error_message: Some(
						"State check failed. Reason: referenced tx too fresh".to_string(),
					),
				})
			} else {
				Ok(ValidationResult {
					valid: true,
					error_message: None,
				})
			}
		});
		node_client
			.expect_wait_for_next_height()
			.times(1)
			.returning(|| Ok(()));
		node_client
			.expect_broadcast_tx()
			.returning(|_| Ok("TX1".to_string()));
		node_client
			.expect_wait_for_tx_status()
			.returning(|_, _| Ok(100));
		node_client.expect_get_current_height().returning(|| Ok(106));

		assert_eq!(worker(store, node_client).run(1).await, Ok(()));
	}

	#[tokio::test]
	async fn timestamp_error_is_non_recoverable_and_marks_the_tx() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();
		let message = "Transaction timestamp 12345 is more than 7200000ms";

		store.expect_get_sequence_txs_by_id().returning(|sequence_id| {
			let mut tx = tx_in_state(sequence_id, 0, TxState::Pending);
			// no embedded timestamp: only the node-reported error applies
			tx.tx = r#"{"type":4}"#.to_string();
			Ok(vec![tx, tx_in_state(sequence_id, 1, TxState::Pending)])
		});
		store
			.expect_set_sequence_tx_state()
			.withf(|_, position, state| *position == 0 && *state == TxState::Processing)
			.times(1)
			.returning(|_, _, _| Ok(()));
		store
			.expect_set_sequence_tx_error_message()
			.withf(move |_, position, error_message| *position == 0 && error_message == message)
			.times(1)
			.returning(|_, _, _| Ok(()));
		store
			.expect_set_sequence_tx_state()
			.withf(|_, position, state| *position == 0 && *state == TxState::Error)
			.times(1)
			.returning(|_, _, _| Ok(()));

		node_client.expect_validate_tx().times(1).returning(move |_| {
			Ok(ValidationResult {
				valid: false,
				error_message: Some(message.to_string()),
			})
		});

		// the second tx must not be touched
		assert_eq!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::NonRecoverable {
				message: message.to_string(),
				code: 0,
			})
		);
	}

	#[tokio::test]
	async fn outdated_tx_is_non_recoverable_without_node_timestamp_error() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();
		let message = "State check failed. Reason: negative balance";

		let stale = (Utc::now() - ChronoDuration::hours(5)).timestamp_millis();
		store.expect_get_sequence_txs_by_id().returning(move |sequence_id| {
			let mut tx = tx_in_state(sequence_id, 0, TxState::Pending);
			tx.tx = format!(r#"{{"type":4,"timestamp":{stale}}}"#);
			Ok(vec![tx])
		});
		store
			.expect_set_sequence_tx_state()
			.returning(|_, _, _| Ok(()));
		store
			.expect_set_sequence_tx_error_message()
			.times(1)
			.returning(|_, _, _| Ok(()));

		node_client.expect_validate_tx().times(1).returning(move |_| {
			Ok(ValidationResult {
				valid: false,
				error_message: Some(message.to_string()),
			})
		});

		assert_eq!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::NonRecoverable {
				message: message.to_string(),
				code: 0,
			})
		);
	}

	#[tokio::test]
	async fn first_validation_reason_wins_over_timestamp_noise() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();
		let root_cause = "State check failed. Reason: referenced tx too fresh";
		let timestamp_noise = "Transaction timestamp 12345 is more than 7200000ms";

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| {
				let mut tx = tx_in_state(sequence_id, 0, TxState::Pending);
				tx.tx = r#"{"type":4}"#.to_string();
				Ok(vec![tx])
			});
		store
			.expect_set_sequence_tx_state()
			.returning(|_, _, _| Ok(()));
		store
			.expect_set_sequence_tx_error_message()
			.withf(move |_, _, message| message == root_cause)
			.times(1)
			.returning(|_, _, _| Ok(()));

		let mut validations = 0;
		node_client.expect_validate_tx().times(2).returning(move |_| {
			validations += 1;
			Ok(ValidationResult {
				valid: false,
				error_message: Some(
					if validations == 1 { root_cause } else { timestamp_noise }.to_string(),
				),
			})
		});
		node_client
			.expect_wait_for_next_height()
			.times(1)
			.returning(|| Ok(()));

		assert_eq!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::NonRecoverable {
				message: root_cause.to_string(),
				code: 0,
			})
		);
	}

	#[tokio::test]
	async fn duplicate_validation_verdict_skips_broadcast_input_error() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| Ok(vec![tx_in_state(sequence_id, 0, TxState::Pending)]));
		expect_tx_state_writes(&mut store);

		node_client.expect_validate_tx().times(1).returning(|_| {
			Ok(ValidationResult {
				valid: false,
				error_message: Some(
					"Transaction ABC is already in the state on a height of 500".to_string(),
				),
			})
		});
		// broadcast still runs and is absorbed as a duplicate
		node_client.expect_broadcast_tx().times(1).returning(|_| {
			Err(NodeError::with_node_code(
				ErrorCode::BroadcastClient,
				"Transaction ABC is already in the state on a height of 500",
				Some(112),
			))
		});
		node_client
			.expect_wait_for_tx_status()
			.withf(|tx_id, status| tx_id == "ABC" && *status == TxStatus::Confirmed)
			.times(1)
			.returning(|_, _| Ok(500));
		node_client.expect_get_current_height().returning(|| Ok(506));

		assert_eq!(worker(store, node_client).run(1).await, Ok(()));
	}

	#[tokio::test]
	async fn broadcast_client_error_is_non_recoverable_with_node_code() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| Ok(vec![tx_in_state(sequence_id, 0, TxState::Validated)]));

		node_client.expect_broadcast_tx().times(1).returning(|_| {
			Err(NodeError::with_node_code(
				ErrorCode::BroadcastClient,
				"State check failed. Reason: negative balance",
				Some(112),
			))
		});

		assert_eq!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::NonRecoverable {
				message: "State check failed. Reason: negative balance".to_string(),
				code: 112,
			})
		);
	}

	#[tokio::test]
	async fn broadcast_server_error_is_recoverable() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| Ok(vec![tx_in_state(sequence_id, 0, TxState::Validated)]));

		node_client.expect_broadcast_tx().times(1).returning(|_| {
			Err(NodeError::new(
				ErrorCode::BroadcastServer,
				"503 Service Unavailable",
			))
		});

		assert!(matches!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::Recoverable { .. })
		));
	}

	#[tokio::test]
	async fn fresh_processing_row_of_another_worker_is_left_alone() {
		let mut store = MockStore::new();
		let node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| Ok(vec![tx_in_state(sequence_id, 0, TxState::Processing)]));

		assert!(matches!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::Recoverable { .. })
		));
	}

	#[tokio::test]
	async fn stale_processing_row_is_resumed_from_validation() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| {
				let mut tx = tx_in_state(sequence_id, 0, TxState::Processing);
				tx.updated_at = Utc::now() - ChronoDuration::seconds(10);
				Ok(vec![tx])
			});
		expect_tx_state_writes(&mut store);

		node_client.expect_validate_tx().times(1).returning(|_| {
			Ok(ValidationResult {
				valid: true,
				error_message: None,
			})
		});
		node_client
			.expect_broadcast_tx()
			.returning(|_| Ok("TX1".to_string()));
		node_client
			.expect_wait_for_tx_status()
			.returning(|_, _| Ok(100));
		node_client.expect_get_current_height().returning(|| Ok(106));

		assert_eq!(worker(store, node_client).run(1).await, Ok(()));
	}

	#[tokio::test]
	async fn resumes_from_unconfirmed_without_rebroadcasting() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| {
				let mut tx = tx_in_state(sequence_id, 0, TxState::Unconfirmed);
				tx.id = Some("TX1".to_string());
				Ok(vec![tx])
			});
		store
			.expect_set_sequence_tx_confirmed_state()
			.withf(|_, position, height| *position == 0 && *height == 100)
			.times(1)
			.returning(|_, _, _| Ok(()));

		node_client
			.expect_wait_for_tx_status()
			.withf(|tx_id, _| tx_id == "TX1")
			.times(1)
			.returning(|_, _| Ok(100));
		node_client.expect_get_current_height().returning(|| Ok(106));

		assert_eq!(worker(store, node_client).run(1).await, Ok(()));
	}

	#[tokio::test]
	async fn lost_broadcast_resets_the_row_to_pending() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| {
				let mut tx = tx_in_state(sequence_id, 0, TxState::Unconfirmed);
				tx.id = Some("TX1".to_string());
				Ok(vec![tx])
			});
		store
			.expect_set_sequence_tx_state()
			.withf(|_, position, state| *position == 0 && *state == TxState::Pending)
			.times(1)
			.returning(|_, _, _| Ok(()));

		node_client
			.expect_wait_for_tx_status()
			.times(1)
			.returning(|_, _| {
				Err(NodeError::new(
					ErrorCode::TxNotFound,
					"Transaction TX1 is not found in the blockchain",
				))
			});

		assert!(matches!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::Recoverable { .. })
		));
	}

	#[tokio::test]
	async fn error_row_terminates_the_sequence() {
		let mut store = MockStore::new();
		let node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| {
				let mut tx = tx_in_state(sequence_id, 0, TxState::Error);
				tx.error_message = Some("State check failed. Reason: negative balance".to_string());
				Ok(vec![tx])
			});

		assert_eq!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::NonRecoverable {
				message: "State check failed. Reason: negative balance".to_string(),
				code: 0,
			})
		);
	}

	#[tokio::test]
	async fn reorg_before_next_tx_resets_from_the_pulled_out_position() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| {
				Ok(vec![
					confirmed_tx(sequence_id, 0, "A", 100),
					tx_in_state(sequence_id, 1, TxState::Pending),
				])
			});
		store
			.expect_set_sequence_txs_state_after()
			.withf(|_, tx_id, state| tx_id == "A" && *state == TxState::Pending)
			.times(1)
			.returning(|_, _, _| Ok(()));

		node_client
			.expect_get_txs_availability()
			.times(1)
			.returning(|_| Ok(HashMap::from([("A".to_string(), false)])));

		assert!(matches!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::Recoverable { .. })
		));
	}

	#[tokio::test]
	async fn reorg_during_quiescence_wait_resets_and_retries() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| {
				Ok(vec![
					confirmed_tx(sequence_id, 0, "A", 100),
					confirmed_tx(sequence_id, 1, "B", 101),
				])
			});
		// quiescence tick refreshes the lease before checking availability
		store
			.expect_set_sequence_state_by_id()
			.withf(|_, state| *state == SequenceState::Processing)
			.times(1)
			.returning(|_, _| Ok(()));
		store
			.expect_set_sequence_txs_state_after()
			.withf(|_, tx_id, state| tx_id == "A" && *state == TxState::Pending)
			.times(1)
			.returning(|_, _, _| Ok(()));

		node_client
			.expect_get_current_height()
			.times(1)
			.returning(|| Ok(101));
		node_client
			.expect_get_txs_availability()
			.times(1)
			.returning(|_| {
				Ok(HashMap::from([
					("A".to_string(), false),
					("B".to_string(), true),
				]))
			});

		assert!(matches!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::Recoverable { .. })
		));
	}

	#[tokio::test]
	async fn quiescence_waits_until_target_height() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| Ok(vec![confirmed_tx(sequence_id, 0, "A", 100)]));
		store
			.expect_set_sequence_state_by_id()
			.returning(|_, _| Ok(()));

		let mut polls = 0;
		node_client.expect_get_current_height().returning(move || {
			polls += 1;
			// 104, 105, 106: two quiescence ticks before the target is reached
			Ok(103 + polls)
		});
		node_client
			.expect_get_txs_availability()
			.times(2)
			.returning(|ids| Ok(all_available(ids)));

		assert_eq!(worker(store, node_client).run(1).await, Ok(()));
	}

	#[tokio::test]
	async fn validation_node_error_is_recoverable() {
		let mut store = MockStore::new();
		let mut node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|sequence_id| Ok(vec![tx_in_state(sequence_id, 0, TxState::Pending)]));
		store
			.expect_set_sequence_tx_state()
			.returning(|_, _, _| Ok(()));

		node_client
			.expect_validate_tx()
			.times(1)
			.returning(|_| Err(NodeError::new(ErrorCode::Internal, "connection refused")));

		assert!(matches!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::Recoverable { .. })
		));
	}

	#[tokio::test]
	async fn store_failure_is_fatal() {
		let mut store = MockStore::new();
		let node_client = MockClient::new();

		store
			.expect_get_sequence_txs_by_id()
			.returning(|_| Err(color_eyre::eyre::eyre!("connection closed")));

		assert!(matches!(
			worker(store, node_client).run(1).await,
			Err(WorkerError::Fatal { .. })
		));
	}
}
