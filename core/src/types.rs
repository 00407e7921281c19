//! Shared broadcaster structs and enums.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;

/// Lifecycle state of a sequence. The numeric encoding is the wire truth
/// persisted in the `sequences.state` column.
#[derive(Serialize, Deserialize, Display, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SequenceState {
	Pending,
	Processing,
	Done,
	Error,
}

impl From<SequenceState> for i16 {
	fn from(state: SequenceState) -> Self {
		match state {
			SequenceState::Pending => 0,
			SequenceState::Processing => 1,
			SequenceState::Done => 2,
			SequenceState::Error => 3,
		}
	}
}

impl TryFrom<i16> for SequenceState {
	type Error = Report;

	fn try_from(value: i16) -> Result<Self, Report> {
		match value {
			0 => Ok(SequenceState::Pending),
			1 => Ok(SequenceState::Processing),
			2 => Ok(SequenceState::Done),
			3 => Ok(SequenceState::Error),
			value => Err(eyre!("Invalid sequence state: {value}")),
		}
	}
}

/// Lifecycle state of a single transaction inside a sequence, persisted in
/// the `sequences_txs.state` column.
#[derive(Serialize, Deserialize, Display, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TxState {
	Pending,
	Processing,
	Validated,
	Unconfirmed,
	Confirmed,
	Error,
}

impl From<TxState> for i16 {
	fn from(state: TxState) -> Self {
		match state {
			TxState::Pending => 0,
			TxState::Processing => 1,
			TxState::Validated => 2,
			TxState::Unconfirmed => 3,
			TxState::Confirmed => 4,
			TxState::Error => 5,
		}
	}
}

impl TryFrom<i16> for TxState {
	type Error = Report;

	fn try_from(value: i16) -> Result<Self, Report> {
		match value {
			0 => Ok(TxState::Pending),
			1 => Ok(TxState::Processing),
			2 => Ok(TxState::Validated),
			3 => Ok(TxState::Unconfirmed),
			4 => Ok(TxState::Confirmed),
			5 => Ok(TxState::Error),
			value => Err(eyre!("Invalid transaction state: {value}")),
		}
	}
}

/// An ordered batch of transactions submitted together for processing.
///
/// `broadcasted_count` is the number of constituent transactions already
/// confirmed on-chain, `total_count` the overall batch size.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
	pub id: i64,
	pub broadcasted_count: u32,
	pub total_count: u32,
	pub state: SequenceState,
	pub error_message: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// One transaction of a sequence, keyed by `(sequence_id, position_in_sequence)`.
///
/// `id` is the node-assigned transaction id and stays `None` until the node
/// accepts the broadcast. `height` is set once the node reports confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceTx {
	pub id: Option<String>,
	pub sequence_id: i64,
	pub state: TxState,
	pub height: Option<i32>,
	pub error_message: Option<String>,
	pub position_in_sequence: i32,
	pub tx: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// Parameters of a single worker run.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
	/// Grace window within which another worker's `processing` row is left alone.
	pub tx_processing_ttl: Duration,
	/// Number of heights the chain must advance past the last confirmation
	/// before a sequence is declared done.
	pub heights_after_last_tx: i32,
	/// Delay between ticks while waiting out the quiescence window.
	pub wait_for_next_height_delay: Duration,
	/// Age at which a transaction's embedded timestamp makes it permanently invalid.
	pub tx_outdate_time: Duration,
}

/// Parameters of the dispatcher event loop.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
	/// Pause between work-discovery passes.
	pub loop_delay: Duration,
	/// Age of a `processing` sequence's lease after which it may be taken over.
	pub sequence_ttl: Duration,
}
