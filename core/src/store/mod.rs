//! Durable persistence of sequences and their transactions.
//!
//! The engine depends only on the [`Store`] trait; [`postgres::PgStore`] is
//! the production implementation and [`memory::MemoryStore`] backs tests.
//! Every operation is a single atomic statement, except `create_sequence`
//! which runs one explicit transaction. Any operation that changes a
//! sequence's state also bumps its `updated_at`, which doubles as the
//! cooperative lease heartbeat.

use async_trait::async_trait;
use color_eyre::Result;
use mockall::automock;
use std::time::Duration;

use crate::types::{Sequence, SequenceState, SequenceTx, TxState};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[automock]
#[async_trait]
pub trait Store: Send + Sync {
	/// Returns the sequence with confirmed/total transaction counts, or
	/// `None` when no such sequence exists.
	async fn get_sequence_by_id(&self, sequence_id: i64) -> Result<Option<Sequence>>;

	/// Returns all transactions of a sequence, ordered by
	/// `position_in_sequence` ascending.
	async fn get_sequence_txs_by_id(&self, sequence_id: i64) -> Result<Vec<SequenceTx>>;

	/// Returns ids of freshly created sequences awaiting pickup.
	async fn get_new_sequence_ids(&self) -> Result<Vec<i64>>;

	/// Returns ids of sequences in `processing` whose lease heartbeat is
	/// older than `ttl`, excluding the given ids.
	async fn get_hanging_sequence_ids(&self, ttl: Duration, excluding: &[i64]) -> Result<Vec<i64>>;

	/// Creates a sequence in `pending` state with its transactions at dense
	/// positions `[0..N)`, returning the assigned id.
	async fn create_sequence(&self, txs: Vec<String>) -> Result<i64>;

	/// Sets the sequence state and bumps `updated_at` (lease heartbeat).
	async fn set_sequence_state_by_id(&self, sequence_id: i64, state: SequenceState) -> Result<()>;

	/// Moves the sequence to its terminal `error` state.
	async fn set_sequence_error_state_by_id(
		&self,
		sequence_id: i64,
		error_message: &str,
		error_code: i16,
	) -> Result<()>;

	/// Records the node-assigned transaction id.
	async fn set_sequence_tx_id(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		tx_id: &str,
	) -> Result<()>;

	async fn set_sequence_tx_state(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		state: TxState,
	) -> Result<()>;

	/// Marks a transaction `confirmed` at the given block height.
	async fn set_sequence_tx_confirmed_state(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		height: i32,
	) -> Result<()>;

	async fn set_sequence_tx_error_message(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		error_message: &str,
	) -> Result<()>;

	async fn reset_sequence_tx_error_message(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
	) -> Result<()>;

	/// Resets every transaction at a position at or after the position of
	/// `tx_id` to `state`. Used when a confirmed transaction is observed to
	/// have vanished from the chain.
	async fn set_sequence_txs_state_after(
		&self,
		sequence_id: i64,
		tx_id: &str,
		state: TxState,
	) -> Result<()>;
}
