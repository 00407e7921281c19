//! In-memory store used by tests and local experiments.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::{
	collections::BTreeMap,
	sync::{Arc, Mutex},
	time::Duration,
};

use super::Store;
use crate::types::{Sequence, SequenceState, SequenceTx, TxState};

#[derive(Debug, Clone)]
struct StoredSequence {
	state: SequenceState,
	error_message: Option<String>,
	error_code: Option<i16>,
	created_at: chrono::DateTime<Utc>,
	updated_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
	next_id: i64,
	sequences: BTreeMap<i64, StoredSequence>,
	txs: BTreeMap<(i64, i32), SequenceTx>,
}

#[derive(Default, Clone)]
pub struct MemoryStore {
	inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
	/// Terminal error code of a sequence, if one was recorded.
	pub fn sequence_error_code(&self, sequence_id: i64) -> Option<i16> {
		let inner = self.inner.lock().expect("Lock acquired");
		inner
			.sequences
			.get(&sequence_id)
			.and_then(|sequence| sequence.error_code)
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn get_sequence_by_id(&self, sequence_id: i64) -> Result<Option<Sequence>> {
		let inner = self.inner.lock().expect("Lock acquired");

		let Some(sequence) = inner.sequences.get(&sequence_id) else {
			return Ok(None);
		};

		let txs = inner
			.txs
			.range((sequence_id, 0)..(sequence_id + 1, 0))
			.map(|(_, tx)| tx);
		let (mut broadcasted_count, mut total_count) = (0, 0);
		for tx in txs {
			total_count += 1;
			if tx.state == TxState::Confirmed {
				broadcasted_count += 1;
			}
		}

		Ok(Some(Sequence {
			id: sequence_id,
			broadcasted_count,
			total_count,
			state: sequence.state,
			error_message: sequence.error_message.clone(),
			created_at: sequence.created_at,
			updated_at: sequence.updated_at,
		}))
	}

	async fn get_sequence_txs_by_id(&self, sequence_id: i64) -> Result<Vec<SequenceTx>> {
		let inner = self.inner.lock().expect("Lock acquired");
		Ok(inner
			.txs
			.range((sequence_id, 0)..(sequence_id + 1, 0))
			.map(|(_, tx)| tx.clone())
			.collect())
	}

	async fn get_new_sequence_ids(&self) -> Result<Vec<i64>> {
		let inner = self.inner.lock().expect("Lock acquired");
		Ok(inner
			.sequences
			.iter()
			.filter(|(_, sequence)| sequence.state == SequenceState::Pending)
			.map(|(id, _)| *id)
			.collect())
	}

	async fn get_hanging_sequence_ids(&self, ttl: Duration, excluding: &[i64]) -> Result<Vec<i64>> {
		let stale_before = Utc::now() - chrono::Duration::from_std(ttl)?;
		let inner = self.inner.lock().expect("Lock acquired");
		Ok(inner
			.sequences
			.iter()
			.filter(|&(id, sequence)| {
				sequence.state == SequenceState::Processing
					&& sequence.updated_at < stale_before
					&& !excluding.contains(id)
			})
			.map(|(id, _)| *id)
			.collect())
	}

	async fn create_sequence(&self, txs: Vec<String>) -> Result<i64> {
		let now = Utc::now();
		let mut inner = self.inner.lock().expect("Lock acquired");

		inner.next_id += 1;
		let sequence_id = inner.next_id;

		inner.sequences.insert(
			sequence_id,
			StoredSequence {
				state: SequenceState::Pending,
				error_message: None,
				error_code: None,
				created_at: now,
				updated_at: now,
			},
		);

		for (position, tx) in txs.into_iter().enumerate() {
			let position = position as i32;
			inner.txs.insert(
				(sequence_id, position),
				SequenceTx {
					id: None,
					sequence_id,
					state: TxState::Pending,
					height: None,
					error_message: None,
					position_in_sequence: position,
					tx,
					created_at: now,
					updated_at: now,
				},
			);
		}

		Ok(sequence_id)
	}

	async fn set_sequence_state_by_id(&self, sequence_id: i64, state: SequenceState) -> Result<()> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		let sequence = inner
			.sequences
			.get_mut(&sequence_id)
			.ok_or_else(|| eyre!("Unknown sequence: {sequence_id}"))?;
		sequence.state = state;
		sequence.updated_at = Utc::now();
		Ok(())
	}

	async fn set_sequence_error_state_by_id(
		&self,
		sequence_id: i64,
		error_message: &str,
		error_code: i16,
	) -> Result<()> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		let sequence = inner
			.sequences
			.get_mut(&sequence_id)
			.ok_or_else(|| eyre!("Unknown sequence: {sequence_id}"))?;
		sequence.state = SequenceState::Error;
		sequence.error_message = Some(error_message.to_string());
		sequence.error_code = Some(error_code);
		sequence.updated_at = Utc::now();
		Ok(())
	}

	async fn set_sequence_tx_id(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		tx_id: &str,
	) -> Result<()> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		let tx = inner
			.txs
			.get_mut(&(sequence_id, position_in_sequence))
			.ok_or_else(|| eyre!("Unknown transaction: {sequence_id}/{position_in_sequence}"))?;
		tx.id = Some(tx_id.to_string());
		tx.updated_at = Utc::now();
		Ok(())
	}

	async fn set_sequence_tx_state(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		state: TxState,
	) -> Result<()> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		let tx = inner
			.txs
			.get_mut(&(sequence_id, position_in_sequence))
			.ok_or_else(|| eyre!("Unknown transaction: {sequence_id}/{position_in_sequence}"))?;
		tx.state = state;
		tx.updated_at = Utc::now();
		Ok(())
	}

	async fn set_sequence_tx_confirmed_state(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		height: i32,
	) -> Result<()> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		let tx = inner
			.txs
			.get_mut(&(sequence_id, position_in_sequence))
			.ok_or_else(|| eyre!("Unknown transaction: {sequence_id}/{position_in_sequence}"))?;
		tx.state = TxState::Confirmed;
		tx.height = Some(height);
		tx.updated_at = Utc::now();
		Ok(())
	}

	async fn set_sequence_tx_error_message(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		error_message: &str,
	) -> Result<()> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		let tx = inner
			.txs
			.get_mut(&(sequence_id, position_in_sequence))
			.ok_or_else(|| eyre!("Unknown transaction: {sequence_id}/{position_in_sequence}"))?;
		tx.error_message = Some(error_message.to_string());
		tx.updated_at = Utc::now();
		Ok(())
	}

	async fn reset_sequence_tx_error_message(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
	) -> Result<()> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		let tx = inner
			.txs
			.get_mut(&(sequence_id, position_in_sequence))
			.ok_or_else(|| eyre!("Unknown transaction: {sequence_id}/{position_in_sequence}"))?;
		tx.error_message = None;
		tx.updated_at = Utc::now();
		Ok(())
	}

	async fn set_sequence_txs_state_after(
		&self,
		sequence_id: i64,
		tx_id: &str,
		state: TxState,
	) -> Result<()> {
		let now = Utc::now();
		let mut inner = self.inner.lock().expect("Lock acquired");

		let position = inner
			.txs
			.range((sequence_id, 0)..(sequence_id + 1, 0))
			.find(|(_, tx)| tx.id.as_deref() == Some(tx_id))
			.map(|(_, tx)| tx.position_in_sequence)
			.ok_or_else(|| eyre!("Unknown transaction id: {tx_id}"))?;

		for (_, tx) in inner
			.txs
			.range_mut((sequence_id, position)..(sequence_id + 1, 0))
		{
			tx.state = state;
			tx.updated_at = now;
		}

		Ok(())
	}
}
