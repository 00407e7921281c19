//! PostgreSQL implementation of the sequence store.
//!
//! Schema lives in `core/migrations/`. Queries are runtime-checked and go
//! through a shared [`PgPool`]; the `updated_at` bump rides along with every
//! state-changing statement so the lease heartbeat can never be forgotten at
//! a call site.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};
use sqlx::{
	postgres::{PgConnectOptions, PgPoolOptions, PgRow},
	PgPool, Row,
};
use std::time::Duration;

use super::Store;
use crate::types::{Sequence, SequenceState, SequenceTx, TxState};

/// PostgreSQL connection parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PostgresConfig {
	pub host: String,
	pub port: u16,
	pub database: String,
	pub user: String,
	pub password: String,
	/// Maximum number of pooled connections (default: 8).
	pub max_connections: u32,
}

impl Default for PostgresConfig {
	fn default() -> Self {
		PostgresConfig {
			host: "localhost".to_string(),
			port: 5432,
			database: "broadcaster".to_string(),
			user: "postgres".to_string(),
			password: "".to_string(),
			max_connections: 8,
		}
	}
}

impl PostgresConfig {
	fn connect_options(&self) -> PgConnectOptions {
		PgConnectOptions::new()
			.host(&self.host)
			.port(self.port)
			.database(&self.database)
			.username(&self.user)
			.password(&self.password)
	}
}

#[derive(Clone)]
pub struct PgStore {
	pool: PgPool,
}

impl PgStore {
	pub async fn connect(config: &PostgresConfig) -> Result<Self> {
		let pool = PgPoolOptions::new()
			.max_connections(config.max_connections)
			.connect_with(config.connect_options())
			.await
			.wrap_err("Unable to connect to PostgreSQL")?;

		Ok(PgStore { pool })
	}

	/// Applies pending schema migrations.
	pub async fn migrate(&self) -> Result<()> {
		sqlx::migrate!("./migrations")
			.run(&self.pool)
			.await
			.wrap_err("Unable to run database migrations")?;
		Ok(())
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}
}

fn sequence_tx_from_row(row: &PgRow) -> Result<SequenceTx> {
	Ok(SequenceTx {
		id: row.try_get("tx_id")?,
		sequence_id: row.try_get("sequence_id")?,
		state: TxState::try_from(row.try_get::<i16, _>("state")?)?,
		height: row.try_get("height")?,
		error_message: row.try_get("error_message")?,
		position_in_sequence: row.try_get("position_in_sequence")?,
		tx: row.try_get("tx")?,
		created_at: row.try_get("created_at")?,
		updated_at: row.try_get("updated_at")?,
	})
}

#[async_trait]
impl Store for PgStore {
	async fn get_sequence_by_id(&self, sequence_id: i64) -> Result<Option<Sequence>> {
		let row = sqlx::query(
			r#"
			SELECT id, state, error_message, created_at, updated_at,
			       COALESCE((SELECT count(*) FROM sequences_txs
			                 WHERE sequence_id = $1 AND state = $2), 0) AS broadcasted_count,
			       (SELECT count(*) FROM sequences_txs WHERE sequence_id = $1) AS total_count
			FROM sequences
			WHERE id = $1
			"#,
		)
		.bind(sequence_id)
		.bind(i16::from(TxState::Confirmed))
		.fetch_optional(&self.pool)
		.await?;

		let Some(row) = row else {
			return Ok(None);
		};

		Ok(Some(Sequence {
			id: row.try_get("id")?,
			broadcasted_count: row.try_get::<i64, _>("broadcasted_count")? as u32,
			total_count: row.try_get::<i64, _>("total_count")? as u32,
			state: SequenceState::try_from(row.try_get::<i16, _>("state")?)?,
			error_message: row.try_get("error_message")?,
			created_at: row.try_get("created_at")?,
			updated_at: row.try_get("updated_at")?,
		}))
	}

	async fn get_sequence_txs_by_id(&self, sequence_id: i64) -> Result<Vec<SequenceTx>> {
		let rows = sqlx::query(
			r#"
			SELECT tx_id, sequence_id, state, height, error_message,
			       position_in_sequence, tx, created_at, updated_at
			FROM sequences_txs
			WHERE sequence_id = $1
			ORDER BY position_in_sequence ASC
			"#,
		)
		.bind(sequence_id)
		.fetch_all(&self.pool)
		.await?;

		rows.iter().map(sequence_tx_from_row).collect()
	}

	async fn get_new_sequence_ids(&self) -> Result<Vec<i64>> {
		let rows = sqlx::query("SELECT id FROM sequences WHERE state = $1 ORDER BY id ASC")
			.bind(i16::from(SequenceState::Pending))
			.fetch_all(&self.pool)
			.await?;

		rows.iter()
			.map(|row| row.try_get("id").map_err(Into::into))
			.collect()
	}

	async fn get_hanging_sequence_ids(&self, ttl: Duration, excluding: &[i64]) -> Result<Vec<i64>> {
		let stale_before = Utc::now() - chrono::Duration::from_std(ttl)?;

		let rows = sqlx::query(
			r#"
			SELECT id FROM sequences
			WHERE state = $1 AND updated_at < $2 AND NOT (id = ANY($3))
			ORDER BY id ASC
			"#,
		)
		.bind(i16::from(SequenceState::Processing))
		.bind(stale_before)
		.bind(excluding)
		.fetch_all(&self.pool)
		.await?;

		rows.iter()
			.map(|row| row.try_get("id").map_err(Into::into))
			.collect()
	}

	async fn create_sequence(&self, txs: Vec<String>) -> Result<i64> {
		let mut db_tx = self.pool.begin().await?;

		let row = sqlx::query("INSERT INTO sequences(state) VALUES($1) RETURNING id")
			.bind(i16::from(SequenceState::Pending))
			.fetch_one(&mut *db_tx)
			.await?;
		let sequence_id: i64 = row.try_get("id")?;

		for (position, tx) in txs.iter().enumerate() {
			sqlx::query(
				r#"
				INSERT INTO sequences_txs(sequence_id, state, position_in_sequence, tx)
				VALUES($1, $2, $3, $4)
				"#,
			)
			.bind(sequence_id)
			.bind(i16::from(TxState::Pending))
			.bind(position as i32)
			.bind(tx)
			.execute(&mut *db_tx)
			.await?;
		}

		db_tx.commit().await?;

		Ok(sequence_id)
	}

	async fn set_sequence_state_by_id(&self, sequence_id: i64, state: SequenceState) -> Result<()> {
		sqlx::query("UPDATE sequences SET state = $1, updated_at = now() WHERE id = $2")
			.bind(i16::from(state))
			.bind(sequence_id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn set_sequence_error_state_by_id(
		&self,
		sequence_id: i64,
		error_message: &str,
		error_code: i16,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE sequences
			SET state = $1, error_message = $2, error_code = $3, updated_at = now()
			WHERE id = $4
			"#,
		)
		.bind(i16::from(SequenceState::Error))
		.bind(error_message)
		.bind(error_code)
		.bind(sequence_id)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn set_sequence_tx_id(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		tx_id: &str,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE sequences_txs SET tx_id = $1, updated_at = now()
			WHERE sequence_id = $2 AND position_in_sequence = $3
			"#,
		)
		.bind(tx_id)
		.bind(sequence_id)
		.bind(position_in_sequence)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn set_sequence_tx_state(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		state: TxState,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE sequences_txs SET state = $1, updated_at = now()
			WHERE sequence_id = $2 AND position_in_sequence = $3
			"#,
		)
		.bind(i16::from(state))
		.bind(sequence_id)
		.bind(position_in_sequence)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn set_sequence_tx_confirmed_state(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		height: i32,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE sequences_txs SET state = $1, height = $2, updated_at = now()
			WHERE sequence_id = $3 AND position_in_sequence = $4
			"#,
		)
		.bind(i16::from(TxState::Confirmed))
		.bind(height)
		.bind(sequence_id)
		.bind(position_in_sequence)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn set_sequence_tx_error_message(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
		error_message: &str,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE sequences_txs SET error_message = $1, updated_at = now()
			WHERE sequence_id = $2 AND position_in_sequence = $3
			"#,
		)
		.bind(error_message)
		.bind(sequence_id)
		.bind(position_in_sequence)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn reset_sequence_tx_error_message(
		&self,
		sequence_id: i64,
		position_in_sequence: i32,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE sequences_txs SET error_message = NULL, updated_at = now()
			WHERE sequence_id = $1 AND position_in_sequence = $2
			"#,
		)
		.bind(sequence_id)
		.bind(position_in_sequence)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn set_sequence_txs_state_after(
		&self,
		sequence_id: i64,
		tx_id: &str,
		state: TxState,
	) -> Result<()> {
		sqlx::query(
			r#"
			UPDATE sequences_txs SET state = $1, updated_at = now()
			WHERE sequence_id = $2
			  AND position_in_sequence >= (SELECT position_in_sequence FROM sequences_txs
			                               WHERE sequence_id = $2 AND tx_id = $3)
			"#,
		)
		.bind(i16::from(state))
		.bind(sequence_id)
		.bind(tx_id)
		.execute(&self.pool)
		.await?;
		Ok(())
	}
}
