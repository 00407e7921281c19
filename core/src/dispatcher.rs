//! Dispatcher: the single event loop that discovers work and manages worker
//! lifetimes.
//!
//! The loop leases sequences (`state = processing` with a fresh
//! `updated_at`), spawns one worker task per leased sequence and reacts to
//! worker outcomes: completions commit `done`, recoverable failures re-lease
//! and respawn, non-recoverable failures commit `error`, and a fatal failure
//! exits the loop so the process can be restarted by the orchestration.
//!
//! Leasing is cooperative. Inside the process the `sequences_in_flight` set
//! prevents double-spawn; across processes a sequence whose heartbeat is
//! older than `sequence_ttl` counts as hanging and is taken over on the next
//! tick.

use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use std::{
	collections::HashSet,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};
use tokio::sync::mpsc;
use tracing::{debug, info_span, Instrument};

use crate::{
	node,
	store::Store,
	types::{DispatcherConfig, SequenceState, WorkerConfig},
	worker::{Worker, WorkerError},
};

pub struct Dispatcher<S, N> {
	store: Arc<S>,
	node_client: Arc<N>,
	config: DispatcherConfig,
	worker_config: WorkerConfig,
	completed_tx: mpsc::Sender<i64>,
	completed_rx: mpsc::Receiver<i64>,
	errors_tx: mpsc::Sender<(i64, WorkerError)>,
	errors_rx: mpsc::Receiver<(i64, WorkerError)>,
	nudge_rx: mpsc::Receiver<i64>,
	sequences_in_flight: Mutex<HashSet<i64>>,
	workers_counter: AtomicU64,
}

impl<S, N> Dispatcher<S, N>
where
	S: Store + 'static,
	N: node::Client + 'static,
{
	pub fn new(
		store: Arc<S>,
		node_client: Arc<N>,
		config: DispatcherConfig,
		worker_config: WorkerConfig,
		nudge_rx: mpsc::Receiver<i64>,
	) -> Self {
		let (completed_tx, completed_rx) = mpsc::channel(1);
		let (errors_tx, errors_rx) = mpsc::channel(1);

		Dispatcher {
			store,
			node_client,
			config,
			worker_config,
			completed_tx,
			completed_rx,
			errors_tx,
			errors_rx,
			nudge_rx,
			sequences_in_flight: Mutex::new(HashSet::new()),
			workers_counter: AtomicU64::new(0),
		}
	}

	/// Runs the dispatcher loop until a fatal condition occurs.
	pub async fn run_loop(mut self) -> Result<()> {
		let mut ticker = tokio::time::interval_at(
			tokio::time::Instant::now() + self.config.loop_delay,
			self.config.loop_delay,
		);

		loop {
			tokio::select! {
				biased;

				Some((sequence_id, worker_error)) = self.errors_rx.recv() => {
					debug!(sequence_id, "Got new error: {worker_error}");
					self.finish_worker(sequence_id);

					match worker_error {
						WorkerError::Recoverable { .. } => {
							// refresh the lease and retry right away
							self.store
								.set_sequence_state_by_id(sequence_id, SequenceState::Processing)
								.await
								.wrap_err("Unable to set sequence processing state")?;
							self.run_worker(sequence_id);
						},
						WorkerError::NonRecoverable { message, code } => {
							self.store
								.set_sequence_error_state_by_id(sequence_id, &message, code)
								.await
								.wrap_err("Unable to set sequence error state")?;
						},
						WorkerError::Fatal { message } => {
							return Err(eyre!("Worker hit a fatal error: {message}"));
						},
					}
				},
				Some(sequence_id) = self.completed_rx.recv() => {
					debug!(sequence_id, "Got new completed sequence");
					self.finish_worker(sequence_id);

					self.store
						.set_sequence_state_by_id(sequence_id, SequenceState::Done)
						.await
						.wrap_err("Unable to set sequence done state")?;
				},
				Some(sequence_id) = self.nudge_rx.recv() => {
					debug!(sequence_id, "Got freshly admitted sequence");
					self.lease_and_spawn(sequence_id).await?;
				},
				_ = ticker.tick() => {
					// in case 2+ instances ran and all but one died, the
					// survivor takes over their hanging sequences here
					let in_flight = self.in_flight_snapshot();
					let hanging_sequence_ids = self
						.store
						.get_hanging_sequence_ids(self.config.sequence_ttl, &in_flight)
						.await
						.wrap_err("Unable to get hanging sequence ids")?;

					if !hanging_sequence_ids.is_empty() {
						debug!(
							count = hanging_sequence_ids.len(),
							?hanging_sequence_ids,
							"Processing hanging sequences"
						);
						for sequence_id in hanging_sequence_ids {
							self.lease_and_spawn(sequence_id).await?;
						}
					}
				},
				_ = std::future::ready(()) => {
					let new_sequence_ids = self
						.store
						.get_new_sequence_ids()
						.await
						.wrap_err("Unable to get new sequence ids")?;

					if !new_sequence_ids.is_empty() {
						debug!(
							count = new_sequence_ids.len(),
							?new_sequence_ids,
							"Processing new sequences"
						);
						for sequence_id in new_sequence_ids {
							self.lease_and_spawn(sequence_id).await?;
						}
					}

					tokio::time::sleep(self.config.loop_delay).await;
				},
			}
		}
	}

	async fn lease_and_spawn(&self, sequence_id: i64) -> Result<()> {
		self.store
			.set_sequence_state_by_id(sequence_id, SequenceState::Processing)
			.await
			.wrap_err("Unable to lease sequence")?;
		self.run_worker(sequence_id);
		Ok(())
	}

	fn run_worker(&self, sequence_id: i64) {
		{
			let mut in_flight = self.sequences_in_flight.lock().expect("Lock acquired");
			if !in_flight.insert(sequence_id) {
				debug!(sequence_id, "Sequence is already under processing");
				return;
			}
		}

		let worker_id = self.workers_counter.fetch_add(1, Ordering::Relaxed) + 1;
		let worker = Worker::new(
			self.store.clone(),
			self.node_client.clone(),
			self.worker_config,
		);
		let completed_tx = self.completed_tx.clone();
		let errors_tx = self.errors_tx.clone();

		tokio::spawn(
			async move {
				let send_result = match worker.run(sequence_id).await {
					Ok(()) => completed_tx.send(sequence_id).await.is_ok(),
					Err(worker_error) => {
						errors_tx.send((sequence_id, worker_error)).await.is_ok()
					},
				};

				if !send_result {
					debug!(sequence_id, "Dispatcher is gone, dropping worker outcome");
				}
			}
			.instrument(info_span!("worker", id = worker_id)),
		);
	}

	fn finish_worker(&self, sequence_id: i64) {
		let mut in_flight = self.sequences_in_flight.lock().expect("Lock acquired");
		in_flight.remove(&sequence_id);
	}

	fn in_flight_snapshot(&self) -> Vec<i64> {
		let in_flight = self.sequences_in_flight.lock().expect("Lock acquired");
		in_flight.iter().copied().collect()
	}
}
