//! Cooperative shutdown signalling.
//!
//! A [`Controller`] is cloned into every long-lived task. The first
//! `trigger_shutdown` call wins and wakes all `triggered_shutdown` futures;
//! tasks either await the trigger directly (the HTTP server's graceful
//! shutdown does) or wrap their work in [`Controller::with_cancel`].

use std::{
	future::Future,
	pin::Pin,
	sync::{Arc, Mutex},
	task::{Context, Poll, Waker},
};

/// Completes when the process receives a termination signal: Ctrl-C
/// (SIGINT) everywhere, SIGTERM additionally on Unix.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();

	#[cfg(unix)]
	{
		let terminate = async {
			let mut signal =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			signal.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = terminate => {},
		}
	}

	#[cfg(not(unix))]
	let _ = ctrl_c.await;
}

struct ControllerInner<T> {
	reason: Option<T>,
	on_shutdown_trigger: Vec<Waker>,
}

pub struct Controller<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Clone for Controller<T> {
	fn clone(&self) -> Self {
		Controller {
			inner: self.inner.clone(),
		}
	}
}

/// Returned by `trigger_shutdown` when a shutdown was already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyTriggered;

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Controller {
			inner: Arc::new(Mutex::new(ControllerInner {
				reason: None,
				on_shutdown_trigger: Vec::new(),
			})),
		}
	}

	/// Records the shutdown reason and wakes every waiting task. Only the
	/// first call takes effect.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), AlreadyTriggered> {
		let mut inner = self.inner.lock().expect("Lock acquired");

		if inner.reason.is_some() {
			return Err(AlreadyTriggered);
		}
		inner.reason = Some(reason);

		for waker in inner.on_shutdown_trigger.drain(..) {
			waker.wake();
		}
		Ok(())
	}

	/// A future that resolves with the shutdown reason once triggered.
	pub fn triggered_shutdown(&self) -> Triggered<T> {
		Triggered {
			inner: self.inner.clone(),
		}
	}

	/// Runs `future` to completion unless a shutdown triggers first, in
	/// which case the future is dropped and the reason returned.
	pub async fn with_cancel<F: Future>(&self, future: F) -> Result<F::Output, T> {
		tokio::select! {
			reason = self.triggered_shutdown() => Err(reason),
			output = future => Ok(output),
		}
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Controller::new()
	}
}

/// A future resolving with the shutdown reason.
pub struct Triggered<T> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Triggered<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().expect("Lock acquired");

		if let Some(reason) = inner.reason.as_ref() {
			return Poll::Ready(reason.clone());
		}

		// always push a fresh waker so we never hold a stale one
		inner.on_shutdown_trigger.push(cx.waker().clone());
		Poll::Pending
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn trigger_resolves_waiting_futures() {
		let controller = Controller::<String>::new();
		let triggered = controller.triggered_shutdown();

		let trigger = controller.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(5)).await;
			trigger.trigger_shutdown("bye".to_string()).unwrap();
		});

		assert_eq!(triggered.await, "bye");
	}

	#[tokio::test]
	async fn only_the_first_trigger_wins() {
		let controller = Controller::<String>::new();
		assert!(controller.trigger_shutdown("first".to_string()).is_ok());
		assert_eq!(
			controller.trigger_shutdown("second".to_string()),
			Err(AlreadyTriggered)
		);
		assert_eq!(controller.triggered_shutdown().await, "first");
	}

	#[tokio::test]
	async fn with_cancel_aborts_pending_work() {
		let controller = Controller::<String>::new();
		controller.trigger_shutdown("stop".to_string()).unwrap();

		let result = controller
			.with_cancel(tokio::time::sleep(Duration::from_secs(60)))
			.await;
		assert_eq!(result.unwrap_err(), "stop");
	}
}
