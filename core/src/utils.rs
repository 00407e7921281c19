//! Process-level helpers: tracing subscribers, panic hooks and
//! span-preserving task spawning.

use crate::shutdown::Controller;
use color_eyre::Result;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{error, Instrument, Level, Subscriber};
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt::format, layer::SubscriberExt, EnvFilter, FmtSubscriber};

pub fn spawn_in_span<F>(future: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tokio::spawn(future.in_current_span())
}

fn env_filter(log_level: Level) -> EnvFilter {
	EnvFilter::new(format!(
		"tx_broadcaster_core={log_level},tx_broadcaster_client={log_level},warn"
	))
}

pub fn json_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.json()
		.with_env_filter(env_filter(log_level))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

pub fn default_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.with_env_filter(env_filter(log_level))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

/// Installs color-eyre hooks and a panic hook that triggers a process
/// shutdown before reporting, so sibling tasks stop cleanly.
pub fn install_panic_hooks(shutdown: Controller<String>) -> Result<()> {
	let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default()
		.display_location_section(true)
		.display_env_section(true)
		.into_hooks();

	eyre_hook.install()?;

	std::panic::set_hook(Box::new(move |panic_info| {
		let _ = shutdown.trigger_shutdown("Panic occurred, shutting down".to_string());

		let message = format!("{}", panic_hook.panic_report(panic_info));
		error!("Error: {}", strip_ansi_escapes::strip_str(message));

		#[cfg(debug_assertions)]
		{
			// better-panic stacktrace that is only enabled when debugging
			better_panic::Settings::auto()
				.most_recent_first(false)
				.lineno_suffix(true)
				.verbosity(better_panic::Verbosity::Medium)
				.create_panic_handler()(panic_info);
		}
	}));
	Ok(())
}
