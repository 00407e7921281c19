use crate::{cli::CliOpts, config::RuntimeConfig};
use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use std::{fs, sync::Arc};
use tokio::sync::mpsc;
use tracing::{error, info};
use tx_broadcaster_core::{
	api,
	dispatcher::Dispatcher,
	node::{HttpClient, NodeConfig},
	shutdown::{self, Controller},
	store::PgStore,
	utils::{self, spawn_in_span},
};

mod cli;
mod config;

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut config = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err_with(|| format!("Failed to load configuration from {config_path}"))?
	} else {
		RuntimeConfig::default()
	};

	config.log_format_json = opts.logs_json || config.log_format_json;
	config.log_level = opts.verbosity.unwrap_or(config.log_level);

	// flags override the config parameters
	if let Some(http_server_port) = opts.http_server_port {
		config.api.http_server_port = http_server_port;
	}
	if let Some(node_url) = &opts.node_url {
		config.node_url = node_url.clone();
	}

	Ok(config)
}

async fn run(config: RuntimeConfig, shutdown: Controller<String>) -> Result<()> {
	let version = clap::crate_version!();
	info!(version, "Running {}", clap::crate_name!());

	let store = PgStore::connect(&config.postgres).await?;
	store.migrate().await?;
	let store = Arc::new(store);

	let node_config = NodeConfig::from(&config);
	let node_client = Arc::new(HttpClient::new(&node_config)?);

	let (nudge_tx, nudge_rx) = mpsc::channel(64);

	let server = api::Server {
		store: store.clone(),
		node_client: node_client.clone(),
		nudge: nudge_tx,
		shutdown: shutdown.clone(),
	}
	.bind(config.api.clone())?;
	spawn_in_span(server);

	let dispatcher = Dispatcher::new(
		store,
		node_client,
		(&config).into(),
		(&config).into(),
		nudge_rx,
	);

	info!("Starting dispatcher...");
	match shutdown.with_cancel(dispatcher.run_loop()).await {
		// the loop only returns on a fatal condition
		Ok(result) => result.wrap_err("Dispatcher exited"),
		Err(reason) => {
			info!("Shutting down: {reason}");
			Ok(())
		},
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let opts = CliOpts::parse();
	let config = load_runtime_config(&opts)?;

	if config.log_format_json {
		tracing::subscriber::set_global_default(utils::json_subscriber(config.log_level))
			.wrap_err("Unable to set global json subscriber")?;
	} else {
		tracing::subscriber::set_global_default(utils::default_subscriber(config.log_level))
			.wrap_err("Unable to set global default subscriber")?;
	}

	let shutdown = Controller::<String>::new();
	utils::install_panic_hooks(shutdown.clone())?;

	// a termination signal takes the same graceful path as a fatal error
	spawn_in_span({
		let shutdown = shutdown.clone();
		async move {
			shutdown::user_signal().await;
			let _ = shutdown.trigger_shutdown("Signal received".to_string());
		}
	});

	if let Err(dispatcher_error) = run(config, shutdown.clone()).await {
		error!("{dispatcher_error:#}");
		let _ = shutdown.trigger_shutdown(format!("{dispatcher_error:#}"));
		return Err(dispatcher_error);
	}

	Ok(())
}
