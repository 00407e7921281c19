//! HTTP server wiring: route composition, rejection mapping and graceful
//! shutdown.

use color_eyre::{eyre::WrapErr, Result};
use std::{future::Future, net::SocketAddr, str::FromStr, sync::Arc};
use tokio::sync::mpsc;
use tracing::info;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use super::{
	configuration::ApiConfig,
	handlers::error_reply,
	routes,
	types::ApiError,
};
use crate::{node, shutdown::Controller, store::Store};

pub struct Server<S, N> {
	pub store: Arc<S>,
	pub node_client: Arc<N>,
	pub nudge: mpsc::Sender<i64>,
	pub shutdown: Controller<String>,
}

impl<S, N> Server<S, N>
where
	S: Store + 'static,
	N: node::Client + 'static,
{
	/// Creates the HTTP server future; spawn it into the runtime. The server
	/// drains connections once a shutdown is triggered.
	pub fn bind(self, config: ApiConfig) -> Result<impl Future<Output = ()>> {
		let routes = routes::routes(self.store, self.node_client, self.nudge)
			.recover(handle_rejection)
			.with(warp::log("tx_broadcaster_core::api"));

		let addr = SocketAddr::from_str(&format!(
			"{}:{}",
			config.http_server_host, config.http_server_port
		))
		.wrap_err("Unable to parse HTTP server address from config")?;

		let triggered = self.shutdown.triggered_shutdown();
		let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async move {
			let _ = triggered.await;
		});

		info!("HTTP server running on http://{addr}");
		Ok(server)
	}
}

/// Maps body-deserialization rejections onto the admission error envelope;
/// everything else falls through to warp's defaults.
pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Rejection> {
	if rejection
		.find::<warp::filters::body::BodyDeserializeError>()
		.is_some()
	{
		return Ok(error_reply(
			StatusCode::BAD_REQUEST,
			ApiError::invalid_parameter_value("transactions", "Invalid request.", None),
		));
	}
	Err(rejection)
}
