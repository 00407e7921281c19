use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ApiConfig {
	/// Address the HTTP server binds to.
	pub http_server_host: String,
	pub http_server_port: u16,
}

impl Default for ApiConfig {
	fn default() -> Self {
		ApiConfig {
			http_server_host: "0.0.0.0".to_string(),
			http_server_port: 3000,
		}
	}
}
