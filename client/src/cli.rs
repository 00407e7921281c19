use clap::Parser;
use tracing::Level;

#[derive(Parser)]
#[command(version, about = "Reliable ordered transaction broadcaster")]
pub struct CliOpts {
	/// Path to the TOML runtime configuration file.
	#[arg(short, long)]
	pub config: Option<String>,
	/// HTTP server port.
	#[arg(short = 'p', long)]
	pub http_server_port: Option<u16>,
	/// Base URL of the blockchain node.
	#[arg(long)]
	pub node_url: Option<String>,
	/// Log level.
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Output logs in JSON format.
	#[arg(long)]
	pub logs_json: bool,
}
