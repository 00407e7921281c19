//! HTTP admission API.
//!
//! Accepts transaction batches (`POST /sequences`), exposes their processing
//! status (`GET /sequences/:id`) and nudges the dispatcher about freshly
//! created sequences. The nudge is best-effort: steady-state correctness
//! relies on the dispatcher's own discovery pass.

pub mod configuration;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod types;

pub use configuration::ApiConfig;
pub use server::Server;
