//! alertmesh server.
//!
//! Hosts the HTTP API (alert ingestion, silences, queries, status), the
//! gossip endpoint and the background tasks that keep an instance running:
//! the replicator and the notification dispatcher.
//!
//! # Endpoints
//!
//! - `POST /alerts`, `GET /alerts`, `GET /alerts/groups`
//! - `POST /silences`, `GET /silences`, `GET /silences/{id}`, `DELETE /silences/{id}`
//! - `GET /status`, `GET /health`, `POST /-/reload`
//! - `POST /cluster/gossip`
//!
//! Every error is returned as `{"error": "<kind>", "message": "<text>"}`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use dispatch::{DispatchConfig, Dispatcher};
pub use error::{ApiError, ApiResult, ServerError, ServerResult};
pub use routes::create_router;
pub use server::{AlertmeshServer, reload_on_sighup, shutdown_on_signal};
pub use state::{AppState, ReloadSummary};
