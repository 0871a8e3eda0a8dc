//! Server lifecycle: HTTP API, gossip replicator and dispatcher.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use alertmesh_cluster::HttpTransport;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::error::{ServerError, ServerResult};
use crate::routes::create_router;
use crate::state::AppState;

/// An alertmesh instance.
#[derive(Debug, Clone)]
pub struct AlertmeshServer {
    state: Arc<AppState>,
    dispatcher: Arc<Dispatcher>,
}

impl AlertmeshServer {
    /// Builds an instance that gossips over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not compile or the HTTP
    /// client cannot be created.
    pub fn new(config: ServerConfig, config_path: Option<PathBuf>) -> ServerResult<Self> {
        let transport = Arc::new(HttpTransport::new(config.cluster.replicator().timeout)?);
        let state = Arc::new(AppState::build(config, config_path, transport)?);
        Ok(Self::from_state(state))
    }

    /// Wraps already built state.
    #[must_use]
    pub fn from_state(state: Arc<AppState>) -> Self {
        let config = state.config();
        let dispatch = DispatchConfig {
            tick_interval: config.alerts.tick_interval(),
            gc_interval: config.alerts.gc_interval(),
            peer_timeout: config.cluster.peer_timeout(),
            concurrency: config.notify.concurrency,
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(state.engine()),
            Arc::clone(state.replicator()),
            dispatch,
        ));
        Self { state, dispatcher }
    }

    /// Get the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serves until `shutdown` is cancelled.
    ///
    /// The replicator and dispatcher run as background tasks and are stopped
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails or the server fails.
    pub async fn serve_with_shutdown(
        &self,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> ServerResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;

        info!(addr = %addr, peer = %self.state.replicator().local().id, "alertmesh listening");

        let replicator = tokio::spawn(
            Arc::clone(self.state.replicator()).run(shutdown.child_token()),
        );
        let dispatcher = tokio::spawn(Arc::clone(&self.dispatcher).run(shutdown.child_token()));

        let router = create_router(Arc::clone(&self.state));
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .map_err(|e| ServerError::Internal(e.to_string()));

        shutdown.cancel();
        for (name, task) in [("replicator", replicator), ("dispatcher", dispatcher)] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "background task failed");
            }
        }
        info!("alertmesh stopped");
        served
    }
}

/// Cancels `token` on Ctrl-C or SIGTERM.
pub async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, initiating shutdown"),
        () = terminate => info!("received SIGTERM, initiating shutdown"),
    }
    token.cancel();
}

/// Reloads the configuration on every SIGHUP until `shutdown` is cancelled.
#[cfg(unix)]
pub async fn reload_on_sighup(state: Arc<AppState>, shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "failed to listen for SIGHUP");
            return;
        }
    };
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!("received SIGHUP, reloading configuration");
                if let Err(e) = state.reload() {
                    error!(error = %e, "reload failed; keeping previous configuration");
                }
            }
        }
    }
}

/// SIGHUP is unavailable; reloads go through `POST /-/reload`.
#[cfg(not(unix))]
pub async fn reload_on_sighup(_state: Arc<AppState>, shutdown: CancellationToken) {
    shutdown.cancelled().await;
}
