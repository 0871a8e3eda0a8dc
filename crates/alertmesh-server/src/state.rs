//! Shared state for the HTTP handlers and background tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use alertmesh_cluster::{GossipTransport, MemberInfo, Replicator};
use alertmesh_core::{
    AlertEngine, Ingress, NotificationPipeline, SharedState, build_receivers,
};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ServerResult;

/// What a reload changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    /// Receivers now configured.
    pub receivers: usize,
    /// Inhibition rules now in force.
    pub inhibit_rules: usize,
}

/// State shared by every request handler and background task.
#[derive(Debug)]
pub struct AppState {
    config: RwLock<Arc<ServerConfig>>,
    config_path: Option<PathBuf>,
    engine: Arc<AlertEngine>,
    replicator: Arc<Replicator>,
    start_time: Instant,
}

impl AppState {
    /// Builds the engine and replicator described by `config`.
    ///
    /// `config_path` is re-read on reload; without it a reload re-applies the
    /// configuration held in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if routing or a receiver cannot be built.
    pub fn build(
        config: ServerConfig,
        config_path: Option<PathBuf>,
        transport: Arc<dyn GossipTransport>,
    ) -> ServerResult<Self> {
        let peer_id = config
            .cluster
            .peer_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let local = MemberInfo::new(peer_id.as_str(), config.advertise_address());

        let shared = Arc::new(SharedState::new(peer_id.as_str(), config.alerts.retention()));
        let routing = config.routing()?;
        let receivers = build_receivers(&config.receivers)?;

        let pipeline = NotificationPipeline::new(Arc::clone(&shared), config.notify.retry())
            .with_external_url(config.server.external_url.clone());
        let engine = AlertEngine::new(
            Arc::clone(&shared),
            Ingress::new(config.alerts.ingest()),
            routing.clone(),
            pipeline,
        );
        engine.reload(routing, receivers)?;

        let replicator = Replicator::new(local, shared, transport, config.cluster.replicator())
            .with_seeds(config.cluster.seeds.iter().cloned());

        info!(
            peer = %peer_id,
            advertise = %config.advertise_address(),
            seeds = config.cluster.seeds.len(),
            receivers = config.receivers.len(),
            "alertmesh state built"
        );

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            engine: Arc::new(engine),
            replicator: Arc::new(replicator),
            start_time: Instant::now(),
        })
    }

    /// Returns the configuration in force.
    #[must_use]
    pub fn config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config.read())
    }

    /// Returns the alert engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<AlertEngine> {
        &self.engine
    }

    /// Returns the gossip replicator.
    #[must_use]
    pub const fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Returns the replicated state.
    #[must_use]
    pub fn shared(&self) -> &Arc<SharedState> {
        self.engine.state()
    }

    /// Get server uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Returns true if `header` carries the configured ingest token, or no
    /// token is configured.
    #[must_use]
    pub fn authorize_ingest(&self, header: Option<&str>) -> bool {
        let config = self.config();
        let Some(expected) = config.server.ingest_token.as_deref() else {
            return true;
        };
        header
            .and_then(|h| h.strip_prefix("Bearer "))
            .is_some_and(|token| token.trim() == expected)
    }

    /// Reloads routing, receivers and inhibition rules.
    ///
    /// Server and cluster settings only take effect on restart. On error the
    /// previous configuration stays in force.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or does not compile.
    pub fn reload(&self) -> ServerResult<ReloadSummary> {
        let current = self.config();
        let mut next = match &self.config_path {
            Some(path) => ServerConfig::from_file(path)?,
            None => (*current).clone(),
        };

        if next.server != current.server || next.cluster != current.cluster {
            warn!("server and cluster settings changed; they apply after a restart");
            next.server = current.server.clone();
            next.cluster = current.cluster.clone();
        }

        let routing = next.routing()?;
        let receivers = build_receivers(&next.receivers)?;
        let summary = ReloadSummary {
            receivers: receivers.len(),
            inhibit_rules: routing.inhibitor().rule_count(),
        };
        self.engine.reload(routing, receivers)?;
        *self.config.write() = Arc::new(next);
        info!(
            receivers = summary.receivers,
            inhibit_rules = summary.inhibit_rules,
            "configuration reloaded"
        );
        Ok(summary)
    }
}
