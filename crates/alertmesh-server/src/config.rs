//! Server configuration.
//!
//! Loaded from a TOML file with these sections:
//! - `[server]`: listen address, external URL, ingest token
//! - `[cluster]`: peer identity, seeds and gossip timing
//! - `[alerts]`: lifecycle timing, retention and the grouping tick
//! - `[notify]`: delivery concurrency and retry policy
//! - `[route]`, `[[receivers]]`, `[[inhibit_rules]]`: what goes where
//!
//! Durations are integers whose field name carries the unit.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use alertmesh_cluster::{MembershipConfig, ReplicatorConfig};
use alertmesh_core::{
    IngestConfig, InhibitRuleConfig, ReceiverConfig, RetentionConfig, RetryPolicy, RouteConfig,
    RoutingSnapshot,
};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Default HTTP listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:9093";

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address the HTTP API binds to.
    pub listen: SocketAddr,
    /// URL placed in notifications to link back to this instance.
    pub external_url: String,
    /// Bearer token required on `POST /alerts` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9093)),
            external_url: String::new(),
            ingest_token: None,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Stable peer id; a random one is generated at startup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Address peers use to reach this instance; defaults to the listen address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<String>,
    /// Addresses contacted to join the cluster.
    pub seeds: Vec<String>,
    /// Milliseconds between gossip rounds.
    pub gossip_interval_ms: u64,
    /// Peers contacted per round.
    pub fanout: usize,
    /// Milliseconds allowed for one gossip request.
    pub exchange_timeout_ms: u64,
    /// Seconds of silence before a peer is suspected.
    pub suspect_after_secs: u64,
    /// Seconds of silence before a peer is considered gone.
    pub left_after_secs: u64,
    /// Seconds a departed peer stays listed.
    pub remove_after_secs: u64,
    /// Seconds each position waits before sending, so that lower positions
    /// notify first and the rest find the send in the notification log.
    pub peer_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            advertise_address: None,
            seeds: Vec::new(),
            gossip_interval_ms: 1_000,
            fanout: 3,
            exchange_timeout_ms: 2_000,
            suspect_after_secs: 5,
            left_after_secs: 30,
            remove_after_secs: 300,
            peer_timeout_secs: 2,
        }
    }
}

impl ClusterConfig {
    /// Returns the replicator settings.
    #[must_use]
    pub const fn replicator(&self) -> ReplicatorConfig {
        ReplicatorConfig {
            interval: Duration::from_millis(self.gossip_interval_ms),
            fanout: self.fanout,
            timeout: Duration::from_millis(self.exchange_timeout_ms),
            membership: MembershipConfig {
                suspect_after: Duration::from_secs(self.suspect_after_secs),
                left_after: Duration::from_secs(self.left_after_secs),
                remove_after: Duration::from_secs(self.remove_after_secs),
            },
        }
    }

    /// Returns the per-position notification delay.
    #[must_use]
    pub const fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

/// `[alerts]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Seconds an alert must stay active before it fires.
    pub min_firing_duration_secs: u64,
    /// Seconds after which an alert without `endsAt` resolves if not refreshed.
    pub resolve_timeout_secs: u64,
    /// Seconds resolved alerts are kept.
    pub resolved_retention_secs: u64,
    /// Seconds expired silences are kept.
    pub silence_retention_secs: u64,
    /// Seconds notification log entries are kept.
    pub nflog_retention_secs: u64,
    /// Milliseconds between grouping ticks.
    pub tick_interval_ms: u64,
    /// Seconds between garbage collection passes.
    pub gc_interval_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        let retention = RetentionConfig::default();
        Self {
            min_firing_duration_secs: 0,
            resolve_timeout_secs: IngestConfig::default().resolve_timeout.as_secs(),
            resolved_retention_secs: retention.resolved_retention.as_secs(),
            silence_retention_secs: retention.silence_retention.as_secs(),
            nflog_retention_secs: retention.nflog_retention.as_secs(),
            tick_interval_ms: 1_000,
            gc_interval_secs: 60,
        }
    }
}

impl AlertsConfig {
    /// Returns the ingress settings.
    #[must_use]
    pub const fn ingest(&self) -> IngestConfig {
        IngestConfig {
            min_firing_duration: Duration::from_secs(self.min_firing_duration_secs),
            resolve_timeout: Duration::from_secs(self.resolve_timeout_secs),
        }
    }

    /// Returns the retention settings.
    #[must_use]
    pub const fn retention(&self) -> RetentionConfig {
        RetentionConfig {
            resolved_retention: Duration::from_secs(self.resolved_retention_secs),
            silence_retention: Duration::from_secs(self.silence_retention_secs),
            nflog_retention: Duration::from_secs(self.nflog_retention_secs),
        }
    }

    /// Returns the grouping tick interval.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Returns the garbage collection interval.
    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

/// `[notify]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Deliveries allowed in flight at once.
    pub concurrency: usize,
    /// Attempts per notification, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after each failure.
    pub backoff_multiplier: u32,
    /// Upper bound on the delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            concurrency: 32,
            max_attempts: retry.max_attempts,
            initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            backoff_multiplier: retry.multiplier,
            max_backoff_ms: retry.max_backoff.as_millis() as u64,
        }
    }
}

impl NotifyConfig {
    /// Returns the retry policy.
    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP settings.
    #[serde(default)]
    pub server: HttpConfig,
    /// Cluster settings.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Alert lifecycle settings.
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Delivery settings.
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Root of the routing tree.
    pub route: RouteConfig,
    /// Notification targets.
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    /// Inhibition rules.
    #[serde(default)]
    pub inhibit_rules: Vec<InhibitRuleConfig>,
}

impl ServerConfig {
    /// Creates a configuration that sends everything to one receiver.
    #[must_use]
    pub fn new(receiver: ReceiverConfig) -> Self {
        Self {
            server: HttpConfig::default(),
            cluster: ClusterConfig::default(),
            alerts: AlertsConfig::default(),
            notify: NotifyConfig::default(),
            route: RouteConfig::new(receiver.name.clone()),
            receivers: vec![receiver],
            inhibit_rules: Vec::new(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a timing value is zero, a receiver is invalid or
    /// duplicated, or the routing tree or inhibition rules do not compile.
    pub fn validate(&self) -> ServerResult<()> {
        let positive = [
            ("cluster.gossip_interval_ms", self.cluster.gossip_interval_ms),
            ("cluster.fanout", self.cluster.fanout as u64),
            ("cluster.exchange_timeout_ms", self.cluster.exchange_timeout_ms),
            ("cluster.suspect_after_secs", self.cluster.suspect_after_secs),
            ("alerts.resolve_timeout_secs", self.alerts.resolve_timeout_secs),
            ("alerts.tick_interval_ms", self.alerts.tick_interval_ms),
            ("alerts.gc_interval_secs", self.alerts.gc_interval_secs),
            ("notify.concurrency", self.notify.concurrency as u64),
            ("notify.max_attempts", u64::from(self.notify.max_attempts)),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ServerError::Config(format!("{name} must be positive")));
        }
        if self.cluster.left_after_secs <= self.cluster.suspect_after_secs {
            return Err(ServerError::Config(
                "cluster.left_after_secs must exceed suspect_after_secs".to_string(),
            ));
        }
        if self.cluster.peer_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ServerError::Config("cluster.peer_id cannot be empty".to_string()));
        }

        let mut names = BTreeSet::new();
        for receiver in &self.receivers {
            receiver.validate()?;
            if !names.insert(receiver.name.clone()) {
                return Err(ServerError::Config(format!(
                    "duplicate receiver name: {}",
                    receiver.name
                )));
            }
        }
        self.routing()?;
        Ok(())
    }

    /// Returns the configured receiver names.
    #[must_use]
    pub fn receiver_names(&self) -> BTreeSet<String> {
        self.receivers.iter().map(|r| r.name.clone()).collect()
    }

    /// Compiles the routing tree and inhibition rules.
    ///
    /// # Errors
    ///
    /// Returns an error if a route or inhibition rule is invalid.
    pub fn routing(&self) -> ServerResult<RoutingSnapshot> {
        Ok(RoutingSnapshot::compile(
            &self.route,
            &self.inhibit_rules,
            &self.receiver_names(),
        )?)
    }

    /// Returns the address advertised to peers.
    #[must_use]
    pub fn advertise_address(&self) -> String {
        self.cluster
            .advertise_address
            .clone()
            .unwrap_or_else(|| self.server.listen.to_string())
    }

    /// Set the listen address.
    #[must_use]
    pub const fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.server.listen = listen;
        self
    }

    /// Set the peer id.
    #[must_use]
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.cluster.peer_id = Some(peer_id.into());
        self
    }

    /// Add seed addresses.
    #[must_use]
    pub fn with_seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cluster.seeds.extend(seeds.into_iter().map(Into::into));
        self
    }

    /// Set the ingest token.
    #[must_use]
    pub fn with_ingest_token(mut self, token: impl Into<String>) -> Self {
        self.server.ingest_token = Some(token.into());
        self
    }

    /// Set the routing tree.
    #[must_use]
    pub fn with_route(mut self, route: RouteConfig) -> Self {
        self.route = route;
        self
    }

    /// Add a receiver.
    #[must_use]
    pub fn with_receiver(mut self, receiver: ReceiverConfig) -> Self {
        self.receivers.push(receiver);
        self
    }

    /// Add an inhibition rule.
    #[must_use]
    pub fn with_inhibit_rule(mut self, rule: InhibitRuleConfig) -> Self {
        self.inhibit_rules.push(rule);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
        [server]
        listen = "127.0.0.1:9193"
        external_url = "http://alerts.example.com"
        ingest_token = "s3cret"

        [cluster]
        peer_id = "am-1"
        seeds = ["am-2:9193", "am-3:9193"]
        gossip_interval_ms = 500
        peer_timeout_secs = 10

        [alerts]
        min_firing_duration_secs = 60
        tick_interval_ms = 250

        [notify]
        concurrency = 8
        max_attempts = 3

        [route]
        receiver = "ops"
        group_by = ["alertname", "cluster"]
        group_wait_secs = 30

        [[route.routes]]
        receiver = "pager"
        matchers = ['severity="critical"']

        [[receivers]]
        name = "ops"
        type = "log"

        [[receivers]]
        name = "pager"
        type = "webhook"
        url = "https://pager.example.com/hook"

        [[inhibit_rules]]
        source_matchers = ["severity=critical"]
        target_matchers = ["severity=warning"]
        equal = ["cluster"]
    "#;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    mod parsing {
        use super::*;

        #[test]
        fn full_config() {
            let config = ServerConfig::from_toml(FULL).unwrap();
            assert_eq!(config.server.listen, "127.0.0.1:9193".parse().unwrap());
            assert_eq!(config.server.ingest_token.as_deref(), Some("s3cret"));
            assert_eq!(config.cluster.peer_id.as_deref(), Some("am-1"));
            assert_eq!(config.cluster.seeds.len(), 2);
            assert_eq!(config.cluster.peer_timeout(), Duration::from_secs(10));
            assert_eq!(
                config.alerts.ingest().min_firing_duration,
                Duration::from_secs(60)
            );
            assert_eq!(config.alerts.tick_interval(), Duration::from_millis(250));
            assert_eq!(config.notify.concurrency, 8);
            assert_eq!(config.notify.retry().max_attempts, 3);
            assert_eq!(config.receivers.len(), 2);
            assert_eq!(config.inhibit_rules.len(), 1);

            let routing = config.routing().unwrap();
            assert_eq!(routing.route().routes().len(), 1);
            assert_eq!(routing.inhibitor().rule_count(), 1);
        }

        #[test]
        fn minimal_config_uses_defaults() {
            let config = ServerConfig::from_toml(
                r#"
                route = { receiver = "ops" }
                receivers = [{ name = "ops", type = "log" }]
            "#,
            )
            .unwrap();

            assert_eq!(config.server.listen.to_string(), DEFAULT_LISTEN);
            assert_eq!(config.cluster.fanout, 3);
            assert_eq!(config.notify.concurrency, 32);
            assert_eq!(config.alerts.min_firing_duration_secs, 0);
            assert_eq!(config.alerts.retention(), RetentionConfig::default());
            assert_eq!(config.notify.retry(), RetryPolicy::default());
            assert_eq!(config.advertise_address(), DEFAULT_LISTEN);
        }

        #[test]
        fn round_trips_through_toml() {
            let config = ServerConfig::from_toml(FULL).unwrap();
            let text = config.to_toml().unwrap();
            assert_eq!(ServerConfig::from_toml(&text).unwrap(), config);
        }

        #[test]
        fn replicator_settings() {
            let config = ServerConfig::from_toml(FULL).unwrap();
            let replicator = config.cluster.replicator();
            assert_eq!(replicator.interval, Duration::from_millis(500));
            assert_eq!(replicator.fanout, 3);
            assert_eq!(replicator.membership.left_after, Duration::from_secs(30));
        }
    }

    mod validation {
        use super::*;

        fn base() -> ServerConfig {
            ServerConfig::new(ReceiverConfig::log("ops"))
        }

        #[test]
        fn default_config_is_valid() {
            assert!(base().validate().is_ok());
        }

        #[test]
        fn unknown_route_receiver_rejected() {
            let config = base().with_route(RouteConfig::new("nobody"));
            assert!(matches!(config.validate(), Err(ServerError::Alert(_))));
        }

        #[test]
        fn duplicate_receiver_rejected() {
            let config = base().with_receiver(ReceiverConfig::log("ops"));
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("duplicate"));
        }

        #[test]
        fn zero_fanout_rejected() {
            let mut config = base();
            config.cluster.fanout = 0;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("cluster.fanout"));
        }

        #[test]
        fn left_must_follow_suspect() {
            let mut config = base();
            config.cluster.left_after_secs = config.cluster.suspect_after_secs;
            assert!(config.validate().is_err());
        }

        #[test]
        fn bad_inhibit_matcher_rejected() {
            let config = base().with_inhibit_rule(InhibitRuleConfig {
                source_matchers: vec!["=oops".to_string()],
                ..Default::default()
            });
            assert!(config.validate().is_err());
        }

        #[test]
        fn blank_peer_id_rejected() {
            assert!(base().with_peer_id(" ").validate().is_err());
        }

        #[test]
        fn builders() {
            let config = base()
                .with_listen("127.0.0.1:1".parse().unwrap())
                .with_seeds(["a:1", "b:2"])
                .with_ingest_token("t");
            assert_eq!(config.advertise_address(), "127.0.0.1:1");
            assert_eq!(config.cluster.seeds, vec!["a:1", "b:2"]);
            assert_eq!(config.server.ingest_token.as_deref(), Some("t"));
        }
    }

    mod files {
        use super::*;

        #[test]
        fn load_from_file() {
            let file = create_temp_config(FULL);
            let config = ServerConfig::from_file(file.path()).unwrap();
            assert_eq!(config.cluster.peer_id.as_deref(), Some("am-1"));
        }

        #[test]
        fn example_config_is_valid() {
            let config =
                ServerConfig::from_toml(include_str!("../../../alertmesh.example.toml")).unwrap();
            assert_eq!(config.receivers.len(), 3);
            assert_eq!(config.route.routes.len(), 2);
            assert!(config.route.routes[1].continue_matching);
        }

        #[test]
        fn missing_file() {
            let err = ServerConfig::from_file("/nonexistent/alertmesh.toml").unwrap_err();
            assert!(matches!(err, ServerError::Config(_)));
        }

        #[test]
        fn invalid_toml() {
            let file = create_temp_config("route = [");
            let err = ServerConfig::from_file(file.path()).unwrap_err();
            assert!(matches!(err, ServerError::Toml(_)));
        }
    }
}
