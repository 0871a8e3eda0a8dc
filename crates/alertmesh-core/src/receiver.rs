//! Notification receivers.
//!
//! This module provides the [`Receiver`] trait and its implementations. The
//! notification pipeline only ever talks to the trait: one call attempts one
//! delivery and reports success or failure.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AlertError, Result};
use crate::group::GroupKey;
use crate::types::{Alert, AlertState, LabelSet};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// At least one alert is firing.
    Firing,
    /// All alerts are resolved.
    Resolved,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firing => write!(f, "firing"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A notification to be delivered to one receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Receiver name.
    pub receiver: String,
    /// Group the alerts belong to.
    pub group_key: GroupKey,
    /// Grouping labels.
    pub group_labels: LabelSet,
    /// Firing alerts followed by resolved alerts.
    pub alerts: Vec<Alert>,
    /// `Resolved` only when no alert is firing.
    pub status: NotificationStatus,
    /// Link back to this service.
    pub external_url: String,
}

impl Notification {
    /// Creates a notification; the status is derived from the alerts.
    #[must_use]
    pub fn new(
        receiver: impl Into<String>,
        group_key: GroupKey,
        group_labels: LabelSet,
        alerts: Vec<Alert>,
    ) -> Self {
        let status = if alerts.iter().any(|a| a.state == AlertState::Firing) {
            NotificationStatus::Firing
        } else {
            NotificationStatus::Resolved
        };
        Self {
            receiver: receiver.into(),
            group_key,
            group_labels,
            alerts,
            status,
            external_url: String::new(),
        }
    }

    /// Sets the external URL.
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = url.into();
        self
    }

    /// Returns a copy without resolved alerts.
    #[must_use]
    pub fn firing_only(&self) -> Self {
        let mut copy = self.clone();
        copy.alerts.retain(|a| a.state == AlertState::Firing);
        copy
    }
}

/// A delivery target.
///
/// Implement this trait to deliver notifications through other protocols.
pub trait Receiver: Send + Sync + fmt::Debug {
    /// Returns the configured receiver name.
    fn name(&self) -> &str;

    /// Returns true if resolved alerts should be delivered.
    fn send_resolved(&self) -> bool {
        true
    }

    /// Attempts one delivery.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::NotificationFailed` or `AlertError::Http` if the
    /// delivery did not succeed.
    fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>>;
}

/// Configuration for a webhook receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// The URL to POST notifications to.
    pub url: String,
    /// HTTP headers to include with requests.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Maximum number of alerts per notification; 0 means unlimited.
    #[serde(default)]
    pub max_alerts: usize,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether resolved alerts are delivered.
    #[serde(default = "default_true")]
    pub send_resolved: bool,
}

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_true() -> bool {
    true
}

impl WebhookConfig {
    /// Creates a webhook configuration.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            max_alerts: 0,
            timeout_secs: default_timeout_secs(),
            send_resolved: true,
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the maximum alerts per notification.
    #[must_use]
    pub const fn with_max_alerts(mut self, max: usize) -> Self {
        self.max_alerts = max;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Receiver kind and its settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReceiverKind {
    /// HTTP webhook with the Alertmanager v4 payload.
    Webhook(WebhookConfig),
    /// Writes alerts to the tracing log.
    Log {
        /// Whether resolved alerts are logged.
        #[serde(default = "default_true")]
        send_resolved: bool,
    },
}

/// A named receiver in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Name referenced by routes.
    pub name: String,
    /// Kind and settings.
    #[serde(flatten)]
    pub kind: ReceiverKind,
}

impl ReceiverConfig {
    /// Creates a webhook receiver configuration.
    #[must_use]
    pub fn webhook(name: impl Into<String>, config: WebhookConfig) -> Self {
        Self {
            name: name.into(),
            kind: ReceiverKind::Webhook(config),
        }
    }

    /// Creates a log receiver configuration.
    #[must_use]
    pub fn log(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ReceiverKind::Log { send_resolved: true },
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidReceiver` if the name is empty, or a
    /// webhook has an empty or non-HTTP URL or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| AlertError::InvalidReceiver {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if let ReceiverKind::Webhook(config) = &self.kind {
            if config.url.is_empty() {
                return Err(invalid("webhook URL cannot be empty"));
            }
            if !config.url.starts_with("http://") && !config.url.starts_with("https://") {
                return Err(invalid("webhook URL must be http or https"));
            }
            if config.timeout_secs == 0 {
                return Err(invalid("timeout_secs must be positive"));
            }
        }
        Ok(())
    }
}

/// Builds a receiver from its configuration.
///
/// # Errors
///
/// Returns `AlertError::InvalidReceiver` if the configuration is invalid or the
/// HTTP client cannot be created.
pub fn build_receiver(config: &ReceiverConfig) -> Result<Box<dyn Receiver>> {
    config.validate()?;
    match &config.kind {
        ReceiverKind::Webhook(webhook) => Ok(Box::new(WebhookReceiver::new(
            config.name.clone(),
            webhook.clone(),
        )?)),
        ReceiverKind::Log { send_resolved } => Ok(Box::new(
            LogReceiver::new(config.name.clone()).with_send_resolved(*send_resolved),
        )),
    }
}

/// Builds every configured receiver, keyed by name.
///
/// # Errors
///
/// Returns `AlertError::InvalidReceiver` for a duplicate name or an invalid
/// receiver.
pub fn build_receivers(configs: &[ReceiverConfig]) -> Result<HashMap<String, Box<dyn Receiver>>> {
    let mut receivers = HashMap::with_capacity(configs.len());
    for config in configs {
        if receivers.contains_key(&config.name) {
            return Err(AlertError::InvalidReceiver {
                name: config.name.clone(),
                reason: "duplicate receiver name".to_string(),
            });
        }
        receivers.insert(config.name.clone(), build_receiver(config)?);
    }
    Ok(receivers)
}

/// A webhook receiver.
///
/// POSTs the notification as JSON in the Alertmanager webhook format.
#[derive(Debug, Clone)]
pub struct WebhookReceiver {
    name: String,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookReceiver {
    /// Creates a webhook receiver.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidReceiver` if the HTTP client cannot be built.
    pub fn new(name: impl Into<String>, config: WebhookConfig) -> Result<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AlertError::InvalidReceiver {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { name, config, client })
    }

    /// Returns the webhook URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Builds the JSON payload for a notification.
    #[must_use]
    pub fn payload(&self, notification: &Notification) -> WebhookPayload {
        WebhookPayload::from_notification(notification, self.config.max_alerts)
    }
}

impl Receiver for WebhookReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_resolved(&self) -> bool {
        self.config.send_resolved
    }

    fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = self.payload(notification);
            let mut request = self.client.post(&self.config.url).json(&payload);
            for (key, value) in &self.config.headers {
                request = request.header(key, value);
            }

            debug!(
                receiver = %self.name,
                url = %self.config.url,
                alerts = payload.alerts.len(),
                truncated = payload.truncated_alerts,
                "sending webhook"
            );

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(AlertError::NotificationFailed {
                    receiver: self.name.clone(),
                    reason: format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
                })
            }
        })
    }
}

/// The payload format for webhook notifications.
///
/// Compatible with Alertmanager webhook receivers (version 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// The payload version.
    pub version: String,
    /// Group key identifying this alert group.
    pub group_key: String,
    /// Number of alerts left out because of `max_alerts`.
    pub truncated_alerts: usize,
    /// Status of the notification.
    pub status: NotificationStatus,
    /// The receiver that handles this notification.
    pub receiver: String,
    /// Grouping labels.
    pub group_labels: LabelSet,
    /// Labels common to all alerts.
    pub common_labels: LabelSet,
    /// Annotations common to all alerts.
    pub common_annotations: LabelSet,
    /// Link back to this service.
    #[serde(rename = "externalURL")]
    pub external_url: String,
    /// The alerts in this notification.
    pub alerts: Vec<WebhookAlert>,
}

impl WebhookPayload {
    /// Creates a payload from a notification, keeping at most `max_alerts`
    /// alerts (0 keeps all).
    #[must_use]
    pub fn from_notification(notification: &Notification, max_alerts: usize) -> Self {
        let keep = if max_alerts == 0 {
            notification.alerts.len()
        } else {
            max_alerts.min(notification.alerts.len())
        };
        let alerts: Vec<WebhookAlert> = notification.alerts[..keep]
            .iter()
            .map(WebhookAlert::from_alert)
            .collect();

        Self {
            version: "4".to_string(),
            group_key: notification.group_key.to_string(),
            truncated_alerts: notification.alerts.len() - keep,
            status: notification.status,
            receiver: notification.receiver.clone(),
            group_labels: notification.group_labels.clone(),
            common_labels: common(notification.alerts.iter().map(|a| &a.labels)),
            common_annotations: common(notification.alerts.iter().map(|a| &a.annotations)),
            external_url: notification.external_url.clone(),
            alerts,
        }
    }
}

fn common<'a>(mut sets: impl Iterator<Item = &'a LabelSet>) -> LabelSet {
    let Some(first) = sets.next() else {
        return LabelSet::new();
    };
    let mut shared = first.clone();
    for set in sets {
        shared.retain(|k, v| set.get(k) == Some(v));
    }
    shared
}

/// Alert format in webhook payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAlert {
    /// `firing` or `resolved`.
    pub status: String,
    /// Labels attached to the alert.
    pub labels: LabelSet,
    /// Annotations for the alert.
    pub annotations: LabelSet,
    /// When the alert started firing.
    pub starts_at: String,
    /// When the alert ended; the zero time while firing.
    pub ends_at: String,
    /// URL to the alert source.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    /// Fingerprint for deduplication.
    pub fingerprint: String,
}

const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

impl WebhookAlert {
    /// Creates a webhook alert from an alert.
    #[must_use]
    pub fn from_alert(alert: &Alert) -> Self {
        let ends_at = match alert.state {
            AlertState::Resolved => alert
                .ends_at
                .unwrap_or(alert.expires_at)
                .to_rfc3339(),
            AlertState::Pending | AlertState::Firing => ZERO_TIME.to_string(),
        };
        Self {
            status: alert.state.as_str().to_string(),
            labels: alert.labels.clone(),
            annotations: alert.annotations.clone(),
            starts_at: alert.starts_at.to_rfc3339(),
            ends_at,
            generator_url: alert.generator_url.clone(),
            fingerprint: alert.fingerprint.to_string(),
        }
    }
}

/// A receiver that writes notifications to the tracing log.
#[derive(Debug, Clone)]
pub struct LogReceiver {
    name: String,
    send_resolved: bool,
}

impl LogReceiver {
    /// Creates a log receiver.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            send_resolved: true,
        }
    }

    /// Sets whether resolved alerts are logged.
    #[must_use]
    pub const fn with_send_resolved(mut self, send_resolved: bool) -> Self {
        self.send_resolved = send_resolved;
        self
    }
}

impl Receiver for LogReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_resolved(&self) -> bool {
        self.send_resolved
    }

    fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for alert in &notification.alerts {
                let severity = alert.labels.get("severity").map_or("", String::as_str);
                let summary = alert.annotations.get("summary").map_or("", String::as_str);
                match alert.state {
                    AlertState::Resolved => info!(
                        receiver = %self.name,
                        group = %notification.group_key,
                        alertname = %alert.name(),
                        severity,
                        "RESOLVED"
                    ),
                    AlertState::Pending | AlertState::Firing => warn!(
                        receiver = %self.name,
                        group = %notification.group_key,
                        alertname = %alert.name(),
                        severity,
                        summary,
                        labels = ?alert.labels,
                        "ALERT"
                    ),
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fingerprint;
    use crate::version::Version;
    use chrono::Utc;

    fn alert(name: &str, instance: &str, state: AlertState) -> Alert {
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), name.into());
        labels.insert("instance".into(), instance.into());
        labels.insert("severity".into(), "critical".into());
        let mut annotations = LabelSet::new();
        annotations.insert("summary".into(), format!("{name} on {instance}"));
        let now = Utc::now();
        Alert {
            fingerprint: Fingerprint::from_labels(&labels),
            labels,
            annotations,
            starts_at: now,
            ends_at: None,
            generator_url: "http://prom/graph".into(),
            state,
            pending_since: now,
            fired_at: Some(now),
            expires_at: now,
            updated_at: now,
            version: Version::default(),
        }
    }

    fn notification(alerts: Vec<Alert>) -> Notification {
        Notification::new("ops", GroupKey::new("root", &LabelSet::new()), LabelSet::new(), alerts)
    }

    mod notification_tests {
        use super::*;

        #[test]
        fn status_is_firing_with_any_firing_alert() {
            let n = notification(vec![
                alert("A", "1", AlertState::Firing),
                alert("A", "2", AlertState::Resolved),
            ]);
            assert_eq!(n.status, NotificationStatus::Firing);
            assert_eq!(n.firing_only().alerts.len(), 1);
        }

        #[test]
        fn status_is_resolved_without_firing_alerts() {
            let n = notification(vec![alert("A", "1", AlertState::Resolved)]);
            assert_eq!(n.status, NotificationStatus::Resolved);
        }
    }

    mod payload_tests {
        use super::*;

        #[test]
        fn payload_is_alertmanager_v4() {
            let n = notification(vec![
                alert("HighCPU", "a", AlertState::Firing),
                alert("HighCPU", "b", AlertState::Firing),
            ])
            .with_external_url("http://alertmesh:9093");
            let payload = WebhookPayload::from_notification(&n, 0);
            let json = serde_json::to_value(&payload).unwrap();

            assert_eq!(json["version"], "4");
            assert_eq!(json["status"], "firing");
            assert_eq!(json["receiver"], "ops");
            assert_eq!(json["externalURL"], "http://alertmesh:9093");
            assert_eq!(json["commonLabels"]["alertname"], "HighCPU");
            assert!(json["commonLabels"].get("instance").is_none());
            assert_eq!(json["alerts"][0]["endsAt"], ZERO_TIME);
            assert_eq!(json["alerts"][0]["generatorURL"], "http://prom/graph");
        }

        #[test]
        fn payload_truncates_to_max_alerts() {
            let n = notification(vec![
                alert("A", "1", AlertState::Firing),
                alert("A", "2", AlertState::Firing),
                alert("A", "3", AlertState::Firing),
            ]);
            let payload = WebhookPayload::from_notification(&n, 2);
            assert_eq!(payload.alerts.len(), 2);
            assert_eq!(payload.truncated_alerts, 1);
        }

        #[test]
        fn resolved_alert_has_end_time() {
            let mut a = alert("A", "1", AlertState::Resolved);
            let end = Utc::now();
            a.ends_at = Some(end);
            let w = WebhookAlert::from_alert(&a);
            assert_eq!(w.status, "resolved");
            assert_eq!(w.ends_at, end.to_rfc3339());
        }
    }

    mod config_tests {
        use super::*;

        #[test]
        fn parses_tagged_receivers() {
            let toml_src = r#"
                [[receivers]]
                name = "ops"
                type = "webhook"
                url = "http://hooks.local/alert"
                max_alerts = 20

                [receivers.headers]
                Authorization = "Bearer abc"

                [[receivers]]
                name = "audit"
                type = "log"
                send_resolved = false
            "#;
            #[derive(Deserialize)]
            struct Wrapper {
                receivers: Vec<ReceiverConfig>,
            }
            let w: Wrapper = toml::from_str(toml_src).unwrap();
            assert_eq!(w.receivers.len(), 2);
            match &w.receivers[0].kind {
                ReceiverKind::Webhook(c) => {
                    assert_eq!(c.max_alerts, 20);
                    assert_eq!(c.timeout_secs, 10);
                    assert!(c.send_resolved);
                    assert_eq!(c.headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
                }
                ReceiverKind::Log { .. } => panic!("expected webhook"),
            }
            assert_eq!(w.receivers[1].kind, ReceiverKind::Log { send_resolved: false });
        }

        #[test]
        fn rejects_bad_webhook_url() {
            let config = ReceiverConfig::webhook("ops", WebhookConfig::new("ftp://x"));
            assert!(matches!(config.validate(), Err(AlertError::InvalidReceiver { .. })));
            let config = ReceiverConfig::webhook("ops", WebhookConfig::new(""));
            assert!(config.validate().is_err());
        }

        #[test]
        fn rejects_duplicate_names() {
            let configs = vec![ReceiverConfig::log("ops"), ReceiverConfig::log("ops")];
            assert!(build_receivers(&configs).is_err());
        }

        #[test]
        fn builds_receivers() {
            let configs = vec![
                ReceiverConfig::log("audit"),
                ReceiverConfig::webhook("ops", WebhookConfig::new("http://localhost:1/hook")),
            ];
            let receivers = build_receivers(&configs).unwrap();
            assert_eq!(receivers["ops"].name(), "ops");
            assert!(receivers["audit"].send_resolved());
        }
    }

    #[tokio::test]
    async fn log_receiver_always_succeeds() {
        let receiver = LogReceiver::new("audit");
        let n = notification(vec![alert("A", "1", AlertState::Firing)]);
        assert!(receiver.deliver(&n).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_to_closed_port_fails() {
        let receiver = WebhookReceiver::new(
            "ops",
            WebhookConfig::new("http://127.0.0.1:9/hook").with_timeout_secs(2),
        )
        .unwrap();
        let n = notification(vec![alert("A", "1", AlertState::Firing)]);
        assert!(receiver.deliver(&n).await.is_err());
    }
}
