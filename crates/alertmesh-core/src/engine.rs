//! The alert engine.
//!
//! [`AlertEngine`] wires ingress, grouping, suppression, routing and the
//! notification pipeline around one [`SharedState`]. It owns no timers: callers
//! drive it with [`AlertEngine::sync`] and [`AlertEngine::flush`] (the server's
//! per-group dispatcher) or with [`AlertEngine::tick`] when a single loop is
//! enough.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AlertError, Result};
use crate::group::{GroupEngine, GroupKey, GroupView, NotificationJob, SyncStats};
use crate::inhibit::{InhibitRule, InhibitRuleConfig, Inhibitor};
use crate::ingress::{IngestReport, Ingress};
use crate::matcher::{Matcher, matches_all};
use crate::pipeline::{DeliveryOutcome, NotificationPipeline};
use crate::receiver::Receiver;
use crate::route::{Route, RouteConfig};
use crate::state::SharedState;
use crate::types::{Alert, Fingerprint, PostableAlert};

/// The routing tree and inhibition rules in force.
///
/// Swapped as a whole on reload; a tick holds one snapshot from start to end.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    route: Route,
    inhibitor: Inhibitor,
}

impl RoutingSnapshot {
    /// Creates a snapshot from compiled parts.
    #[must_use]
    pub const fn new(route: Route, inhibitor: Inhibitor) -> Self {
        Self { route, inhibitor }
    }

    /// Compiles a routing tree and inhibition rules against a set of receiver names.
    ///
    /// # Errors
    ///
    /// Returns an error if a route references an unknown receiver, a route is
    /// malformed, or an inhibition matcher fails to parse.
    pub fn compile(
        route: &RouteConfig,
        inhibit_rules: &[InhibitRuleConfig],
        receivers: &BTreeSet<String>,
    ) -> Result<Self> {
        let route = Route::from_config(route, receivers)?;
        let rules = inhibit_rules
            .iter()
            .map(InhibitRule::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(route, Inhibitor::new(rules)))
    }

    /// Returns the routing tree.
    #[must_use]
    pub const fn route(&self) -> &Route {
        &self.route
    }

    /// Returns the inhibition rules.
    #[must_use]
    pub const fn inhibitor(&self) -> &Inhibitor {
        &self.inhibitor
    }
}

/// Suppression state of one alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatus {
    /// Ids of active silences matching the alert.
    pub silenced_by: Vec<String>,
    /// Firing alerts that inhibit it.
    pub inhibited_by: Vec<Fingerprint>,
}

impl AlertStatus {
    /// Returns true if the alert is silenced or inhibited.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        !self.silenced_by.is_empty() || !self.inhibited_by.is_empty()
    }
}

/// An alert as reported by the query API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertView {
    /// The stored alert.
    #[serde(flatten)]
    pub alert: Alert,
    /// Suppression state.
    pub status: AlertStatus,
    /// Receivers the alert routes to.
    pub receivers: Vec<String>,
}

/// Filter for [`AlertEngine::query`].
///
/// The three flags select which suppression states are returned; all default
/// to true.
#[derive(Debug, Clone)]
pub struct AlertQuery {
    /// Every matcher must match.
    pub matchers: Vec<Matcher>,
    /// Include alerts that are neither silenced nor inhibited.
    pub active: bool,
    /// Include silenced alerts.
    pub silenced: bool,
    /// Include inhibited alerts.
    pub inhibited: bool,
    /// Include resolved alerts still held for retention.
    pub resolved: bool,
    /// Only alerts routed to this receiver.
    pub receiver: Option<String>,
}

impl Default for AlertQuery {
    fn default() -> Self {
        Self {
            matchers: Vec::new(),
            active: true,
            silenced: true,
            inhibited: true,
            resolved: false,
            receiver: None,
        }
    }
}

impl AlertQuery {
    fn admits(&self, status: &AlertStatus) -> bool {
        let silenced = !status.silenced_by.is_empty();
        let inhibited = !status.inhibited_by.is_empty();
        if !silenced && !inhibited {
            return self.active;
        }
        (silenced && self.silenced) || (inhibited && self.inhibited)
    }
}

/// Ties the alert pipeline together around shared state.
#[derive(Debug)]
pub struct AlertEngine {
    state: Arc<SharedState>,
    ingress: Ingress,
    groups: GroupEngine,
    routing: RwLock<Arc<RoutingSnapshot>>,
    pipeline: NotificationPipeline,
}

impl AlertEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        state: Arc<SharedState>,
        ingress: Ingress,
        routing: RoutingSnapshot,
        pipeline: NotificationPipeline,
    ) -> Self {
        Self {
            state,
            ingress,
            groups: GroupEngine::new(),
            routing: RwLock::new(Arc::new(routing)),
            pipeline,
        }
    }

    /// Returns the replicated state.
    #[must_use]
    pub const fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    /// Returns the notification pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &NotificationPipeline {
        &self.pipeline
    }

    /// Returns the current routing snapshot.
    #[must_use]
    pub fn routing(&self) -> Arc<RoutingSnapshot> {
        Arc::clone(&self.routing.read())
    }

    /// Ingests a batch of alerts.
    pub fn ingest(&self, batch: Vec<PostableAlert>, now: DateTime<Utc>) -> IngestReport {
        let report = self.ingress.ingest(&self.state, batch, now);
        debug!(
            accepted = report.accepted.len(),
            rejected = report.errors.len(),
            "ingested batch"
        );
        report
    }

    /// Replaces routing, inhibition and receivers.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRoute` if a receiver named by the routing
    /// tree is missing from `receivers`; nothing is swapped in that case.
    pub fn reload(
        &self,
        routing: RoutingSnapshot,
        receivers: HashMap<String, Box<dyn Receiver>>,
    ) -> Result<()> {
        let mut missing: Vec<&str> = Vec::new();
        collect_receivers(routing.route(), &mut |name| {
            if !receivers.contains_key(name) {
                missing.push(name);
            }
        });
        if let Some(name) = missing.first() {
            return Err(AlertError::InvalidRoute {
                reason: format!("receiver '{name}' is not configured"),
            });
        }

        let receiver_count = receivers.len();
        let rules = routing.inhibitor().rule_count();
        self.pipeline.set_receivers(receivers);
        *self.routing.write() = Arc::new(routing);
        info!(receivers = receiver_count, inhibit_rules = rules, "routing reloaded");
        Ok(())
    }

    /// Promotes and expires alerts, then recomputes group membership.
    pub fn sync(&self, now: DateTime<Utc>) -> SyncStats {
        let advanced = self.ingress.advance(&self.state, now);
        let routing = self.routing();
        let alerts = self.state.alerts().list();
        let stats = self.groups.sync(&alerts, routing.route(), now);
        if advanced.promoted + advanced.expired + stats.created + stats.removed > 0 {
            debug!(
                promoted = advanced.promoted,
                expired = advanced.expired,
                groups_created = stats.created,
                groups_removed = stats.removed,
                cancelled = stats.cancelled,
                "engine synced"
            );
        }
        stats
    }

    /// Flushes one group if it is due.
    ///
    /// Silences and inhibitions are evaluated against the current state at
    /// the time of the flush.
    pub fn flush(&self, key: &GroupKey, now: DateTime<Utc>) -> Option<NotificationJob> {
        let inhibitor = self.inhibition();
        self.flush_with(key, &inhibitor, now)
    }

    fn flush_with(
        &self,
        key: &GroupKey,
        inhibitor: &Inhibitor,
        now: DateTime<Utc>,
    ) -> Option<NotificationJob> {
        let silences = self.state.silences();
        self.groups.flush(key, self.state.alerts(), now, |alert| {
            !silences.silenced_by(&alert.labels, now).is_empty()
                || inhibitor.inhibited_by(alert).is_some()
        })
    }

    fn inhibition(&self) -> Inhibitor {
        let alerts = self.state.alerts().list();
        self.routing().inhibitor().snapshot(&alerts)
    }

    /// Delivers a job through the notification pipeline.
    pub async fn deliver(&self, job: NotificationJob, now: DateTime<Utc>) -> DeliveryOutcome {
        self.pipeline.deliver(job, now).await
    }

    /// Syncs and flushes every due group, returning the produced jobs.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<NotificationJob> {
        self.sync(now);
        let inhibitor = self.inhibition();
        self.groups
            .due(now)
            .iter()
            .filter_map(|key| self.flush_with(key, &inhibitor, now))
            .collect()
    }

    /// Runs one tick and delivers its jobs in order.
    pub async fn process(&self, now: DateTime<Utc>) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();
        for job in self.tick(now) {
            outcomes.push(self.deliver(job, now).await);
        }
        outcomes
    }

    /// Returns the next flush time of a group, or `None` once it is dropped.
    #[must_use]
    pub fn next_flush(&self, key: &GroupKey) -> Option<DateTime<Utc>> {
        self.groups.next_flush(key)
    }

    /// Returns every group key.
    #[must_use]
    pub fn group_keys(&self) -> Vec<GroupKey> {
        self.groups.keys()
    }

    /// Returns every group.
    #[must_use]
    pub fn groups(&self) -> Vec<GroupView> {
        self.groups.views()
    }

    /// Returns the suppression state of an alert.
    #[must_use]
    pub fn alert_status(&self, alert: &Alert, now: DateTime<Utc>) -> AlertStatus {
        let inhibitor = self.inhibition();
        self.status_with(alert, &inhibitor, now)
    }

    fn status_with(&self, alert: &Alert, inhibitor: &Inhibitor, now: DateTime<Utc>) -> AlertStatus {
        AlertStatus {
            silenced_by: self.state.silences().silenced_by(&alert.labels, now),
            inhibited_by: inhibitor.inhibited_by(alert).into_iter().collect(),
        }
    }

    /// Returns the alerts selected by `query`, sorted by fingerprint.
    #[must_use]
    pub fn query(&self, query: &AlertQuery, now: DateTime<Utc>) -> Vec<AlertView> {
        let routing = self.routing();
        let alerts = self.state.alerts().list();
        let inhibitor = routing.inhibitor().snapshot(&alerts);

        alerts
            .into_iter()
            .filter(|a| query.resolved || a.is_active())
            .filter(|a| matches_all(&query.matchers, &a.labels))
            .filter_map(|alert| {
                let receivers: Vec<String> = routing
                    .route()
                    .route(&alert.labels)
                    .into_iter()
                    .map(|r| r.receiver().to_string())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                if let Some(wanted) = &query.receiver {
                    if !receivers.iter().any(|r| r == wanted) {
                        return None;
                    }
                }
                let status = self.status_with(&alert, &inhibitor, now);
                query.admits(&status).then_some(AlertView {
                    alert,
                    status,
                    receivers,
                })
            })
            .collect()
    }
}

fn collect_receivers<'a>(route: &'a Route, f: &mut impl FnMut(&'a str)) {
    f(route.receiver());
    for child in route.routes() {
        collect_receivers(child, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::IngestConfig;
    use crate::pipeline::RetryPolicy;
    use crate::receiver::LogReceiver;
    use crate::silence::PostableSilence;
    use crate::state::RetentionConfig;
    use crate::types::{AlertState, LabelSet};
    use chrono::Duration as Delta;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn engine(route: RouteConfig, inhibit: &[InhibitRuleConfig]) -> AlertEngine {
        let state = Arc::new(SharedState::new("peer-1", RetentionConfig::default()));
        let routing = RoutingSnapshot::compile(&route, inhibit, &names(&["ops", "pager"])).unwrap();
        let pipeline = NotificationPipeline::new(Arc::clone(&state), RetryPolicy::default());
        let engine = AlertEngine::new(state, Ingress::new(IngestConfig::default()), routing.clone(), pipeline);
        let mut receivers: HashMap<String, Box<dyn Receiver>> = HashMap::new();
        receivers.insert("ops".into(), Box::new(LogReceiver::new("ops")));
        receivers.insert("pager".into(), Box::new(LogReceiver::new("pager")));
        engine.reload(routing, receivers).unwrap();
        engine
    }

    fn post(pairs: &[(&str, &str)]) -> PostableAlert {
        pairs
            .iter()
            .fold(PostableAlert::new(LabelSet::new()), |a, (k, v)| a.with_label(*k, *v))
    }

    fn tree() -> RouteConfig {
        RouteConfig::new("ops")
            .with_group_by(["alertname"])
            .with_timing(10, 60, 3600)
            .with_route(RouteConfig::new("pager").with_matcher("severity=critical"))
    }

    mod routing {
        use super::*;

        #[test]
        fn reload_rejects_missing_receiver() {
            let engine = engine(tree(), &[]);
            let routing = engine.routing().as_ref().clone();
            let only_ops: HashMap<String, Box<dyn Receiver>> =
                HashMap::from([("ops".to_string(), Box::new(LogReceiver::new("ops")) as Box<dyn Receiver>)]);
            assert!(engine.reload(routing, only_ops).is_err());
            assert_eq!(engine.pipeline().receiver_names(), vec!["ops", "pager"]);
        }

        #[test]
        fn compile_rejects_unknown_receiver() {
            let err = RoutingSnapshot::compile(&RouteConfig::new("nobody"), &[], &names(&["ops"]));
            assert!(err.is_err());
        }
    }

    mod ticks {
        use super::*;

        #[test]
        fn group_waits_before_first_flush() {
            let engine = engine(tree(), &[]);
            let now = Utc::now();
            engine.ingest(vec![post(&[("alertname", "Down"), ("severity", "critical")])], now);

            assert!(engine.tick(now).is_empty());
            assert_eq!(engine.group_keys().len(), 1);

            let jobs = engine.tick(now + Delta::seconds(10));
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].receiver, "pager");
            assert_eq!(jobs[0].group_key.as_str(), r#"root.0:{alertname="Down"}"#);
        }

        #[test]
        fn silenced_alert_is_muted_but_visible() {
            let engine = engine(tree(), &[]);
            let now = Utc::now();
            let state = engine.state();
            state
                .silences()
                .upsert(
                    PostableSilence {
                        id: None,
                        matchers: vec!["alertname=Down".parse().unwrap()],
                        starts_at: now,
                        ends_at: now + Delta::hours(1),
                        created_by: "ops".into(),
                        comment: String::new(),
                    },
                    now,
                    |p| state.stamp(p),
                )
                .unwrap();
            engine.ingest(vec![post(&[("alertname", "Down")])], now);

            assert!(engine.tick(now).is_empty());
            assert_eq!(engine.group_keys().len(), 1);
            assert!(engine.tick(now + Delta::seconds(30)).is_empty());
            let views = engine.query(&AlertQuery::default(), now);
            assert_eq!(views.len(), 1);
            assert_eq!(views[0].status.silenced_by.len(), 1);

            let active_only = AlertQuery {
                silenced: false,
                ..AlertQuery::default()
            };
            assert!(engine.query(&active_only, now).is_empty());
        }

        #[test]
        fn inhibited_alert_reports_its_source() {
            let rule = InhibitRuleConfig {
                source_matchers: vec!["severity=critical".into()],
                target_matchers: vec!["severity=warning".into()],
                equal: vec!["cluster".into()],
            };
            let engine = engine(tree(), &[rule]);
            let now = Utc::now();
            let report = engine.ingest(
                vec![
                    post(&[("alertname", "Down"), ("severity", "critical"), ("cluster", "eu")]),
                    post(&[("alertname", "Slow"), ("severity", "warning"), ("cluster", "eu")]),
                ],
                now,
            );
            let (source, target) = (report.accepted[0], report.accepted[1]);

            let alert = engine.state().alerts().get(target).unwrap();
            assert_eq!(alert.state, AlertState::Firing);
            assert_eq!(engine.alert_status(&alert, now).inhibited_by, vec![source]);

            assert!(engine.tick(now).is_empty());
            let jobs = engine.tick(now + Delta::seconds(10));
            let receivers: Vec<&str> = jobs.iter().map(|j| j.receiver.as_str()).collect();
            assert_eq!(receivers, vec!["pager"]);
        }

        #[test]
        fn query_filters_by_receiver_and_matcher() {
            let engine = engine(tree(), &[]);
            let now = Utc::now();
            engine.ingest(
                vec![
                    post(&[("alertname", "Down"), ("severity", "critical")]),
                    post(&[("alertname", "Slow"), ("severity", "warning")]),
                ],
                now,
            );

            let pager = AlertQuery {
                receiver: Some("pager".into()),
                ..AlertQuery::default()
            };
            let views = engine.query(&pager, now);
            assert_eq!(views.len(), 1);
            assert_eq!(views[0].alert.name(), "Down");

            let slow = AlertQuery {
                matchers: vec!["alertname=~S.*".parse().unwrap()],
                ..AlertQuery::default()
            };
            assert_eq!(engine.query(&slow, now)[0].receivers, vec!["ops"]);
        }

        #[test]
        fn receivers_are_listed_once() {
            let route = RouteConfig::new("ops")
                .with_route(RouteConfig::new("ops").with_matcher("team=db").with_continue(true))
                .with_route(RouteConfig::new("pager").with_matcher("severity=critical").with_continue(true))
                .with_route(RouteConfig::new("ops").with_matcher("service=api"));
            let engine = engine(route, &[]);
            let now = Utc::now();
            engine.ingest(
                vec![post(&[
                    ("alertname", "Down"),
                    ("team", "db"),
                    ("severity", "critical"),
                    ("service", "api"),
                ])],
                now,
            );

            let views = engine.query(&AlertQuery::default(), now);
            assert_eq!(views[0].receivers, vec!["ops", "pager"]);
        }
    }
}
