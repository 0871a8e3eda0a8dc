//! Alert grouping and notification cadence.
//!
//! Group membership is recomputed from the alert table on every tick: each
//! firing alert is routed, and the alert joins one group per matched route,
//! keyed by the route path plus the route's grouping labels. Every group owns
//! its own flush schedule (`group_wait` for the first notification,
//! `group_interval` afterwards).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::route::{Route, RouteTiming};
use crate::store::AlertStore;
use crate::types::{Alert, AlertState, Fingerprint, LabelSet, to_delta};

/// Identity of an alert group: `<route path>:{l1="v1",...}`.
///
/// Identical on every instance for the same configuration and labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    /// Builds the key for a route path and its grouping labels.
    #[must_use]
    pub fn new(route_path: &str, group_labels: &LabelSet) -> Self {
        let labels: Vec<String> = group_labels
            .iter()
            .map(|(name, value)| format!("{name}={value:?}"))
            .collect();
        Self(format!("{route_path}:{{{}}}", labels.join(",")))
    }

    /// Returns the key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of alerts sharing a route and grouping labels.
#[derive(Debug)]
pub struct AlertGroup {
    key: GroupKey,
    route_path: String,
    receiver: String,
    labels: LabelSet,
    timing: RouteTiming,
    fingerprints: BTreeSet<Fingerprint>,
    created_at: DateTime<Utc>,
    next_flush: DateTime<Utc>,
    last_flush: Option<DateTime<Utc>>,
    notified: bool,
    attempted: BTreeSet<Fingerprint>,
    inflight: Option<CancellationToken>,
}

/// Read-only view of a group for the query API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    /// Group key.
    pub group_key: GroupKey,
    /// Path of the route that owns the group.
    pub route: String,
    /// Receiver name.
    pub receiver: String,
    /// Grouping labels.
    pub labels: LabelSet,
    /// Member fingerprints.
    pub alerts: Vec<Fingerprint>,
    /// When the group was created on this instance.
    pub created_at: DateTime<Utc>,
    /// Next scheduled flush.
    pub next_flush: DateTime<Utc>,
    /// Last flush, if any.
    pub last_flush: Option<DateTime<Utc>>,
}

/// Work handed to the notification pipeline by a flush.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    /// Group the job belongs to.
    pub group_key: GroupKey,
    /// Receiver to deliver to.
    pub receiver: String,
    /// Grouping labels.
    pub group_labels: LabelSet,
    /// Firing, unmuted alerts.
    pub firing: Vec<Alert>,
    /// Resolved alerts that fired during their episode.
    pub resolved: Vec<Alert>,
    /// Every fingerprint this group has put into a firing notification.
    pub attempted: BTreeSet<Fingerprint>,
    /// Route repeat interval.
    pub repeat_interval: Duration,
    /// Cancelled when the group's firing set empties before delivery ends.
    pub cancel: CancellationToken,
}

impl NotificationJob {
    /// Returns the fingerprints of the firing alerts.
    #[must_use]
    pub fn firing_set(&self) -> BTreeSet<Fingerprint> {
        self.firing.iter().map(|a| a.fingerprint).collect()
    }
}

/// Counters from one [`GroupEngine::sync`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Groups created.
    pub created: usize,
    /// Groups removed because nothing remained in them.
    pub removed: usize,
    /// In-flight deliveries cancelled.
    pub cancelled: usize,
}

struct Membership<'a> {
    route: &'a Route,
    labels: LabelSet,
    firing: BTreeSet<Fingerprint>,
    resolved: BTreeSet<Fingerprint>,
}

/// Owns every alert group and its schedule.
#[derive(Debug, Default)]
pub struct GroupEngine {
    groups: RwLock<HashMap<GroupKey, Arc<Mutex<AlertGroup>>>>,
}

impl GroupEngine {
    /// Creates an engine with no groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes group membership from the alert table.
    ///
    /// Firing alerts create groups; resolved alerts that fired only rejoin
    /// groups that still exist so their resolution can be reported. Pending
    /// alerts are ignored until they fire.
    pub fn sync(&self, alerts: &[Alert], root: &Route, now: DateTime<Utc>) -> SyncStats {
        let mut membership: HashMap<GroupKey, Membership<'_>> = HashMap::new();
        for alert in alerts {
            let firing = match alert.state {
                AlertState::Firing => true,
                AlertState::Resolved if alert.fired_at.is_some() => false,
                _ => continue,
            };
            for route in root.route(&alert.labels) {
                let labels = route.group_labels(&alert.labels);
                let key = GroupKey::new(route.path(), &labels);
                let entry = membership.entry(key).or_insert_with(|| Membership {
                    route,
                    labels,
                    firing: BTreeSet::new(),
                    resolved: BTreeSet::new(),
                });
                if firing {
                    entry.firing.insert(alert.fingerprint);
                } else {
                    entry.resolved.insert(alert.fingerprint);
                }
            }
        }

        let mut stats = SyncStats::default();
        let mut groups = self.groups.write();

        groups.retain(|key, group| {
            let mut group = group.lock();
            let Some(members) = membership.remove(key) else {
                if let Some(token) = group.inflight.take() {
                    token.cancel();
                    stats.cancelled += 1;
                }
                stats.removed += 1;
                debug!(group = %key, "group emptied");
                return false;
            };

            group.receiver = members.route.receiver().to_string();
            group.timing = members.route.timing();
            if members.firing.is_empty() {
                if let Some(token) = group.inflight.take() {
                    token.cancel();
                    stats.cancelled += 1;
                    info!(group = %key, "cancelled in-flight notification, group resolved");
                }
            }
            group.fingerprints = &members.firing | &members.resolved;
            let members_now = group.fingerprints.clone();
            group.attempted.retain(|fp| members_now.contains(fp));
            true
        });

        for (key, members) in membership {
            if members.firing.is_empty() {
                continue;
            }
            let timing = members.route.timing();
            info!(
                group = %key,
                receiver = %members.route.receiver(),
                alerts = members.firing.len(),
                "group created"
            );
            let group = AlertGroup {
                key: key.clone(),
                route_path: members.route.path().to_string(),
                receiver: members.route.receiver().to_string(),
                labels: members.labels,
                timing,
                fingerprints: members.firing,
                created_at: now,
                next_flush: now + to_delta(timing.group_wait),
                last_flush: None,
                notified: false,
                attempted: BTreeSet::new(),
                inflight: None,
            };
            groups.insert(key, Arc::new(Mutex::new(group)));
            stats.created += 1;
        }

        stats
    }

    /// Returns the keys of groups whose flush time has come.
    #[must_use]
    pub fn due(&self, now: DateTime<Utc>) -> Vec<GroupKey> {
        let mut keys: Vec<GroupKey> = self
            .groups
            .read()
            .iter()
            .filter(|(_, g)| g.lock().next_flush <= now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Returns the next flush time of a group.
    #[must_use]
    pub fn next_flush(&self, key: &GroupKey) -> Option<DateTime<Utc>> {
        self.groups.read().get(key).map(|g| g.lock().next_flush)
    }

    /// Returns every group key.
    #[must_use]
    pub fn keys(&self) -> Vec<GroupKey> {
        let mut keys: Vec<GroupKey> = self.groups.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns the number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    /// Returns true if there are no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Returns a view of every group.
    #[must_use]
    pub fn views(&self) -> Vec<GroupView> {
        let mut views: Vec<GroupView> = self
            .groups
            .read()
            .values()
            .map(|g| {
                let g = g.lock();
                GroupView {
                    group_key: g.key.clone(),
                    route: g.route_path.clone(),
                    receiver: g.receiver.clone(),
                    labels: g.labels.clone(),
                    alerts: g.fingerprints.iter().copied().collect(),
                    created_at: g.created_at,
                    next_flush: g.next_flush,
                    last_flush: g.last_flush,
                }
            })
            .collect();
        views.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        views
    }

    /// Flushes a due group and returns the notification it produced, if any.
    ///
    /// `muted` decides whether a firing alert is silenced or inhibited. A group
    /// that has never notified and had nothing to send stays due so that it
    /// notifies on the next tick once an alert is unmuted. A group without
    /// active members is dropped after its final flush.
    pub fn flush(
        &self,
        key: &GroupKey,
        alerts: &AlertStore,
        now: DateTime<Utc>,
        muted: impl Fn(&Alert) -> bool,
    ) -> Option<NotificationJob> {
        let group = self.groups.read().get(key).cloned()?;
        let mut group = group.lock();
        if group.next_flush > now {
            return None;
        }

        let mut firing = Vec::new();
        let mut resolved = Vec::new();
        let mut active = 0usize;
        for fp in &group.fingerprints {
            let Some(alert) = alerts.get(*fp) else {
                continue;
            };
            if alert.is_active() {
                active += 1;
            }
            match alert.state {
                AlertState::Firing if !muted(&alert) => firing.push(alert),
                AlertState::Resolved if alert.fired_at.is_some() => resolved.push(alert),
                _ => {}
            }
        }

        let has_work = !firing.is_empty() || !resolved.is_empty();
        group.last_flush = Some(now);
        group.next_flush = if has_work || group.notified {
            now + to_delta(group.timing.group_interval)
        } else {
            now
        };

        let job = has_work.then(|| {
            group.notified = true;
            group.attempted.extend(firing.iter().map(|a| a.fingerprint));
            let cancel = CancellationToken::new();
            group.inflight = (!firing.is_empty()).then(|| cancel.clone());
            NotificationJob {
                group_key: group.key.clone(),
                receiver: group.receiver.clone(),
                group_labels: group.labels.clone(),
                firing,
                resolved,
                attempted: group.attempted.clone(),
                repeat_interval: group.timing.repeat_interval,
                cancel,
            }
        });

        if active == 0 {
            drop(group);
            self.groups.write().remove(key);
            debug!(group = %key, "group dropped after final flush");
        }

        job
    }
}
