//! The replicated state bundle.
//!
//! [`SharedState`] groups the three replicated tables (alerts, silences and the
//! notification log) with the instance's Lamport clock. It also implements the
//! digest/diff/merge operations the gossip layer uses to converge peers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::nflog::{DEFAULT_NFLOG_RETENTION, NotificationLog, NotificationLogEntry};
use crate::silence::{DEFAULT_SILENCE_RETENTION, Silence, SilenceStore};
use crate::store::AlertStore;
use crate::types::{Alert, AlertState, Fingerprint, to_delta};
use crate::version::{LamportClock, Version};

/// Default time a resolved alert is kept before it is purged.
pub const DEFAULT_RESOLVED_RETENTION: Duration = Duration::from_secs(60 * 60);

/// How long finished records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Resolved alerts.
    pub resolved_retention: Duration,
    /// Expired silences.
    pub silence_retention: Duration,
    /// Notification log entries, counted from the send.
    pub nflog_retention: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            resolved_retention: DEFAULT_RESOLVED_RETENTION,
            silence_retention: DEFAULT_SILENCE_RETENTION,
            nflog_retention: DEFAULT_NFLOG_RETENTION,
        }
    }
}

/// Versions of every record held by one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDigest {
    /// Alert versions by fingerprint.
    #[serde(default)]
    pub alerts: HashMap<Fingerprint, Version>,
    /// Silence versions by id.
    #[serde(default)]
    pub silences: HashMap<String, Version>,
    /// Notification log versions by log key.
    #[serde(default)]
    pub nflog: HashMap<String, Version>,
}

impl StateDigest {
    /// Returns the number of records described.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.len() + self.silences.len() + self.nflog.len()
    }

    /// Returns true if the digest describes no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Full records sent from one instance to another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Alerts.
    #[serde(default)]
    pub alerts: Vec<Alert>,
    /// Silences.
    #[serde(default)]
    pub silences: Vec<Silence>,
    /// Notification log entries.
    #[serde(default)]
    pub nflog: Vec<NotificationLogEntry>,
}

impl StateDelta {
    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.len() + self.silences.len() + self.nflog.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys of records one instance wants from another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateKeys {
    /// Alert fingerprints.
    #[serde(default)]
    pub alerts: Vec<Fingerprint>,
    /// Silence ids.
    #[serde(default)]
    pub silences: Vec<String>,
    /// Notification log keys.
    #[serde(default)]
    pub nflog: Vec<String>,
}

impl StateKeys {
    /// Returns true if nothing is wanted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty() && self.silences.is_empty() && self.nflog.is_empty()
    }
}

/// Counters from a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Alerts applied.
    pub alerts: usize,
    /// Silences applied.
    pub silences: usize,
    /// Notification log entries applied.
    pub nflog: usize,
    /// Records dropped because they were already past retention.
    pub skipped: usize,
}

impl MergeStats {
    /// Returns the number of applied records.
    #[must_use]
    pub const fn applied(&self) -> usize {
        self.alerts + self.silences + self.nflog
    }
}

/// Counters from a garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Resolved alerts purged.
    pub alerts: usize,
    /// Expired silences purged.
    pub silences: usize,
    /// Notification log entries purged.
    pub nflog: usize,
}

/// The replicated tables of one instance.
#[derive(Debug)]
pub struct SharedState {
    clock: LamportClock,
    alerts: AlertStore,
    silences: SilenceStore,
    nflog: NotificationLog,
    retention: RetentionConfig,
}

impl SharedState {
    /// Creates empty state for the instance `origin`.
    #[must_use]
    pub fn new(origin: impl Into<String>, retention: RetentionConfig) -> Self {
        Self {
            clock: LamportClock::new(origin),
            alerts: AlertStore::new(),
            silences: SilenceStore::new(),
            nflog: NotificationLog::new(),
            retention,
        }
    }

    /// Returns this instance's identity.
    #[must_use]
    pub fn origin(&self) -> &str {
        self.clock.origin()
    }

    /// Returns the clock.
    #[must_use]
    pub const fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Returns the alert table.
    #[must_use]
    pub const fn alerts(&self) -> &AlertStore {
        &self.alerts
    }

    /// Returns the silence table.
    #[must_use]
    pub const fn silences(&self) -> &SilenceStore {
        &self.silences
    }

    /// Returns the notification log.
    #[must_use]
    pub const fn nflog(&self) -> &NotificationLog {
        &self.nflog
    }

    /// Returns the retention settings.
    #[must_use]
    pub const fn retention(&self) -> &RetentionConfig {
        &self.retention
    }

    /// Stamps a local mutation of a record last versioned `previous`.
    pub fn stamp(&self, previous: Option<&Version>) -> Version {
        self.clock.stamp(previous)
    }

    /// Returns the versions of every local record.
    #[must_use]
    pub fn digest(&self) -> StateDigest {
        StateDigest {
            alerts: self.alerts.digest(),
            silences: self.silences.digest(),
            nflog: self.nflog.digest(),
        }
    }

    /// Compares local state with a peer's digest.
    ///
    /// Returns the records that are newer here and the keys that are newer on
    /// the peer. Silences with equal counters but different versions go both
    /// ways, since their winner depends on content.
    #[must_use]
    pub fn diff(&self, remote: &StateDigest) -> (StateDelta, StateKeys) {
        let local = self.digest();
        let mut wants = StateKeys::default();

        let alerts_out = newer_keys(&local.alerts, &remote.alerts);
        wants.alerts = newer_keys(&remote.alerts, &local.alerts);

        let silences_out = silence_keys(&local.silences, &remote.silences);
        wants.silences = silence_keys(&remote.silences, &local.silences);

        let nflog_out = newer_keys(&local.nflog, &remote.nflog);
        wants.nflog = newer_keys(&remote.nflog, &local.nflog);

        let delta = self.collect(&StateKeys {
            alerts: alerts_out,
            silences: silences_out,
            nflog: nflog_out,
        });
        (delta, wants)
    }

    /// Returns the records named by `keys` that exist locally.
    #[must_use]
    pub fn collect(&self, keys: &StateKeys) -> StateDelta {
        StateDelta {
            alerts: keys.alerts.iter().filter_map(|fp| self.alerts.get(*fp)).collect(),
            silences: self.silences.collect(&keys.silences),
            nflog: self.nflog.collect(&keys.nflog),
        }
    }

    /// Applies records received from a peer.
    ///
    /// Merging is commutative and idempotent. Records already past their
    /// retention horizon are dropped so that purged data is not resurrected.
    pub fn merge(&self, delta: StateDelta, now: DateTime<Utc>) -> MergeStats {
        let mut stats = MergeStats::default();
        let alert_horizon = now - to_delta(self.retention.resolved_retention);
        let silence_horizon = now - to_delta(self.retention.silence_retention);

        for alert in delta.alerts {
            self.clock.observe(alert.version.counter);
            if alert_purgeable(&alert, alert_horizon) {
                stats.skipped += 1;
            } else if self.alerts.merge(alert) {
                stats.alerts += 1;
            }
        }
        for silence in delta.silences {
            self.clock.observe(silence.version.counter);
            if silence.ends_at <= silence_horizon {
                stats.skipped += 1;
            } else if self.silences.merge(silence) {
                stats.silences += 1;
            }
        }
        for entry in delta.nflog {
            self.clock.observe(entry.version.counter);
            if entry.expires_at <= now {
                stats.skipped += 1;
            } else if self.nflog.merge(entry) {
                stats.nflog += 1;
            }
        }

        if stats.applied() > 0 {
            debug!(
                alerts = stats.alerts,
                silences = stats.silences,
                nflog = stats.nflog,
                skipped = stats.skipped,
                "merged remote state"
            );
        }
        stats
    }

    /// Purges records past their retention.
    pub fn gc(&self, now: DateTime<Utc>) -> GcStats {
        let alert_horizon = now - to_delta(self.retention.resolved_retention);
        GcStats {
            alerts: self.alerts.remove_where(|a| alert_purgeable(a, alert_horizon)),
            silences: self.silences.gc(now, self.retention.silence_retention),
            nflog: self.nflog.gc(now),
        }
    }
}

fn alert_purgeable(alert: &Alert, horizon: DateTime<Utc>) -> bool {
    alert.state == AlertState::Resolved && alert.ends_at.unwrap_or(alert.updated_at) <= horizon
}

fn newer_keys<K: Clone + Eq + std::hash::Hash>(
    ours: &HashMap<K, Version>,
    theirs: &HashMap<K, Version>,
) -> Vec<K> {
    ours.iter()
        .filter(|(k, v)| theirs.get(*k).is_none_or(|t| *v > t))
        .map(|(k, _)| k.clone())
        .collect()
}

fn silence_keys(ours: &HashMap<String, Version>, theirs: &HashMap<String, Version>) -> Vec<String> {
    ours.iter()
        .filter(|(k, v)| {
            theirs
                .get(*k)
                .is_none_or(|t| v.counter > t.counter || (v.counter == t.counter && *v != t))
        })
        .map(|(k, _)| k.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::Ingress;
    use crate::silence::PostableSilence;
    use crate::types::{LabelSet, PostableAlert};
    use chrono::Duration as Delta;
    use proptest::prelude::*;

    fn state(origin: &str) -> SharedState {
        SharedState::new(origin, RetentionConfig::default())
    }

    fn alert(name: &str) -> PostableAlert {
        PostableAlert::new(LabelSet::new()).with_label("alertname", name)
    }

    fn sync_pair(a: &SharedState, b: &SharedState, now: DateTime<Utc>) {
        let (to_a, wants) = b.diff(&a.digest());
        a.merge(to_a, now);
        b.merge(a.collect(&wants), now);
    }

    #[test]
    fn diff_and_merge_converge() {
        let now = Utc::now();
        let a = state("a");
        let b = state("b");
        Ingress::default().apply(&a, alert("A"), now).unwrap();
        Ingress::default().apply(&b, alert("B"), now).unwrap();

        sync_pair(&a, &b, now);

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.alerts().len(), 2);
    }

    #[test]
    fn merge_observes_remote_clock() {
        let now = Utc::now();
        let a = state("a");
        let b = state("b");
        for _ in 0..5 {
            Ingress::default().apply(&b, alert("B"), now).unwrap();
        }
        sync_pair(&a, &b, now);
        assert!(a.clock().current() >= 5);

        let (fp, _) = Ingress::default().apply(&a, alert("B"), now).unwrap();
        assert_eq!(a.alerts().get(fp).unwrap().version.origin, "a");
        assert!(a.alerts().get(fp).unwrap().version > b.alerts().get(fp).unwrap().version);
    }

    #[test]
    fn equal_counter_silences_are_exchanged_both_ways() {
        let now = Utc::now();
        let a = state("a");
        let b = state("b");
        let id = a
            .silences()
            .upsert(
                PostableSilence {
                    id: None,
                    matchers: vec!["service=api".parse().unwrap()],
                    starts_at: now,
                    ends_at: now + Delta::hours(1),
                    created_by: "ops".into(),
                    comment: String::new(),
                },
                now,
                |p| a.stamp(p),
            )
            .unwrap();
        sync_pair(&a, &b, now);

        a.silences().expire(&id, now, |p| a.stamp(p)).unwrap();
        let mut extended = b.silences().get(&id).unwrap();
        extended.ends_at = now + Delta::hours(5);
        extended.version = b.stamp(Some(&extended.version));
        b.silences().merge(extended);

        let (delta, wants) = a.diff(&b.digest());
        assert_eq!(delta.silences.len(), 1);
        assert_eq!(wants.silences, vec![id.clone()]);

        sync_pair(&a, &b, now);
        assert_eq!(a.silences().get(&id), b.silences().get(&id));
        assert_eq!(a.silences().get(&id).unwrap().ends_at, now);
    }

    #[test]
    fn purged_alerts_are_not_resurrected() {
        let now = Utc::now();
        let a = state("a");
        let b = state("b");
        let ingress = Ingress::default();
        ingress.apply(&a, alert("A"), now).unwrap();
        ingress.apply(&a, alert("A").with_ends_at(now), now).unwrap();
        sync_pair(&a, &b, now);

        let later = now + Delta::hours(2);
        assert_eq!(a.gc(later).alerts, 1);
        assert!(a.alerts().is_empty());

        let (delta, _) = b.diff(&a.digest());
        let stats = a.merge(delta, later);
        assert_eq!(stats.skipped, 1);
        assert!(a.alerts().is_empty());
    }

    #[test]
    fn merge_twice_is_a_no_op() {
        let now = Utc::now();
        let a = state("a");
        let b = state("b");
        Ingress::default().apply(&b, alert("B"), now).unwrap();
        let (delta, _) = b.diff(&a.digest());

        let first = a.merge(delta.clone(), now);
        let digest = a.digest();
        let second = a.merge(delta, now);
        assert_eq!(first.alerts, 1);
        assert_eq!(second.applied(), 0);
        assert_eq!(a.digest(), digest);
    }

    proptest! {
        #[test]
        fn merge_order_does_not_matter(names in proptest::collection::vec("[A-D]", 1..12)) {
            let now = Utc::now();
            let sources = [state("a"), state("b"), state("c")];
            for (i, name) in names.iter().enumerate() {
                let src = &sources[i % sources.len()];
                Ingress::default().apply(src, alert(name), now).unwrap();
            }
            let deltas: Vec<StateDelta> = sources
                .iter()
                .map(|s| s.diff(&StateDigest::default()).0)
                .collect();

            let forward = state("x");
            for d in &deltas {
                forward.merge(d.clone(), now);
            }
            let backward = state("y");
            for d in deltas.iter().rev() {
                backward.merge(d.clone(), now);
            }
            prop_assert_eq!(forward.digest(), backward.digest());
        }
    }
}
