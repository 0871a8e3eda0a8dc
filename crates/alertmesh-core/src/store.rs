//! Sharded in-memory alert table.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{Alert, Fingerprint};
use crate::version::Version;

const SHARD_COUNT: usize = 16;

/// The replicated alert table, keyed by fingerprint.
///
/// Records are spread over a fixed number of `RwLock` shards chosen by
/// fingerprint, so writers for unrelated alerts do not contend.
#[derive(Debug)]
pub struct AlertStore {
    shards: Vec<RwLock<HashMap<Fingerprint, Alert>>>,
}

impl Default for AlertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, fingerprint: Fingerprint) -> &RwLock<HashMap<Fingerprint, Alert>> {
        &self.shards[(fingerprint.as_u64() % SHARD_COUNT as u64) as usize]
    }

    /// Runs `f` on the slot for `fingerprint` under the shard's write lock.
    ///
    /// The closure sees `None` for an unknown fingerprint; whatever it leaves in
    /// the slot is stored.
    pub fn update<R>(&self, fingerprint: Fingerprint, f: impl FnOnce(&mut Option<Alert>) -> R) -> R {
        let mut shard = self.shard(fingerprint).write();
        let mut slot = shard.remove(&fingerprint);
        let result = f(&mut slot);
        if let Some(alert) = slot {
            shard.insert(fingerprint, alert);
        }
        result
    }

    /// Returns a copy of the alert with the given fingerprint.
    #[must_use]
    pub fn get(&self, fingerprint: Fingerprint) -> Option<Alert> {
        self.shard(fingerprint).read().get(&fingerprint).cloned()
    }

    /// Returns copies of all alerts, ordered by fingerprint.
    #[must_use]
    pub fn list(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .shards
            .iter()
            .flat_map(|s| s.read().values().cloned().collect::<Vec<_>>())
            .collect();
        alerts.sort_by_key(|a| a.fingerprint);
        alerts
    }

    /// Returns the number of stored alerts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Returns true if the store holds no alerts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a replicated record if it is newer than the local one.
    ///
    /// Returns true if the record was stored.
    pub fn merge(&self, alert: Alert) -> bool {
        let mut shard = self.shard(alert.fingerprint).write();
        match shard.get(&alert.fingerprint) {
            Some(existing) if existing.version >= alert.version => false,
            _ => {
                shard.insert(alert.fingerprint, alert);
                true
            }
        }
    }

    /// Returns the version of every stored alert.
    #[must_use]
    pub fn digest(&self) -> HashMap<Fingerprint, Version> {
        self.shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .iter()
                    .map(|(fp, a)| (*fp, a.version.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Removes every alert for which `expired` returns true; returns the count.
    pub fn remove_where(&self, mut expired: impl FnMut(&Alert) -> bool) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            let before = shard.len();
            shard.retain(|_, a| !expired(a));
            removed += before - shard.len();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertState, LabelSet};
    use chrono::Utc;

    fn alert(name: &str, version: Version) -> Alert {
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), name.into());
        let now = Utc::now();
        Alert {
            fingerprint: Fingerprint::from_labels(&labels),
            labels,
            annotations: LabelSet::new(),
            starts_at: now,
            ends_at: None,
            generator_url: String::new(),
            state: AlertState::Firing,
            pending_since: now,
            fired_at: Some(now),
            expires_at: now,
            updated_at: now,
            version,
        }
    }

    #[test]
    fn update_inserts_and_removes() {
        let store = AlertStore::new();
        let a = alert("A", Version::new(1, "x"));
        let fp = a.fingerprint;

        store.update(fp, |slot| *slot = Some(a.clone()));
        assert_eq!(store.get(fp), Some(a));
        assert_eq!(store.len(), 1);

        store.update(fp, |slot| *slot = None);
        assert!(store.is_empty());
    }

    #[test]
    fn merge_keeps_newest() {
        let store = AlertStore::new();
        let old = alert("A", Version::new(1, "x"));
        let mut new = old.clone();
        new.version = Version::new(2, "y");
        new.state = AlertState::Resolved;

        assert!(store.merge(new.clone()));
        assert!(!store.merge(old.clone()));
        assert!(!store.merge(new.clone()));
        assert_eq!(store.get(old.fingerprint).map(|a| a.state), Some(AlertState::Resolved));
    }

    #[test]
    fn list_is_sorted_and_digest_complete() {
        let store = AlertStore::new();
        for name in ["A", "B", "C", "D"] {
            store.merge(alert(name, Version::new(1, "x")));
        }
        let list = store.list();
        assert_eq!(list.len(), 4);
        assert!(list.windows(2).all(|w| w[0].fingerprint < w[1].fingerprint));
        assert_eq!(store.digest().len(), 4);
    }

    #[test]
    fn remove_where_counts() {
        let store = AlertStore::new();
        store.merge(alert("A", Version::new(1, "x")));
        store.merge(alert("B", Version::new(1, "x")));
        let removed = store.remove_where(|a| a.name() == "A");
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }
}
