//! The notification log.
//!
//! One entry per (receiver, group) records the last successful delivery. The
//! log is replicated to every peer, which lets any instance decide whether a
//! due notification was already sent by someone else.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::group::GroupKey;
use crate::types::{Fingerprint, to_delta};
use crate::version::Version;

/// Default time a log entry is kept after the send it records.
pub const DEFAULT_NFLOG_RETENTION: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Returns the log key for a receiver and group.
#[must_use]
pub fn log_key(receiver: &str, group_key: &GroupKey) -> String {
    format!("{receiver}/{group_key}")
}

/// Hash of the alert sets delivered in one notification.
#[must_use]
pub fn alert_set_hash(firing: &BTreeSet<Fingerprint>, resolved: &BTreeSet<Fingerprint>) -> String {
    let mut hasher = blake3::Hasher::new();
    for fp in firing {
        hasher.update(&fp.as_u64().to_be_bytes());
    }
    hasher.update(b"|");
    for fp in resolved {
        hasher.update(&fp.as_u64().to_be_bytes());
    }
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

/// Record of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationLogEntry {
    /// Group that was notified.
    pub group_key: GroupKey,
    /// Receiver that was notified.
    pub receiver: String,
    /// Hash of the firing and resolved sets.
    pub alerts_hash: String,
    /// Firing fingerprints that were sent.
    pub firing: BTreeSet<Fingerprint>,
    /// Resolved fingerprints that were sent.
    pub resolved: BTreeSet<Fingerprint>,
    /// When the send completed.
    pub sent_at: DateTime<Utc>,
    /// When the entry may be purged.
    pub expires_at: DateTime<Utc>,
    /// Replication version.
    pub version: Version,
}

impl NotificationLogEntry {
    /// Returns the key this entry is stored under.
    #[must_use]
    pub fn key(&self) -> String {
        log_key(&self.receiver, &self.group_key)
    }
}

/// Decides whether a notification must be sent given the last logged send.
///
/// Sends when nothing was logged, when a firing or resolved alert is new
/// relative to the log, or when the group is still firing and the repeat
/// interval has elapsed.
#[must_use]
pub fn needs_update(
    entry: Option<&NotificationLogEntry>,
    firing: &BTreeSet<Fingerprint>,
    resolved: &BTreeSet<Fingerprint>,
    now: DateTime<Utc>,
    repeat_interval: Duration,
) -> bool {
    let Some(entry) = entry else {
        return !firing.is_empty() || !resolved.is_empty();
    };
    if !firing.is_subset(&entry.firing) {
        return true;
    }
    if !resolved.is_subset(&entry.resolved) {
        return true;
    }
    !firing.is_empty() && now >= entry.sent_at + to_delta(repeat_interval)
}

/// The replicated notification log.
#[derive(Debug, Default)]
pub struct NotificationLog {
    entries: RwLock<HashMap<String, NotificationLogEntry>>,
}

impl NotificationLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for a receiver and group.
    #[must_use]
    pub fn get(&self, receiver: &str, group_key: &GroupKey) -> Option<NotificationLogEntry> {
        self.entries.read().get(&log_key(receiver, group_key)).cloned()
    }

    /// Stores a locally produced entry, replacing any previous one.
    pub fn record(&self, entry: NotificationLogEntry) {
        self.entries.write().insert(entry.key(), entry);
    }

    /// Applies a replicated entry if it is newer than the local one.
    pub fn merge(&self, entry: NotificationLogEntry) -> bool {
        let key = entry.key();
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(existing) if existing.version >= entry.version => false,
            _ => {
                entries.insert(key, entry);
                true
            }
        }
    }

    /// Returns the version of every entry.
    #[must_use]
    pub fn digest(&self) -> HashMap<String, Version> {
        self.entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.version.clone()))
            .collect()
    }

    /// Returns copies of the entries with the given keys.
    #[must_use]
    pub fn collect<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> Vec<NotificationLogEntry> {
        let entries = self.entries.read();
        keys.into_iter().filter_map(|k| entries.get(k).cloned()).collect()
    }

    /// Returns every entry.
    #[must_use]
    pub fn list(&self) -> Vec<NotificationLogEntry> {
        let mut list: Vec<NotificationLogEntry> = self.entries.read().values().cloned().collect();
        list.sort_by_key(NotificationLogEntry::key);
        list
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Purges entries whose `expires_at` has passed.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}
