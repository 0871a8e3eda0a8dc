//! Silences: time-bounded suppression of notifications for matching alerts.
//!
//! A silence never hides an alert from the query API; it only keeps matching
//! alerts out of notifications while it is active. Expired silences stay in the
//! store until the retention window passes and are purged lazily by `gc`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{AlertError, Result};
use crate::matcher::{Matcher, matches_all};
use crate::types::{LabelSet, to_delta};
use crate::version::Version;

/// Default time an expired silence is kept before it is purged.
pub const DEFAULT_SILENCE_RETENTION: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Derived state of a silence at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceState {
    /// Starts in the future.
    Pending,
    /// Currently suppressing.
    Active,
    /// Ended.
    Expired,
}

impl SilenceState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SilenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored, replicated silence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Silence {
    /// Unique identifier (UUID v4).
    pub id: String,
    /// All must match for the silence to apply.
    pub matchers: Vec<Matcher>,
    /// Start of the suppression window.
    pub starts_at: DateTime<Utc>,
    /// End of the suppression window (exclusive).
    pub ends_at: DateTime<Utc>,
    /// Who created the silence.
    pub created_by: String,
    /// Free-form reason.
    #[serde(default)]
    pub comment: String,
    /// Wall-clock time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Replication version.
    pub version: Version,
}

impl Silence {
    /// Returns the state of the silence at `now`.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> SilenceState {
        if now < self.starts_at {
            SilenceState::Pending
        } else if now < self.ends_at {
            SilenceState::Active
        } else {
            SilenceState::Expired
        }
    }

    /// Returns true if the silence is active at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == SilenceState::Active
    }

    /// Returns true if every matcher matches the labels.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        matches_all(&self.matchers, labels)
    }

    /// Returns true if this record should replace `other` during a merge.
    ///
    /// Higher counters win. At an equal counter the earlier `ends_at` wins, so a
    /// concurrent expire beats a concurrent extend; the larger origin breaks any
    /// remaining tie.
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        use std::cmp::Ordering;
        match self.version.counter.cmp(&other.version.counter) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match other.ends_at.cmp(&self.ends_at) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => self.version.origin > other.version.origin,
            },
        }
    }
}

/// A silence as posted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableSilence {
    /// Existing silence to update; `None` creates a new one.
    #[serde(default)]
    pub id: Option<String>,
    /// Matchers; at least one is required.
    pub matchers: Vec<Matcher>,
    /// Start of the window.
    pub starts_at: DateTime<Utc>,
    /// End of the window.
    pub ends_at: DateTime<Utc>,
    /// Author.
    pub created_by: String,
    /// Reason.
    #[serde(default)]
    pub comment: String,
}

impl PostableSilence {
    /// Validates the silence.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidSilence` if there are no matchers, every
    /// matcher matches the empty string, the window is empty, or `created_by`
    /// is blank.
    pub fn validate(&self) -> Result<()> {
        if self.matchers.is_empty() {
            return Err(AlertError::InvalidSilence {
                reason: "at least one matcher is required".to_string(),
            });
        }
        if self.matchers.iter().all(|m| m.matches_value("")) {
            return Err(AlertError::InvalidSilence {
                reason: "at least one matcher must not match the empty string".to_string(),
            });
        }
        if self.ends_at <= self.starts_at {
            return Err(AlertError::InvalidSilence {
                reason: "endsAt must be after startsAt".to_string(),
            });
        }
        if self.created_by.trim().is_empty() {
            return Err(AlertError::InvalidSilence {
                reason: "createdBy is required".to_string(),
            });
        }
        Ok(())
    }
}

/// The replicated silence table.
#[derive(Debug, Default)]
pub struct SilenceStore {
    silences: RwLock<HashMap<String, Silence>>,
}

impl SilenceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates a silence and returns its id.
    ///
    /// Updating an expired silence creates a new one instead, leaving the
    /// expired record untouched.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidSilence` if validation fails and
    /// `AlertError::SilenceNotFound` if an id is given that does not exist.
    pub fn upsert(
        &self,
        postable: PostableSilence,
        now: DateTime<Utc>,
        stamp: impl FnOnce(Option<&Version>) -> Version,
    ) -> Result<String> {
        postable.validate()?;

        let mut silences = self.silences.write();
        let (id, previous) = match postable.id {
            Some(id) => {
                let existing = silences
                    .get(&id)
                    .ok_or_else(|| AlertError::SilenceNotFound { id: id.clone() })?;
                if existing.state(now) == SilenceState::Expired {
                    (Uuid::new_v4().to_string(), None)
                } else {
                    (id, Some(existing.version.clone()))
                }
            }
            None => (Uuid::new_v4().to_string(), None),
        };

        let silence = Silence {
            id: id.clone(),
            matchers: postable.matchers,
            starts_at: postable.starts_at,
            ends_at: postable.ends_at,
            created_by: postable.created_by,
            comment: postable.comment,
            updated_at: now,
            version: stamp(previous.as_ref()),
        };

        info!(
            silence_id = %id,
            created_by = %silence.created_by,
            updated = previous.is_some(),
            "silence stored"
        );
        silences.insert(id.clone(), silence);
        Ok(id)
    }

    /// Expires a silence by moving its end to `now`.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::SilenceNotFound` for an unknown id and
    /// `AlertError::SilenceExpired` if it already ended.
    pub fn expire(
        &self,
        id: &str,
        now: DateTime<Utc>,
        stamp: impl FnOnce(Option<&Version>) -> Version,
    ) -> Result<Silence> {
        let mut silences = self.silences.write();
        let silence = silences
            .get_mut(id)
            .ok_or_else(|| AlertError::SilenceNotFound { id: id.to_string() })?;

        match silence.state(now) {
            SilenceState::Expired => {
                return Err(AlertError::SilenceExpired { id: id.to_string() });
            }
            SilenceState::Pending => silence.starts_at = now,
            SilenceState::Active => {}
        }
        silence.ends_at = now;
        silence.updated_at = now;
        silence.version = stamp(Some(&silence.version));

        info!(silence_id = %id, "silence expired");
        Ok(silence.clone())
    }

    /// Returns a copy of a silence.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Silence> {
        self.silences.read().get(id).cloned()
    }

    /// Returns all silences ordered by start time.
    #[must_use]
    pub fn list(&self) -> Vec<Silence> {
        let mut list: Vec<Silence> = self.silences.read().values().cloned().collect();
        list.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Returns the number of stored silences, including expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.silences.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.silences.read().is_empty()
    }

    /// Returns the ids of every silence active at `now` that matches the labels.
    #[must_use]
    pub fn silenced_by(&self, labels: &LabelSet, now: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .silences
            .read()
            .values()
            .filter(|s| s.is_active(now) && s.matches(labels))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Applies a replicated record if it supersedes the local one.
    pub fn merge(&self, silence: Silence) -> bool {
        let mut silences = self.silences.write();
        match silences.get(&silence.id) {
            Some(existing) if !silence.supersedes(existing) => false,
            _ => {
                silences.insert(silence.id.clone(), silence);
                true
            }
        }
    }

    /// Returns the version of every stored silence.
    #[must_use]
    pub fn digest(&self) -> HashMap<String, Version> {
        self.silences
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.version.clone()))
            .collect()
    }

    /// Returns copies of the silences with the given ids.
    #[must_use]
    pub fn collect<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> Vec<Silence> {
        let silences = self.silences.read();
        ids.into_iter().filter_map(|id| silences.get(id).cloned()).collect()
    }

    /// Purges silences that ended more than `retention` before `now`.
    pub fn gc(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let horizon = now - to_delta(retention);
        let mut silences = self.silences.write();
        let before = silences.len();
        silences.retain(|_, s| s.ends_at > horizon);
        before - silences.len()
    }
}
