//! Core types for the alerting system.
//!
//! This module provides the fundamental types used throughout alertmesh-core:
//! - [`LabelSet`]: The identity-bearing labels of an alert
//! - [`Fingerprint`]: A stable digest of a label set
//! - [`AlertState`]: The lifecycle state of an alert
//! - [`Alert`]: The stored, replicated alert record
//! - [`PostableAlert`]: An alert as submitted by a client

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::version::Version;

/// Ordered label name to value mapping.
///
/// Ordering makes fingerprints and group keys independent of insertion order.
pub type LabelSet = BTreeMap<String, String>;

/// Returns true if `name` can be used as a label name.
///
/// Any non-empty string is accepted, so names such as `service.name` or
/// `k8s-pod` pass through unchanged.
#[must_use]
pub const fn is_valid_label_name(name: &str) -> bool {
    !name.is_empty()
}

/// Stable 64-bit digest of a label set.
///
/// Computed from the first eight bytes of a BLAKE3 hash over the sorted
/// `name`/`value` pairs, so every instance derives the same fingerprint for the
/// same labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Computes the fingerprint of a label set.
    #[must_use]
    pub fn from_labels(labels: &LabelSet) -> Self {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in labels {
            hasher.update(name.as_bytes());
            hasher.update(&[0xff]);
            hasher.update(value.as_bytes());
            hasher.update(&[0xff]);
        }
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_be_bytes(bytes))
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Fingerprint {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self> {
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| AlertError::SerializationError(format!("invalid fingerprint '{s}': {e}")))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = AlertError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

/// The lifecycle state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// Received but not yet active for the minimum firing duration.
    Pending,
    /// Actively firing.
    Firing,
    /// No longer firing.
    Resolved,
}

impl AlertState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }

    /// Returns true for `Pending` and `Firing`.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Firing)
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored alert, identified by the fingerprint of its labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Digest of `labels`.
    pub fingerprint: Fingerprint,
    /// Identity labels.
    pub labels: LabelSet,
    /// Descriptive annotations; not part of identity.
    pub annotations: LabelSet,
    /// When the alert started firing according to its source.
    pub starts_at: DateTime<Utc>,
    /// Explicit end time supplied by the source, if any.
    pub ends_at: Option<DateTime<Utc>>,
    /// Link back to the source of the alert.
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
    /// Lifecycle state.
    pub state: AlertState,
    /// When the current active episode began.
    pub pending_since: DateTime<Utc>,
    /// When the current episode reached `Firing`; `None` if it never fired.
    pub fired_at: Option<DateTime<Utc>>,
    /// When the alert resolves if it is not refreshed.
    pub expires_at: DateTime<Utc>,
    /// Wall-clock time of the last local or remote mutation.
    pub updated_at: DateTime<Utc>,
    /// Replication version.
    pub version: Version,
}

impl Alert {
    /// Returns the value of the `alertname` label, or an empty string.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("", String::as_str)
    }

    /// Returns true if the alert is pending or firing.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Returns true if the alert resolved after having fired in this episode.
    #[must_use]
    pub const fn is_resolved_after_firing(&self) -> bool {
        matches!(self.state, AlertState::Resolved) && self.fired_at.is_some()
    }
}

/// An alert as posted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableAlert {
    /// Identity labels; must be non-empty.
    pub labels: LabelSet,
    /// Descriptive annotations.
    #[serde(default)]
    pub annotations: LabelSet,
    /// Optional start time; defaults to the receive time.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    /// Optional end time; a past value resolves the alert.
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// Link back to the source.
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
}

impl PostableAlert {
    /// Creates an alert with the given labels.
    #[must_use]
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            annotations: LabelSet::new(),
            starts_at: None,
            ends_at: None,
            generator_url: String::new(),
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }

    /// Sets the start time.
    #[must_use]
    pub fn with_starts_at(mut self, at: DateTime<Utc>) -> Self {
        self.starts_at = Some(at);
        self
    }

    /// Sets the end time.
    #[must_use]
    pub fn with_ends_at(mut self, at: DateTime<Utc>) -> Self {
        self.ends_at = Some(at);
        self
    }

    /// Validates the alert.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidAlert` if the label set is empty, a label
    /// name is empty, or `ends_at` precedes `starts_at`.
    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(AlertError::InvalidAlert {
                reason: "at least one label is required".to_string(),
            });
        }

        if !self.labels.keys().all(|name| is_valid_label_name(name)) {
            return Err(AlertError::InvalidAlert {
                reason: "label names must not be empty".to_string(),
            });
        }

        if let (Some(start), Some(end)) = (self.starts_at, self.ends_at) {
            if end < start {
                return Err(AlertError::InvalidAlert {
                    reason: "endsAt must not be before startsAt".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Returns the fingerprint of the labels.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_labels(&self.labels)
    }
}

/// Converts a `std` duration to a chrono duration, saturating at a century.
#[must_use]
pub fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
