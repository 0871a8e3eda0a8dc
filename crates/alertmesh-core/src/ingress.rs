//! Alert ingress: validation, deduplication and lifecycle transitions.
//!
//! Every submitted alert is reduced to its fingerprint. Submissions for an
//! alert that is already active only refresh its annotations and expiry, so any
//! number of redundant evaluator replicas collapse into one stored record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::state::SharedState;
use crate::types::{Alert, AlertState, Fingerprint, PostableAlert, to_delta};

/// Default time an alert without an explicit end stays active without being refreshed.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Ingress tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// How long an alert must be continuously present before it fires.
    pub min_firing_duration: Duration,
    /// Expiry applied to alerts submitted without `endsAt`.
    pub resolve_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_firing_duration: Duration::ZERO,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }
}

impl IngestConfig {
    /// Sets the minimum firing duration.
    #[must_use]
    pub const fn with_min_firing_duration(mut self, d: Duration) -> Self {
        self.min_firing_duration = d;
        self
    }

    /// Sets the resolve timeout.
    #[must_use]
    pub const fn with_resolve_timeout(mut self, d: Duration) -> Self {
        self.resolve_timeout = d;
        self
    }
}

/// What a single submission did to the alert table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestOutcome {
    /// A new episode was started.
    Created,
    /// An active alert was refreshed.
    Updated,
    /// The alert was resolved by an explicit end time.
    Resolved,
    /// Nothing changed.
    Unchanged,
}

/// Per-index failure inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    /// Position of the alert in the submitted batch.
    pub index: usize,
    /// Why it was rejected.
    pub message: String,
}

/// Result of ingesting a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Fingerprints of the alerts that were accepted, in batch order.
    pub accepted: Vec<Fingerprint>,
    /// Alerts that were rejected.
    pub errors: Vec<BatchError>,
}

impl IngestReport {
    /// Returns true if every alert in the batch was accepted.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Counters from one [`Ingress::advance`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceStats {
    /// Pending alerts promoted to firing.
    pub promoted: usize,
    /// Alerts resolved because they were not refreshed in time.
    pub expired: usize,
}

/// Applies submissions and time-driven transitions to the shared alert table.
#[derive(Debug, Clone, Default)]
pub struct Ingress {
    config: IngestConfig,
}

impl Ingress {
    /// Creates an ingress with the given configuration.
    #[must_use]
    pub const fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Applies a batch; each alert succeeds or fails independently.
    pub fn ingest(
        &self,
        state: &SharedState,
        batch: Vec<PostableAlert>,
        now: DateTime<Utc>,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        for (index, alert) in batch.into_iter().enumerate() {
            match self.apply(state, alert, now) {
                Ok((fingerprint, _)) => report.accepted.push(fingerprint),
                Err(e) => {
                    debug!(index, error = %e, "rejected alert");
                    report.errors.push(BatchError {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Applies a single submission.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidAlert` if the alert fails validation.
    pub fn apply(
        &self,
        state: &SharedState,
        alert: PostableAlert,
        now: DateTime<Utc>,
    ) -> Result<(Fingerprint, IngestOutcome)> {
        alert.validate()?;
        let fingerprint = alert.fingerprint();
        let ends_now = alert.ends_at.filter(|end| *end <= now);
        let expires_at = alert
            .ends_at
            .unwrap_or_else(|| now + to_delta(self.config.resolve_timeout));

        let outcome = state.alerts().update(fingerprint, |slot| {
            if let Some(existing) = slot.as_mut().filter(|a| a.is_active()) {
                existing.annotations = alert.annotations;
                existing.generator_url = alert.generator_url;
                existing.ends_at = alert.ends_at;
                existing.expires_at = expires_at;
                existing.updated_at = now;
                existing.version = state.stamp(Some(&existing.version));
                if ends_now.is_some() {
                    existing.state = AlertState::Resolved;
                    return IngestOutcome::Resolved;
                }
                return IngestOutcome::Updated;
            }

            if slot.is_some() && ends_now.is_some() {
                return IngestOutcome::Unchanged;
            }

            let previous = slot.as_ref().map(|a| a.version.clone());
            let (initial, fired_at) = if ends_now.is_some() {
                (AlertState::Resolved, None)
            } else if self.config.min_firing_duration.is_zero() {
                (AlertState::Firing, Some(now))
            } else {
                (AlertState::Pending, None)
            };
            *slot = Some(Alert {
                fingerprint,
                labels: alert.labels,
                annotations: alert.annotations,
                starts_at: alert.starts_at.unwrap_or(now),
                ends_at: alert.ends_at,
                generator_url: alert.generator_url,
                state: initial,
                pending_since: now,
                fired_at,
                expires_at,
                updated_at: now,
                version: state.stamp(previous.as_ref()),
            });
            if ends_now.is_some() {
                IngestOutcome::Resolved
            } else {
                IngestOutcome::Created
            }
        });

        match outcome {
            IngestOutcome::Created => info!(fingerprint = %fingerprint, "alert received"),
            IngestOutcome::Resolved => info!(fingerprint = %fingerprint, "alert resolved by source"),
            IngestOutcome::Updated | IngestOutcome::Unchanged => {
                debug!(fingerprint = %fingerprint, ?outcome, "alert refreshed");
            }
        }

        Ok((fingerprint, outcome))
    }

    /// Promotes pending alerts that have been present long enough and resolves
    /// active alerts whose expiry has passed.
    pub fn advance(&self, state: &SharedState, now: DateTime<Utc>) -> AdvanceStats {
        let min_firing = to_delta(self.config.min_firing_duration);
        let mut stats = AdvanceStats::default();

        for alert in state.alerts().list() {
            if !alert.is_active() {
                continue;
            }
            state.alerts().update(alert.fingerprint, |slot| {
                let Some(current) = slot.as_mut() else {
                    return;
                };
                if !current.is_active() {
                    return;
                }
                if current.expires_at <= now {
                    current.state = AlertState::Resolved;
                    current.ends_at = Some(current.expires_at);
                    current.updated_at = now;
                    current.version = state.stamp(Some(&current.version));
                    stats.expired += 1;
                    info!(fingerprint = %current.fingerprint, "alert expired");
                } else if current.state == AlertState::Pending
                    && now - current.pending_since >= min_firing
                {
                    current.state = AlertState::Firing;
                    current.fired_at = Some(now);
                    current.updated_at = now;
                    current.version = state.stamp(Some(&current.version));
                    stats.promoted += 1;
                    info!(fingerprint = %current.fingerprint, "alert firing");
                }
            });
        }

        stats
    }
}
