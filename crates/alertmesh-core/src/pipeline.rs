//! The notification pipeline.
//!
//! Takes a [`NotificationJob`] produced by a group flush, consults the
//! replicated notification log, and delivers through the job's receiver with
//! bounded exponential backoff. Successful sends are logged and replicated;
//! exhausted retries are recorded in the receiver's health and never block
//! other groups.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::group::NotificationJob;
use crate::nflog::{NotificationLogEntry, alert_set_hash, needs_update};
use crate::receiver::{Notification, Receiver};
use crate::state::SharedState;
use crate::types::{Alert, Fingerprint, to_delta};

/// Retry settings for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Factor applied to the delay after each failure.
    pub multiplier: u32,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Delivery counters of one receiver on this instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverHealth {
    /// Delivery attempts, including retries.
    pub attempts: u64,
    /// Notifications delivered.
    pub successes: u64,
    /// Notifications that exhausted their retries.
    pub failures: u64,
    /// Failures since the last success.
    pub consecutive_failures: u64,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// Time of the last success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Time of the last exhausted delivery.
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Why a job was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The receiver is not configured.
    UnknownReceiver,
    /// Nothing left after filtering.
    NothingToSend,
    /// The notification log shows an equivalent send.
    AlreadyNotified,
    /// Only resolved alerts, and the receiver does not want them.
    ResolvedSuppressed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnknownReceiver => "unknown receiver",
            Self::NothingToSend => "nothing to send",
            Self::AlreadyNotified => "already notified",
            Self::ResolvedSuppressed => "resolved notifications disabled",
        };
        f.write_str(s)
    }
}

/// Result of one [`NotificationPipeline::deliver`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Delivered after the given number of attempts.
    Delivered {
        /// Attempts used.
        attempts: u32,
    },
    /// Not sent.
    Skipped(SkipReason),
    /// Retries exhausted.
    Failed {
        /// Attempts used.
        attempts: u32,
        /// Last error.
        error: String,
    },
    /// The group resolved while the delivery was in flight.
    Cancelled,
}

/// Delivers notification jobs.
#[derive(Debug)]
pub struct NotificationPipeline {
    state: Arc<SharedState>,
    receivers: RwLock<HashMap<String, Arc<dyn Receiver>>>,
    retry: RetryPolicy,
    health: Mutex<HashMap<String, ReceiverHealth>>,
    external_url: String,
}

impl NotificationPipeline {
    /// Creates a pipeline with no receivers.
    #[must_use]
    pub fn new(state: Arc<SharedState>, retry: RetryPolicy) -> Self {
        Self {
            state,
            receivers: RwLock::new(HashMap::new()),
            retry,
            health: Mutex::new(HashMap::new()),
            external_url: String::new(),
        }
    }

    /// Sets the URL placed in every notification.
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = url.into();
        self
    }

    /// Replaces the receiver set.
    pub fn set_receivers(&self, receivers: HashMap<String, Box<dyn Receiver>>) {
        let receivers = receivers
            .into_iter()
            .map(|(name, r)| (name, Arc::from(r)))
            .collect();
        *self.receivers.write() = receivers;
    }

    /// Returns the configured receiver names.
    #[must_use]
    pub fn receiver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.receivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns delivery health for every receiver that has been used.
    #[must_use]
    pub fn health(&self) -> HashMap<String, ReceiverHealth> {
        self.health.lock().clone()
    }

    fn receiver(&self, name: &str) -> Option<Arc<dyn Receiver>> {
        self.receivers.read().get(name).cloned()
    }

    /// Delivers a job, honouring the notification log and the job's
    /// cancellation token.
    pub async fn deliver(&self, job: NotificationJob, now: DateTime<Utc>) -> DeliveryOutcome {
        let Some(receiver) = self.receiver(&job.receiver) else {
            warn!(receiver = %job.receiver, group = %job.group_key, "no such receiver");
            return DeliveryOutcome::Skipped(SkipReason::UnknownReceiver);
        };

        let entry = self.state.nflog().get(&job.receiver, &job.group_key);
        let logged_firing = entry.as_ref().map(|e| e.firing.clone()).unwrap_or_default();

        let resolved: Vec<Alert> = job
            .resolved
            .iter()
            .filter(|a| logged_firing.contains(&a.fingerprint) || job.attempted.contains(&a.fingerprint))
            .cloned()
            .collect();
        let firing_set = job.firing_set();
        let resolved_set: BTreeSet<Fingerprint> = resolved.iter().map(|a| a.fingerprint).collect();

        if firing_set.is_empty() && resolved_set.is_empty() {
            return DeliveryOutcome::Skipped(SkipReason::NothingToSend);
        }
        if !needs_update(entry.as_ref(), &firing_set, &resolved_set, now, job.repeat_interval) {
            debug!(receiver = %job.receiver, group = %job.group_key, "already notified");
            return DeliveryOutcome::Skipped(SkipReason::AlreadyNotified);
        }

        if firing_set.is_empty() && !receiver.send_resolved() {
            self.record_sent(&job, firing_set, resolved_set, now, entry.as_ref());
            return DeliveryOutcome::Skipped(SkipReason::ResolvedSuppressed);
        }

        let mut alerts = job.firing.clone();
        if receiver.send_resolved() {
            alerts.extend(resolved);
        }
        let notification = Notification::new(
            job.receiver.clone(),
            job.group_key.clone(),
            job.group_labels.clone(),
            alerts,
        )
        .with_external_url(self.external_url.clone());

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                biased;
                () = job.cancel.cancelled() => {
                    info!(receiver = %job.receiver, group = %job.group_key, "notification cancelled");
                    return DeliveryOutcome::Cancelled;
                }
                result = receiver.deliver(&notification) => result,
            };
            self.note_attempt(&job.receiver);

            match result {
                Ok(()) => {
                    info!(
                        receiver = %job.receiver,
                        group = %job.group_key,
                        status = %notification.status,
                        alerts = notification.alerts.len(),
                        attempt,
                        "notification sent"
                    );
                    self.record_sent(&job, firing_set, resolved_set, now, entry.as_ref());
                    self.note_success(&job.receiver, now);
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        receiver = %job.receiver,
                        group = %job.group_key,
                        attempt,
                        error = %e,
                        "notification attempt failed"
                    );
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    () = job.cancel.cancelled() => return DeliveryOutcome::Cancelled,
                    () = tokio::time::sleep(self.retry.backoff(attempt)) => {}
                }
            }
        }

        error!(
            receiver = %job.receiver,
            group = %job.group_key,
            attempts = max_attempts,
            error = %last_error,
            "notification failed after retries"
        );
        self.note_failure(&job.receiver, &last_error, now);
        DeliveryOutcome::Failed {
            attempts: max_attempts,
            error: last_error,
        }
    }

    fn record_sent(
        &self,
        job: &NotificationJob,
        firing: BTreeSet<Fingerprint>,
        resolved: BTreeSet<Fingerprint>,
        now: DateTime<Utc>,
        previous: Option<&NotificationLogEntry>,
    ) {
        let retention = self.state.retention().nflog_retention;
        let entry = NotificationLogEntry {
            group_key: job.group_key.clone(),
            receiver: job.receiver.clone(),
            alerts_hash: alert_set_hash(&firing, &resolved),
            firing,
            resolved,
            sent_at: now,
            expires_at: now + to_delta(retention),
            version: self.state.stamp(previous.map(|e| &e.version)),
        };
        self.state.nflog().record(entry);
    }

    fn note_attempt(&self, receiver: &str) {
        self.health
            .lock()
            .entry(receiver.to_string())
            .or_default()
            .attempts += 1;
    }

    fn note_success(&self, receiver: &str, now: DateTime<Utc>) {
        let mut health = self.health.lock();
        let h = health.entry(receiver.to_string()).or_default();
        h.successes += 1;
        h.consecutive_failures = 0;
        h.last_success_at = Some(now);
    }

    fn note_failure(&self, receiver: &str, error: &str, now: DateTime<Utc>) {
        let mut health = self.health.lock();
        let h = health.entry(receiver.to_string()).or_default();
        h.failures += 1;
        h.consecutive_failures += 1;
        h.last_error = Some(error.to_string());
        h.last_failure_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AlertError, Result};
    use crate::group::GroupKey;
    use crate::receiver::BoxFuture;
    use crate::state::RetentionConfig;
    use crate::types::{AlertState, LabelSet};
    use crate::version::Version;
    use chrono::Duration as Delta;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Default)]
    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
        send_resolved: bool,
        delivered: Mutex<Vec<Notification>>,
    }

    impl Flaky {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                send_resolved: true,
                ..Self::default()
            }
        }
    }

    impl Receiver for Flaky {
        fn name(&self) -> &str {
            "ops"
        }

        fn send_resolved(&self) -> bool {
            self.send_resolved
        }

        fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= self.fail_first {
                    return Err(AlertError::NotificationFailed {
                        receiver: "ops".into(),
                        reason: format!("boom {call}"),
                    });
                }
                self.delivered.lock().push(notification.clone());
                Ok(())
            })
        }
    }

    #[derive(Debug)]
    struct Forwarder(Arc<Flaky>);

    impl Receiver for Forwarder {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn send_resolved(&self) -> bool {
            self.0.send_resolved()
        }

        fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
            self.0.deliver(notification)
        }
    }

    #[derive(Debug)]
    struct Stalled;

    impl Receiver for Stalled {
        fn name(&self) -> &str {
            "ops"
        }

        fn deliver<'a>(&'a self, _notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
            Box::pin(std::future::pending())
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2,
            max_backoff: Duration::from_millis(4),
        }
    }

    fn pipeline_with(receiver: Box<dyn Receiver>, retry: RetryPolicy) -> (Arc<SharedState>, NotificationPipeline) {
        let state = Arc::new(SharedState::new("peer-1", RetentionConfig::default()));
        let pipeline = NotificationPipeline::new(Arc::clone(&state), retry);
        let mut receivers: HashMap<String, Box<dyn Receiver>> = HashMap::new();
        receivers.insert("ops".into(), receiver);
        pipeline.set_receivers(receivers);
        (state, pipeline)
    }

    fn alert(instance: &str, state: AlertState) -> Alert {
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), "Down".into());
        labels.insert("instance".into(), instance.into());
        let now = Utc::now();
        Alert {
            fingerprint: Fingerprint::from_labels(&labels),
            labels,
            annotations: LabelSet::new(),
            starts_at: now,
            ends_at: None,
            generator_url: String::new(),
            state,
            pending_since: now,
            fired_at: Some(now),
            expires_at: now,
            updated_at: now,
            version: Version::default(),
        }
    }

    fn job(firing: Vec<Alert>, resolved: Vec<Alert>, attempted: &[&Alert]) -> NotificationJob {
        NotificationJob {
            group_key: GroupKey::new("root", &LabelSet::new()),
            receiver: "ops".into(),
            group_labels: LabelSet::new(),
            firing,
            resolved,
            attempted: attempted.iter().map(|a| a.fingerprint).collect(),
            repeat_interval: Duration::from_secs(3600),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn delivers_and_logs() {
        let flaky = Arc::new(Flaky::new(0));
        let (state, pipeline) = pipeline_with(Box::new(Forwarder(Arc::clone(&flaky))), fast_retry(3));
        let a = alert("1", AlertState::Firing);
        let now = Utc::now();

        let outcome = pipeline.deliver(job(vec![a.clone()], vec![], &[&a]), now).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });

        let entry = state.nflog().get("ops", &GroupKey::new("root", &LabelSet::new())).unwrap();
        assert!(entry.firing.contains(&a.fingerprint));
        assert_eq!(pipeline.health()["ops"].successes, 1);
    }

    #[tokio::test]
    async fn skips_when_log_shows_same_set() {
        let flaky = Arc::new(Flaky::new(0));
        let (_, pipeline) = pipeline_with(Box::new(Forwarder(Arc::clone(&flaky))), fast_retry(3));
        let a = alert("1", AlertState::Firing);
        let now = Utc::now();

        pipeline.deliver(job(vec![a.clone()], vec![], &[&a]), now).await;
        let outcome = pipeline
            .deliver(job(vec![a.clone()], vec![], &[&a]), now + Delta::minutes(5))
            .await;
        assert_eq!(outcome, DeliveryOutcome::Skipped(SkipReason::AlreadyNotified));
        assert_eq!(flaky.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let flaky = Arc::new(Flaky::new(2));
        let (_, pipeline) = pipeline_with(Box::new(Forwarder(Arc::clone(&flaky))), fast_retry(5));
        let a = alert("1", AlertState::Firing);

        let outcome = pipeline.deliver(job(vec![a.clone()], vec![], &[&a]), Utc::now()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
        let health = &pipeline.health()["ops"];
        assert_eq!(health.attempts, 3);
        assert_eq!(health.failures, 0);
    }

    #[tokio::test]
    async fn records_failure_after_exhaustion() {
        let flaky = Arc::new(Flaky::new(10));
        let (state, pipeline) = pipeline_with(Box::new(Forwarder(Arc::clone(&flaky))), fast_retry(3));
        let a = alert("1", AlertState::Firing);

        let outcome = pipeline.deliver(job(vec![a.clone()], vec![], &[&a]), Utc::now()).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 3, .. }));
        let health = &pipeline.health()["ops"];
        assert_eq!(health.failures, 1);
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.last_error.as_deref(), Some("notification to 'ops' failed: boom 3"));
        assert!(state.nflog().is_empty());
    }

    #[tokio::test]
    async fn resolved_only_reported_if_previously_notified() {
        let flaky = Arc::new(Flaky::new(0));
        let (_, pipeline) = pipeline_with(Box::new(Forwarder(Arc::clone(&flaky))), fast_retry(3));
        let a = alert("1", AlertState::Resolved);

        let outcome = pipeline.deliver(job(vec![], vec![a.clone()], &[]), Utc::now()).await;
        assert_eq!(outcome, DeliveryOutcome::Skipped(SkipReason::NothingToSend));

        let outcome = pipeline.deliver(job(vec![], vec![a.clone()], &[&a]), Utc::now()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
        let sent = flaky.delivered.lock();
        assert_eq!(sent[0].status, crate::receiver::NotificationStatus::Resolved);
    }

    #[tokio::test]
    async fn resolved_suppressed_is_still_logged() {
        let flaky = Arc::new(Flaky {
            send_resolved: false,
            ..Flaky::default()
        });
        let (state, pipeline) = pipeline_with(Box::new(Forwarder(Arc::clone(&flaky))), fast_retry(3));
        let a = alert("1", AlertState::Resolved);

        let outcome = pipeline.deliver(job(vec![], vec![a.clone()], &[&a]), Utc::now()).await;
        assert_eq!(outcome, DeliveryOutcome::Skipped(SkipReason::ResolvedSuppressed));
        assert!(flaky.delivered.lock().is_empty());
        let entry = state.nflog().get("ops", &GroupKey::new("root", &LabelSet::new())).unwrap();
        assert!(entry.firing.is_empty());
        assert!(entry.resolved.contains(&a.fingerprint));
    }

    #[tokio::test]
    async fn unknown_receiver_is_skipped() {
        let (_, pipeline) = pipeline_with(Box::new(Stalled), fast_retry(1));
        let a = alert("1", AlertState::Firing);
        let mut j = job(vec![a.clone()], vec![], &[&a]);
        j.receiver = "nobody".into();
        assert_eq!(
            pipeline.deliver(j, Utc::now()).await,
            DeliveryOutcome::Skipped(SkipReason::UnknownReceiver)
        );
    }

    #[tokio::test]
    async fn cancellation_abandons_stalled_delivery() {
        let (state, pipeline) = pipeline_with(Box::new(Stalled), fast_retry(1));
        let a = alert("1", AlertState::Firing);
        let j = job(vec![a.clone()], vec![], &[&a]);
        let cancel = j.cancel.clone();

        let handle = tokio::spawn(async move { pipeline.deliver(j, Utc::now()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), DeliveryOutcome::Cancelled);
        assert!(state.nflog().is_empty());
    }
}
