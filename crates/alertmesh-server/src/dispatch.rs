//! Notification dispatcher.
//!
//! A single tick loop keeps group membership current and collects garbage.
//! Every group gets its own task that sleeps until the group's next flush,
//! flushes it, waits `position × peer_timeout` so lower positions send first,
//! then delivers under a global concurrency limit. A group task ends when its
//! group is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alertmesh_cluster::Replicator;
use alertmesh_core::{AlertEngine, DeliveryOutcome, GroupKey};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Dispatcher timing and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Time between grouping ticks.
    pub tick_interval: Duration,
    /// Time between garbage collection passes.
    pub gc_interval: Duration,
    /// Delay per cluster position before delivering.
    pub peer_timeout: Duration,
    /// Deliveries allowed in flight at once.
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            gc_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(2),
            concurrency: 32,
        }
    }
}

/// Drives grouping and delivery for one instance.
#[derive(Debug)]
pub struct Dispatcher {
    engine: Arc<AlertEngine>,
    replicator: Arc<Replicator>,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<GroupKey, JoinHandle<()>>>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(engine: Arc<AlertEngine>, replicator: Arc<Replicator>, config: DispatchConfig) -> Self {
        Self {
            engine,
            replicator,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of running group tasks.
    #[must_use]
    pub fn active_groups(&self) -> usize {
        self.tasks.lock().values().filter(|h| !h.is_finished()).count()
    }

    /// Runs one tick: sync groups and start tasks for new ones.
    pub fn tick(&self, now: DateTime<Utc>, shutdown: &CancellationToken) {
        self.engine.sync(now);

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        for key in self.engine.group_keys() {
            if tasks.contains_key(&key) {
                continue;
            }
            let task = GroupTask {
                key: key.clone(),
                engine: Arc::clone(&self.engine),
                replicator: Arc::clone(&self.replicator),
                permits: Arc::clone(&self.permits),
                config: self.config,
                shutdown: shutdown.child_token(),
            };
            debug!(group = %key, "starting group task");
            tasks.insert(key, tokio::spawn(task.run()));
        }
    }

    /// Ticks every interval until `shutdown` is cancelled, then waits for
    /// group tasks to stop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            concurrency = self.config.concurrency,
            "dispatcher started"
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut gc = tokio::time::interval(self.config.gc_interval);
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(Utc::now(), &shutdown),
                _ = gc.tick() => {
                    let stats = self.engine.state().gc(Utc::now());
                    if stats.alerts + stats.silences + stats.nflog > 0 {
                        info!(
                            alerts = stats.alerts,
                            silences = stats.silences,
                            nflog = stats.nflog,
                            "garbage collected"
                        );
                    }
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "group task ended abnormally");
            }
        }
        info!("dispatcher stopped");
    }
}

struct GroupTask {
    key: GroupKey,
    engine: Arc<AlertEngine>,
    replicator: Arc<Replicator>,
    permits: Arc<Semaphore>,
    config: DispatchConfig,
    shutdown: CancellationToken,
}

impl GroupTask {
    async fn run(self) {
        while let Some(next) = self.engine.next_flush(&self.key) {
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !self.sleep(wait).await {
                return;
            }

            let Some(job) = self.engine.flush(&self.key, Utc::now()) else {
                // Not due or nothing to send yet; look again next tick.
                if !self.sleep(self.config.tick_interval).await {
                    return;
                }
                continue;
            };

            let stagger = self
                .config
                .peer_timeout
                .saturating_mul(u32::try_from(self.replicator.position()).unwrap_or(u32::MAX));
            if !stagger.is_zero() {
                debug!(group = %self.key, stagger_ms = stagger.as_millis() as u64, "waiting for lower positions");
                let cancel = job.cancel.clone();
                tokio::select! {
                    () = self.shutdown.cancelled() => return,
                    () = cancel.cancelled() => {
                        debug!(group = %self.key, "group resolved while waiting");
                    }
                    () = tokio::time::sleep(stagger) => {}
                }
            }

            let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
                return;
            };
            let receiver = job.receiver.clone();
            match self.engine.deliver(job, Utc::now()).await {
                DeliveryOutcome::Delivered { attempts } => {
                    debug!(group = %self.key, receiver = %receiver, attempts, "notification delivered");
                }
                DeliveryOutcome::Skipped(reason) => {
                    debug!(group = %self.key, receiver = %receiver, %reason, "notification skipped");
                }
                DeliveryOutcome::Failed { attempts, error } => {
                    error!(group = %self.key, receiver = %receiver, attempts, error = %error, "notification failed");
                }
                DeliveryOutcome::Cancelled => {
                    debug!(group = %self.key, receiver = %receiver, "notification cancelled");
                }
            }
        }
        debug!(group = %self.key, "group task finished");
    }

    /// Sleeps for `duration`; returns false if shutdown came first.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}
