//! The gossip replicator.
//!
//! Each round the replicator picks a few random peers and runs a push-pull
//! exchange with each: send a digest, merge the records the peer has that we
//! lack, then push back the records it asked for. Membership is refreshed from
//! every message in both directions.

use std::sync::Arc;
use std::time::Duration;

use alertmesh_core::SharedState;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::member::{ClusterMember, GossipTarget, MemberInfo, Membership, MembershipConfig};
use crate::message::GossipMessage;
use crate::transport::GossipTransport;

/// Replicator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatorConfig {
    /// Time between gossip rounds.
    pub interval: Duration,
    /// Peers contacted per round.
    pub fanout: usize,
    /// Bound on each request of an exchange.
    pub timeout: Duration,
    /// Membership timeouts.
    pub membership: MembershipConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            fanout: 3,
            timeout: Duration::from_secs(2),
            membership: MembershipConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Sets the gossip interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the fanout.
    #[must_use]
    pub const fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Sets the exchange timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the membership timeouts.
    #[must_use]
    pub const fn with_membership(mut self, membership: MembershipConfig) -> Self {
        self.membership = membership;
        self
    }
}

/// Counters from one gossip round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    /// Peers exchanged with successfully.
    pub contacted: usize,
    /// Peers that failed.
    pub failed: usize,
    /// Records merged locally.
    pub merged: usize,
    /// Records pushed to peers.
    pub pushed: usize,
}

#[derive(Debug, Default)]
struct ExchangeStats {
    merged: usize,
    pushed: usize,
}

/// Replicates [`SharedState`] with the rest of the cluster.
#[derive(Debug)]
pub struct Replicator {
    local: MemberInfo,
    state: Arc<SharedState>,
    membership: Mutex<Membership>,
    transport: Arc<dyn GossipTransport>,
    config: ReplicatorConfig,
}

impl Replicator {
    /// Creates a replicator for the local member.
    #[must_use]
    pub fn new(
        local: MemberInfo,
        state: Arc<SharedState>,
        transport: Arc<dyn GossipTransport>,
        config: ReplicatorConfig,
    ) -> Self {
        let membership = Membership::new(local.clone(), config.membership);
        Self {
            local,
            state,
            membership: Mutex::new(membership),
            transport,
            config,
        }
    }

    /// Adds seed addresses to contact until their ids are known.
    #[must_use]
    pub fn with_seeds<I, S>(self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut membership = self.membership.lock();
            for seed in seeds {
                membership.add_seed(seed);
            }
        }
        self
    }

    /// Returns the local member.
    #[must_use]
    pub const fn local(&self) -> &MemberInfo {
        &self.local
    }

    /// Returns the replicated state.
    #[must_use]
    pub const fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Returns every known member, sorted by id.
    #[must_use]
    pub fn members(&self) -> Vec<ClusterMember> {
        self.membership.lock().members()
    }

    /// Returns this instance's position among live members.
    #[must_use]
    pub fn position(&self) -> usize {
        self.membership.lock().position()
    }

    /// Answers a message received from a peer.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::UnexpectedMessage` for reply kinds, which are
    /// never sent unsolicited.
    pub fn handle(&self, message: GossipMessage, now: DateTime<Utc>) -> Result<GossipMessage> {
        match message {
            GossipMessage::Sync {
                from,
                clock,
                digest,
                members,
            } => {
                self.note_peer(&from, clock, &members, now);
                let (delta, wants) = self.state.diff(&digest);
                debug!(
                    peer = %from.id,
                    sending = delta.len(),
                    wanted = wants.alerts.len() + wants.silences.len() + wants.nflog.len(),
                    "answered sync"
                );
                Ok(GossipMessage::SyncReply {
                    from: self.local.clone(),
                    clock: self.state.clock().current(),
                    delta,
                    wants,
                    members: self.membership.lock().view(),
                })
            }
            GossipMessage::Push { from, clock, delta } => {
                self.note_peer(&from, clock, &[], now);
                self.state.merge(delta, now);
                Ok(GossipMessage::Ack {
                    from: self.local.clone(),
                })
            }
            other => Err(ClusterError::UnexpectedMessage {
                expected: "sync or push",
                got: other.kind(),
            }),
        }
    }

    fn note_peer(&self, from: &MemberInfo, clock: u64, members: &[MemberInfo], now: DateTime<Utc>) {
        self.state.clock().observe(clock);
        let mut membership = self.membership.lock();
        membership.heartbeat(from, clock, now);
        for member in members {
            membership.discover(member, now);
        }
    }

    async fn request(&self, address: &str, message: GossipMessage) -> Result<GossipMessage> {
        tokio::time::timeout(self.config.timeout, self.transport.exchange(address, message))
            .await
            .map_err(|_| ClusterError::Timeout {
                address: address.to_string(),
            })?
    }

    async fn exchange(&self, target: &GossipTarget, now: DateTime<Utc>) -> Result<ExchangeStats> {
        let sync = GossipMessage::Sync {
            from: self.local.clone(),
            clock: self.state.clock().current(),
            digest: self.state.digest(),
            members: self.membership.lock().view(),
        };

        let reply = self.request(&target.address, sync).await?;
        let kind = reply.kind();
        let GossipMessage::SyncReply {
            from,
            clock,
            delta,
            wants,
            members,
        } = reply
        else {
            return Err(ClusterError::UnexpectedMessage {
                expected: "sync_reply",
                got: kind,
            });
        };

        self.note_peer(&from, clock, &members, now);
        let merged = self.state.merge(delta, now).applied();

        let mut pushed = 0;
        if !wants.is_empty() {
            let delta = self.state.collect(&wants);
            pushed = delta.len();
            let push = GossipMessage::Push {
                from: self.local.clone(),
                clock: self.state.clock().current(),
                delta,
            };
            let ack = self.request(&target.address, push).await?;
            if !matches!(ack, GossipMessage::Ack { .. }) {
                return Err(ClusterError::UnexpectedMessage {
                    expected: "ack",
                    got: ack.kind(),
                });
            }
        }
        Ok(ExchangeStats { merged, pushed })
    }

    /// Runs one gossip round against up to `fanout` random peers.
    pub async fn gossip_round(&self, now: DateTime<Utc>) -> RoundStats {
        let targets = {
            let mut membership = self.membership.lock();
            membership.tick(now);
            membership.gossip_targets(self.config.fanout)
        };

        let results = join_all(targets.iter().map(|t| self.exchange(t, now))).await;

        let mut stats = RoundStats::default();
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(exchange) => {
                    stats.contacted += 1;
                    stats.merged += exchange.merged;
                    stats.pushed += exchange.pushed;
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(address = %target.address, error = %e, "gossip exchange failed");
                    if let Some(id) = &target.id {
                        self.membership.lock().mark_failed(id, now);
                    }
                }
            }
        }
        if stats.merged > 0 || stats.pushed > 0 {
            debug!(
                contacted = stats.contacted,
                merged = stats.merged,
                pushed = stats.pushed,
                "gossip round"
            );
        }
        stats
    }

    /// Gossips every interval until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            peer = %self.local.id,
            interval_ms = self.config.interval.as_millis() as u64,
            fanout = self.config.fanout,
            "gossip replicator started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.gossip_round(Utc::now()).await;
                }
            }
        }
        info!(peer = %self.local.id, "gossip replicator stopped");
    }
}
