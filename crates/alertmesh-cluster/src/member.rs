//! Cluster membership.
//!
//! Tracks every peer this instance has heard of and moves it through
//! `joining -> active -> suspected -> left` based on heartbeats. Members that
//! have left are forgotten after a further timeout; the records they wrote
//! stay in the replicated state.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Identity of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a peer id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Liveness state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    /// Learned about but not heard from yet.
    Joining,
    /// Heard from within the suspicion timeout.
    Active,
    /// Missed heartbeats or failed an exchange.
    Suspected,
    /// Silent for longer than the leave timeout.
    Left,
}

impl MemberState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Suspected => "suspected",
            Self::Left => "left",
        }
    }

    /// Returns true if the member should still be gossiped with.
    #[must_use]
    pub const fn is_reachable(&self) -> bool {
        !matches!(self, Self::Left)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member as announced on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member id.
    pub id: PeerId,
    /// Base URL the member serves gossip on.
    pub address: String,
}

impl MemberInfo {
    /// Creates member info.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: PeerId::new(id),
            address: address.into(),
        }
    }
}

/// A member as tracked locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    /// Member id.
    pub id: PeerId,
    /// Gossip address.
    pub address: String,
    /// Liveness state.
    pub state: MemberState,
    /// Last message received from the member.
    pub last_seen: Option<DateTime<Utc>>,
    /// When the member was first learned about.
    pub joined_at: DateTime<Utc>,
    /// When `state` last changed.
    pub state_changed_at: DateTime<Utc>,
    /// Highest logical clock value the member advertised.
    pub state_version: u64,
    /// A departed member that a live peer still lists; dialled once more.
    #[serde(skip)]
    recheck: bool,
}

impl ClusterMember {
    fn set_state(&mut self, state: MemberState, now: DateTime<Utc>) {
        if self.state != state {
            self.state = state;
            self.state_changed_at = now;
        }
    }

    fn silent_since(&self) -> DateTime<Utc> {
        self.last_seen.unwrap_or(self.joined_at)
    }

    const fn is_target(&self) -> bool {
        self.state.is_reachable() || self.recheck
    }
}

/// Membership timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipConfig {
    /// Silence before a member is suspected.
    pub suspect_after: Duration,
    /// Silence before a member is considered gone.
    pub left_after: Duration,
    /// Time a departed member stays in the table.
    pub remove_after: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            suspect_after: Duration::from_secs(5),
            left_after: Duration::from_secs(30),
            remove_after: Duration::from_secs(300),
        }
    }
}

/// A peer picked for a gossip round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipTarget {
    /// Member id, unknown for seeds not contacted yet.
    pub id: Option<PeerId>,
    /// Address to dial.
    pub address: String,
}

/// A state change produced by [`Membership::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Member that changed.
    pub id: PeerId,
    /// Previous state.
    pub from: MemberState,
    /// New state, `None` when the member was removed.
    pub to: Option<MemberState>,
}

/// The membership table of one instance.
#[derive(Debug)]
pub struct Membership {
    local: MemberInfo,
    config: MembershipConfig,
    members: HashMap<PeerId, ClusterMember>,
    seeds: Vec<String>,
}

impl Membership {
    /// Creates a table containing only the local instance.
    #[must_use]
    pub fn new(local: MemberInfo, config: MembershipConfig) -> Self {
        Self {
            local,
            config,
            members: HashMap::new(),
            seeds: Vec::new(),
        }
    }

    /// Returns the local member.
    #[must_use]
    pub const fn local(&self) -> &MemberInfo {
        &self.local
    }

    /// Registers a seed address.
    ///
    /// A seed is dialled whenever no live member is known at its address, so
    /// an instance that lost every peer can rejoin through its seeds.
    pub fn add_seed(&mut self, address: impl Into<String>) {
        let address = address.into();
        if address != self.local.address && !self.seeds.contains(&address) {
            self.seeds.push(address);
        }
    }

    /// Returns seed addresses with no live member behind them.
    #[must_use]
    pub fn pending_seeds(&self) -> Vec<String> {
        self.seeds
            .iter()
            .filter(|s| {
                !self
                    .members
                    .values()
                    .any(|m| m.state.is_reachable() && m.address == **s)
            })
            .cloned()
            .collect()
    }

    /// Learns about a member from someone else's view.
    ///
    /// Views only list members their sender still considers live. A member
    /// this table marked left is therefore dialled once more; it stays left
    /// unless that exchange succeeds. Returns true if the member was new.
    pub fn discover(&mut self, info: &MemberInfo, now: DateTime<Utc>) -> bool {
        if info.id == self.local.id {
            return false;
        }
        if let Some(member) = self.members.get_mut(&info.id) {
            member.address.clone_from(&info.address);
            if member.state == MemberState::Left && !member.recheck {
                debug!(peer = %info.id, address = %info.address, "departed member still in a peer's view");
                member.recheck = true;
            }
            return false;
        }
        self.members.insert(
            info.id.clone(),
            ClusterMember {
                id: info.id.clone(),
                address: info.address.clone(),
                state: MemberState::Joining,
                last_seen: None,
                joined_at: now,
                state_changed_at: now,
                state_version: 0,
                recheck: false,
            },
        );
        info!(peer = %info.id, address = %info.address, "discovered member");
        true
    }

    /// Records a message from a member.
    pub fn heartbeat(&mut self, info: &MemberInfo, state_version: u64, now: DateTime<Utc>) {
        if info.id == self.local.id {
            return;
        }
        self.discover(info, now);
        if let Some(member) = self.members.get_mut(&info.id) {
            if member.state != MemberState::Active {
                info!(peer = %info.id, from = %member.state, "member active");
            }
            member.address.clone_from(&info.address);
            member.last_seen = Some(now);
            member.state_version = member.state_version.max(state_version);
            member.recheck = false;
            member.set_state(MemberState::Active, now);
        }
    }

    /// Marks a member suspected after a failed exchange.
    pub fn mark_failed(&mut self, id: &PeerId, now: DateTime<Utc>) {
        if let Some(member) = self.members.get_mut(id) {
            member.recheck = false;
            if matches!(member.state, MemberState::Joining | MemberState::Active) {
                warn!(peer = %id, "member suspected after failed exchange");
                member.set_state(MemberState::Suspected, now);
            }
        }
    }

    /// Applies the timeouts and returns the resulting transitions.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        let suspect = delta(self.config.suspect_after);
        let left = delta(self.config.left_after);
        let remove = delta(self.config.remove_after);
        let mut transitions = Vec::new();

        for member in self.members.values_mut() {
            let silent = now - member.silent_since();
            let next = match member.state {
                MemberState::Joining | MemberState::Active if silent >= suspect => MemberState::Suspected,
                MemberState::Suspected if silent >= left => MemberState::Left,
                _ => continue,
            };
            warn!(peer = %member.id, from = %member.state, to = %next, "member state changed");
            transitions.push(Transition {
                id: member.id.clone(),
                from: member.state,
                to: Some(next),
            });
            member.set_state(next, now);
        }

        self.members.retain(|id, member| {
            let expired = member.state == MemberState::Left && now - member.state_changed_at >= remove;
            if expired {
                info!(peer = %id, "removed departed member");
                transitions.push(Transition {
                    id: id.clone(),
                    from: MemberState::Left,
                    to: None,
                });
            }
            !expired
        });
        transitions
    }

    /// Picks up to `fanout` random reachable members, departed members due a
    /// recheck and unmatched seeds.
    #[must_use]
    pub fn gossip_targets(&self, fanout: usize) -> Vec<GossipTarget> {
        let mut candidates: Vec<GossipTarget> = self
            .members
            .values()
            .filter(|m| m.is_target())
            .map(|m| GossipTarget {
                id: Some(m.id.clone()),
                address: m.address.clone(),
            })
            .chain(self.pending_seeds().into_iter().map(|address| GossipTarget {
                id: None,
                address,
            }))
            .collect();
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates.truncate(fanout);
        candidates
    }

    /// Returns the members to announce, including the local instance.
    #[must_use]
    pub fn view(&self) -> Vec<MemberInfo> {
        std::iter::once(self.local.clone())
            .chain(
                self.members
                    .values()
                    .filter(|m| m.state.is_reachable())
                    .map(|m| MemberInfo {
                        id: m.id.clone(),
                        address: m.address.clone(),
                    }),
            )
            .collect()
    }

    /// Returns a member.
    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<&ClusterMember> {
        self.members.get(id)
    }

    /// Returns every known member, sorted by id.
    #[must_use]
    pub fn members(&self) -> Vec<ClusterMember> {
        let mut list: Vec<ClusterMember> = self.members.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Returns the local instance's index among members that have not left.
    ///
    /// Every peer with the same view computes the same order.
    #[must_use]
    pub fn position(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.state.is_reachable() && m.id < self.local.id)
            .count()
    }

    /// Returns the highest clock value advertised by each member.
    #[must_use]
    pub fn state_versions(&self) -> BTreeMap<PeerId, u64> {
        self.members
            .values()
            .map(|m| (m.id.clone(), m.state_version))
            .collect()
    }
}

fn delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
