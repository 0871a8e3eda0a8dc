//! Gossip-based cluster replication for alertmesh.
//!
//! Every alertmesh instance is a peer. Peers periodically exchange digests of
//! their [`SharedState`](alertmesh_core::SharedState) with a few random
//! members, pull what they are missing and push what the other side lacks.
//! There is no coordinator: conflicting writes converge through the
//! last-write-wins merge of the core state tables.
//!
//! ## Architecture
//!
//! - [`Membership`]: member table and the `joining/active/suspected/left` state machine
//! - [`GossipMessage`]: wire messages of the push-pull exchange
//! - [`GossipTransport`]: request/response channel, over HTTP or in memory
//! - [`Replicator`]: runs gossip rounds and answers incoming messages

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod member;
pub mod message;
pub mod replicator;
pub mod transport;

pub use error::{ClusterError, Result};
pub use member::{ClusterMember, MemberInfo, MemberState, Membership, MembershipConfig, PeerId};
pub use message::GossipMessage;
pub use replicator::{Replicator, ReplicatorConfig, RoundStats};
pub use transport::{GOSSIP_PATH, GossipTransport, HttpTransport, InMemoryTransport};
