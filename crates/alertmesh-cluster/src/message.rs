//! Gossip wire messages.
//!
//! One exchange is a `Sync` answered by a `SyncReply`, followed by a `Push`
//! answered by an `Ack` when the initiator holds records the responder wants.
//! Every message carries the sender and its view of the membership.

use alertmesh_core::{StateDelta, StateDigest, StateKeys};
use serde::{Deserialize, Serialize};

use crate::member::MemberInfo;

/// A gossip message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// Opens an exchange with the initiator's digest.
    Sync {
        /// Sender.
        from: MemberInfo,
        /// Sender's logical clock.
        clock: u64,
        /// Versions of every record the sender holds.
        digest: StateDigest,
        /// Sender's membership view.
        members: Vec<MemberInfo>,
    },

    /// Answers a `Sync`.
    SyncReply {
        /// Sender.
        from: MemberInfo,
        /// Sender's logical clock.
        clock: u64,
        /// Records newer on the responder.
        delta: StateDelta,
        /// Keys newer on the initiator.
        wants: StateKeys,
        /// Sender's membership view.
        members: Vec<MemberInfo>,
    },

    /// Sends the records a responder asked for.
    Push {
        /// Sender.
        from: MemberInfo,
        /// Sender's logical clock.
        clock: u64,
        /// Requested records.
        delta: StateDelta,
    },

    /// Acknowledges a `Push`.
    Ack {
        /// Sender.
        from: MemberInfo,
    },
}

impl GossipMessage {
    /// Returns the message kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::SyncReply { .. } => "sync_reply",
            Self::Push { .. } => "push",
            Self::Ack { .. } => "ack",
        }
    }

    /// Returns the sender.
    #[must_use]
    pub const fn sender(&self) -> &MemberInfo {
        match self {
            Self::Sync { from, .. }
            | Self::SyncReply { from, .. }
            | Self::Push { from, .. }
            | Self::Ack { from } => from,
        }
    }
}
