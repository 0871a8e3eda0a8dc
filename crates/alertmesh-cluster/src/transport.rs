//! Gossip transports.
//!
//! The replicator only needs request/response: send one message to an address
//! and get one message back. [`HttpTransport`] does that over
//! `POST /cluster/gossip`; [`InMemoryTransport`] wires replicators together
//! inside one process for tests, with switchable partitions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::message::GossipMessage;
use crate::replicator::Replicator;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Path peers serve gossip on.
pub const GOSSIP_PATH: &str = "/cluster/gossip";

/// Request/response channel to other peers.
pub trait GossipTransport: Send + Sync + fmt::Debug {
    /// Sends `message` to the peer at `address` and returns its reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer cannot be reached or answers with garbage.
    fn exchange<'a>(&'a self, address: &'a str, message: GossipMessage)
    -> BoxFuture<'a, Result<GossipMessage>>;
}

/// Gossip over HTTP with JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Returns the gossip URL for a peer address.
    ///
    /// Bare `host:port` addresses are treated as plain HTTP.
    #[must_use]
    pub fn url(address: &str) -> String {
        let base = address.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{base}{GOSSIP_PATH}")
        } else {
            format!("http://{base}{GOSSIP_PATH}")
        }
    }
}

impl GossipTransport for HttpTransport {
    fn exchange<'a>(
        &'a self,
        address: &'a str,
        message: GossipMessage,
    ) -> BoxFuture<'a, Result<GossipMessage>> {
        Box::pin(async move {
            let url = Self::url(address);
            let response = self
                .client
                .post(&url)
                .json(&message)
                .send()
                .await
                .map_err(|e| ClusterError::Unreachable {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ClusterError::Unreachable {
                    address: address.to_string(),
                    reason: format!("HTTP {status}: {body}"),
                });
            }
            let bytes = response.bytes().await?;
            Ok(serde_json::from_slice(&bytes)?)
        })
    }
}

/// In-process transport connecting replicators by address.
#[derive(Default)]
pub struct InMemoryTransport {
    peers: RwLock<HashMap<String, Weak<Replicator>>>,
    down: RwLock<HashSet<String>>,
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("peers", &self.peers.read().keys().collect::<Vec<_>>())
            .field("down", &self.down.read())
            .finish()
    }
}

impl InMemoryTransport {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a replicator reachable under its own address.
    pub fn register(&self, replicator: &Arc<Replicator>) {
        let address = replicator.local().address.clone();
        self.peers.write().insert(address, Arc::downgrade(replicator));
    }

    /// Cuts a peer off; messages to and from it fail.
    pub fn partition(&self, address: &str) {
        self.down.write().insert(address.to_string());
    }

    /// Reconnects a partitioned peer.
    pub fn heal(&self, address: &str) {
        self.down.write().remove(address);
    }

    fn is_down(&self, address: &str) -> bool {
        self.down.read().contains(address)
    }
}

impl GossipTransport for InMemoryTransport {
    fn exchange<'a>(
        &'a self,
        address: &'a str,
        message: GossipMessage,
    ) -> BoxFuture<'a, Result<GossipMessage>> {
        Box::pin(async move {
            let unreachable = |reason: &str| ClusterError::Unreachable {
                address: address.to_string(),
                reason: reason.to_string(),
            };
            if self.is_down(address) || self.is_down(&message.sender().address) {
                return Err(unreachable("partitioned"));
            }
            let peer = self
                .peers
                .read()
                .get(address)
                .and_then(Weak::upgrade)
                .ok_or_else(|| unreachable("no such peer"))?;
            debug!(to = %address, kind = message.kind(), "in-memory exchange");
            peer.handle(message, Utc::now())
        })
    }
}
