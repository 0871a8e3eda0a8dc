//! Alert deduplication, grouping and routing for alertmesh.
//!
//! `alertmesh-core` holds everything an alertmesh instance does with alerts
//! apart from networking: it ingests already-evaluated alerts from redundant
//! upstream evaluators, collapses duplicates by label fingerprint, groups them
//! per route, mutes them with silences and inhibition rules, and delivers
//! grouped notifications through pluggable receivers.
//!
//! # Features
//!
//! - **Deduplication**: alerts are identified by a stable fingerprint of their labels
//! - **Grouping**: one notification cadence per route and grouping-label set
//! - **Silences and inhibition**: mute notifications without hiding alerts
//! - **Routing tree**: Alertmanager-style hierarchical routes with `continue`
//! - **Notification log**: replicated record of sends so peers never double-notify
//! - **Replication primitives**: versioned records, digests and commutative merges
//!
//! # Example
//!
//! ```rust
//! use std::collections::{BTreeSet, HashMap};
//! use std::sync::Arc;
//!
//! use alertmesh_core::{
//!     AlertEngine, IngestConfig, Ingress, LogReceiver, NotificationPipeline, PostableAlert,
//!     Receiver, RetentionConfig, RetryPolicy, RouteConfig, RoutingSnapshot, SharedState,
//! };
//! use chrono::Utc;
//!
//! let state = Arc::new(SharedState::new("peer-1", RetentionConfig::default()));
//! let receivers = BTreeSet::from(["ops".to_string()]);
//! let routing = RoutingSnapshot::compile(
//!     &RouteConfig::new("ops").with_group_by(["alertname"]),
//!     &[],
//!     &receivers,
//! )
//! .unwrap();
//!
//! let pipeline = NotificationPipeline::new(Arc::clone(&state), RetryPolicy::default());
//! let engine = AlertEngine::new(
//!     state,
//!     Ingress::new(IngestConfig::default()),
//!     routing.clone(),
//!     pipeline,
//! );
//! let mut sinks: HashMap<String, Box<dyn Receiver>> = HashMap::new();
//! sinks.insert("ops".into(), Box::new(LogReceiver::new("ops")));
//! engine.reload(routing, sinks).unwrap();
//!
//! let alert = PostableAlert::new(Default::default()).with_label("alertname", "HighCPU");
//! let report = engine.ingest(vec![alert], Utc::now());
//! assert!(report.is_ok());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod engine;
pub mod error;
pub mod group;
pub mod ingress;
pub mod inhibit;
pub mod matcher;
pub mod nflog;
pub mod pipeline;
pub mod receiver;
pub mod route;
pub mod silence;
pub mod state;
pub mod store;
pub mod types;
pub mod version;

// Re-export main types at crate root
pub use engine::{AlertEngine, AlertQuery, AlertStatus, AlertView, RoutingSnapshot};
pub use error::{AlertError, Result};
pub use group::{GroupEngine, GroupKey, GroupView, NotificationJob};
pub use ingress::{IngestConfig, IngestOutcome, IngestReport, Ingress};
pub use inhibit::{InhibitRule, InhibitRuleConfig, Inhibitor};
pub use matcher::{MatchType, Matcher, parse_matchers};
pub use nflog::{NotificationLog, NotificationLogEntry};
pub use pipeline::{DeliveryOutcome, NotificationPipeline, ReceiverHealth, RetryPolicy, SkipReason};
pub use receiver::{
    LogReceiver, Notification, NotificationStatus, Receiver, ReceiverConfig, ReceiverKind,
    WebhookConfig, WebhookReceiver, build_receivers,
};
pub use route::{Route, RouteConfig};
pub use silence::{PostableSilence, Silence, SilenceState, SilenceStore};
pub use state::{RetentionConfig, SharedState, StateDelta, StateDigest, StateKeys};
pub use store::AlertStore;
pub use types::{Alert, AlertState, Fingerprint, LabelSet, PostableAlert};
pub use version::{LamportClock, Version};
