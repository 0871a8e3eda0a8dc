//! The routing tree.
//!
//! Routes are configured as a nested [`RouteConfig`] document and compiled into
//! a [`Route`] tree in which every node carries fully inherited settings. The
//! tree is immutable once built; a configuration reload builds a new tree.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::group::GroupKey;
use crate::matcher::{Matcher, matches_all};
use crate::types::{LabelSet, is_valid_label_name};

/// Default delay before the first notification of a new group.
pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
/// Default minimum delay between notifications of a changed group.
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default delay before an unchanged firing group is notified again.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

const GROUP_BY_ALL: &str = "...";

/// Configuration form of a route node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Receiver for alerts that stop at this node; inherited if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Matchers in text form, e.g. `severity=~"critical|page"`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<String>,
    /// Grouping labels; `["..."]` groups by every label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    /// Group wait in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_wait_secs: Option<u64>,
    /// Group interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_interval_secs: Option<u64>,
    /// Repeat interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval_secs: Option<u64>,
    /// Keep trying later siblings after this node matches.
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
    /// Child routes, tried in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

impl RouteConfig {
    /// Creates a route that sends to `receiver`.
    #[must_use]
    pub fn new(receiver: impl Into<String>) -> Self {
        Self {
            receiver: Some(receiver.into()),
            ..Self::default()
        }
    }

    /// Adds a matcher.
    #[must_use]
    pub fn with_matcher(mut self, matcher: impl Into<String>) -> Self {
        self.matchers.push(matcher.into());
        self
    }

    /// Sets the grouping labels.
    #[must_use]
    pub fn with_group_by<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Sets group wait, group interval and repeat interval in seconds.
    #[must_use]
    pub const fn with_timing(mut self, wait: u64, interval: u64, repeat: u64) -> Self {
        self.group_wait_secs = Some(wait);
        self.group_interval_secs = Some(interval);
        self.repeat_interval_secs = Some(repeat);
        self
    }

    /// Sets the continue flag.
    #[must_use]
    pub const fn with_continue(mut self, continue_matching: bool) -> Self {
        self.continue_matching = continue_matching;
        self
    }

    /// Adds a child route.
    #[must_use]
    pub fn with_route(mut self, route: Self) -> Self {
        self.routes.push(route);
        self
    }
}

/// How a route derives group keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBy {
    /// Group by the full label set.
    All,
    /// Group by the listed labels.
    Labels(BTreeSet<String>),
}

impl GroupBy {
    fn from_config(labels: &[String]) -> Result<Self> {
        if labels.iter().any(|l| l == GROUP_BY_ALL) {
            if labels.len() > 1 {
                return Err(AlertError::InvalidRoute {
                    reason: "group_by \"...\" cannot be combined with other labels".to_string(),
                });
            }
            return Ok(Self::All);
        }
        if let Some(bad) = labels.iter().find(|l| !is_valid_label_name(l)) {
            return Err(AlertError::InvalidRoute {
                reason: format!("invalid group_by label '{bad}'"),
            });
        }
        Ok(Self::Labels(labels.iter().cloned().collect()))
    }
}

/// Notification timing of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTiming {
    /// Delay before the first notification of a new group.
    pub group_wait: Duration,
    /// Minimum delay between notifications of a changed group.
    pub group_interval: Duration,
    /// Delay before an unchanged firing group is notified again.
    pub repeat_interval: Duration,
}

impl Default for RouteTiming {
    fn default() -> Self {
        Self {
            group_wait: DEFAULT_GROUP_WAIT,
            group_interval: DEFAULT_GROUP_INTERVAL,
            repeat_interval: DEFAULT_REPEAT_INTERVAL,
        }
    }
}

/// A compiled route node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    path: String,
    receiver: String,
    matchers: Vec<Matcher>,
    group_by: GroupBy,
    timing: RouteTiming,
    continue_matching: bool,
    routes: Vec<Route>,
}

impl Route {
    /// Compiles a routing tree.
    ///
    /// `known_receivers` is the set of configured receiver names; every route
    /// must resolve to one of them.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRoute` if the root has matchers, sets
    /// `continue` or has no receiver, a receiver is unknown, a duration is zero,
    /// or `group_by` is malformed. Returns `AlertError::InvalidMatcher` for an
    /// unparsable matcher.
    pub fn from_config(config: &RouteConfig, known_receivers: &BTreeSet<String>) -> Result<Self> {
        if !config.matchers.is_empty() {
            return Err(AlertError::InvalidRoute {
                reason: "root route cannot have matchers".to_string(),
            });
        }
        if config.continue_matching {
            return Err(AlertError::InvalidRoute {
                reason: "root route cannot set continue".to_string(),
            });
        }
        if config.receiver.is_none() {
            return Err(AlertError::InvalidRoute {
                reason: "root route must name a receiver".to_string(),
            });
        }

        let defaults = Self {
            path: String::new(),
            receiver: String::new(),
            matchers: Vec::new(),
            group_by: GroupBy::Labels(BTreeSet::new()),
            timing: RouteTiming::default(),
            continue_matching: false,
            routes: Vec::new(),
        };
        Self::build(config, &defaults, "root".to_string(), known_receivers)
    }

    fn build(
        config: &RouteConfig,
        parent: &Self,
        path: String,
        known_receivers: &BTreeSet<String>,
    ) -> Result<Self> {
        let receiver = config
            .receiver
            .clone()
            .unwrap_or_else(|| parent.receiver.clone());
        if !known_receivers.contains(&receiver) {
            return Err(AlertError::InvalidRoute {
                reason: format!("route {path} references unknown receiver '{receiver}'"),
            });
        }

        let matchers = config
            .matchers
            .iter()
            .map(|m| m.parse())
            .collect::<Result<Vec<Matcher>>>()?;

        let group_by = match &config.group_by {
            Some(labels) => GroupBy::from_config(labels)?,
            None => parent.group_by.clone(),
        };

        let secs = |v: Option<u64>, inherited: Duration| v.map_or(inherited, Duration::from_secs);
        let timing = RouteTiming {
            group_wait: secs(config.group_wait_secs, parent.timing.group_wait),
            group_interval: secs(config.group_interval_secs, parent.timing.group_interval),
            repeat_interval: secs(config.repeat_interval_secs, parent.timing.repeat_interval),
        };
        if timing.group_interval.is_zero() || timing.repeat_interval.is_zero() {
            return Err(AlertError::InvalidRoute {
                reason: format!("route {path}: group_interval and repeat_interval must be positive"),
            });
        }

        let mut route = Self {
            path,
            receiver,
            matchers,
            group_by,
            timing,
            continue_matching: config.continue_matching,
            routes: Vec::with_capacity(config.routes.len()),
        };
        for (i, child) in config.routes.iter().enumerate() {
            let child_path = format!("{}.{i}", route.path);
            let compiled = Self::build(child, &route, child_path, known_receivers)?;
            route.routes.push(compiled);
        }
        Ok(route)
    }

    /// Returns the dotted path of the node, e.g. `root.0.1`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the receiver name.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Returns the grouping mode.
    #[must_use]
    pub const fn group_by(&self) -> &GroupBy {
        &self.group_by
    }

    /// Returns the notification timing.
    #[must_use]
    pub const fn timing(&self) -> RouteTiming {
        self.timing
    }

    /// Returns the child routes.
    #[must_use]
    pub fn routes(&self) -> &[Self] {
        &self.routes
    }

    /// Returns true if the node's own matchers match.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        matches_all(&self.matchers, labels)
    }

    /// Returns every node the labels are routed to.
    ///
    /// Never empty when called on the root.
    #[must_use]
    pub fn route(&self, labels: &LabelSet) -> Vec<&Self> {
        let mut out = Vec::new();
        self.collect(labels, &mut out);
        out
    }

    fn collect<'a>(&'a self, labels: &LabelSet, out: &mut Vec<&'a Self>) {
        let mut matched_child = false;
        for child in &self.routes {
            if !child.matches(labels) {
                continue;
            }
            matched_child = true;
            child.collect(labels, out);
            if !child.continue_matching {
                break;
            }
        }
        if !matched_child {
            out.push(self);
        }
    }

    /// Finds a node by path.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&Self> {
        if self.path == path {
            return Some(self);
        }
        self.routes.iter().find_map(|r| r.find(path))
    }

    /// Restricts labels to this node's grouping labels.
    #[must_use]
    pub fn group_labels(&self, labels: &LabelSet) -> LabelSet {
        match &self.group_by {
            GroupBy::All => labels.clone(),
            GroupBy::Labels(names) => labels
                .iter()
                .filter(|(name, _)| names.contains(*name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Returns the key of the group the labels fall into under this node.
    #[must_use]
    pub fn group_key(&self, labels: &LabelSet) -> GroupKey {
        GroupKey::new(&self.path, &self.group_labels(labels))
    }

    /// Renders the tree, one node per line.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, 0);
        out
    }

    fn describe_into(&self, out: &mut String, depth: usize) {
        let matchers: Vec<String> = self.matchers.iter().map(ToString::to_string).collect();
        let group_by = match &self.group_by {
            GroupBy::All => GROUP_BY_ALL.to_string(),
            GroupBy::Labels(l) => l.iter().cloned().collect::<Vec<_>>().join(","),
        };
        let _ = writeln!(
            out,
            "{:indent$}{} receiver={} matchers=[{}] group_by=[{}] wait={}s interval={}s repeat={}s{}",
            "",
            self.path,
            self.receiver,
            matchers.join(","),
            group_by,
            self.timing.group_wait.as_secs(),
            self.timing.group_interval.as_secs(),
            self.timing.repeat_interval.as_secs(),
            if self.continue_matching { " continue" } else { "" },
            indent = depth * 2,
        );
        for child in &self.routes {
            child.describe_into(out, depth + 1);
        }
    }
}
