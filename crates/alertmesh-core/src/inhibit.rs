//! Inhibition: firing source alerts mute matching target alerts.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::matcher::{Matcher, matches_all};
use crate::types::{Alert, AlertState, Fingerprint, LabelSet};

/// Configuration form of an inhibition rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InhibitRuleConfig {
    /// Matchers a firing alert must satisfy to inhibit others.
    #[serde(default)]
    pub source_matchers: Vec<String>,
    /// Matchers an alert must satisfy to be inhibited.
    #[serde(default)]
    pub target_matchers: Vec<String>,
    /// Labels whose values must be equal on source and target.
    #[serde(default)]
    pub equal: Vec<String>,
}

/// A compiled inhibition rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InhibitRule {
    source: Vec<Matcher>,
    target: Vec<Matcher>,
    equal: Vec<String>,
}

impl InhibitRule {
    /// Compiles a rule from its configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidMatcher` if a matcher fails to parse.
    pub fn from_config(config: &InhibitRuleConfig) -> Result<Self> {
        let parse = |list: &[String]| -> Result<Vec<Matcher>> {
            list.iter().map(|m| m.parse()).collect()
        };
        Ok(Self {
            source: parse(&config.source_matchers)?,
            target: parse(&config.target_matchers)?,
            equal: config.equal.clone(),
        })
    }

    fn equal_values(&self, a: &LabelSet, b: &LabelSet) -> bool {
        self.equal.iter().all(|name| a.get(name) == b.get(name))
    }
}

/// Inhibition state computed from one snapshot of firing alerts.
///
/// Built fresh on every grouping tick; nothing is cached between ticks.
#[derive(Debug, Clone, Default)]
pub struct Inhibitor {
    rules: Vec<InhibitRule>,
    sources: Vec<Vec<(Fingerprint, LabelSet)>>,
}

impl Inhibitor {
    /// Creates an inhibitor for the given rules with no source alerts.
    #[must_use]
    pub fn new(rules: Vec<InhibitRule>) -> Self {
        let sources = vec![Vec::new(); rules.len()];
        Self { rules, sources }
    }

    /// Returns the number of rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Returns a copy of the rules indexed against the currently firing alerts.
    #[must_use]
    pub fn snapshot<'a>(&self, alerts: impl IntoIterator<Item = &'a Alert>) -> Self {
        let mut sources = vec![Vec::new(); self.rules.len()];
        for alert in alerts {
            if alert.state != AlertState::Firing {
                continue;
            }
            for (i, rule) in self.rules.iter().enumerate() {
                if matches_all(&rule.source, &alert.labels) {
                    sources[i].push((alert.fingerprint, alert.labels.clone()));
                }
            }
        }
        Self {
            rules: self.rules.clone(),
            sources,
        }
    }

    /// Returns the fingerprint of a firing alert that inhibits `alert`, if any.
    #[must_use]
    pub fn inhibited_by(&self, alert: &Alert) -> Option<Fingerprint> {
        self.rules
            .iter()
            .zip(&self.sources)
            .filter(|(rule, _)| matches_all(&rule.target, &alert.labels))
            .find_map(|(rule, sources)| {
                sources
                    .iter()
                    .find(|(fp, labels)| {
                        *fp != alert.fingerprint && rule.equal_values(labels, &alert.labels)
                    })
                    .map(|(fp, _)| *fp)
            })
    }
}
