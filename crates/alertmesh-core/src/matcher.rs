//! Label matchers used by silences, routes, inhibition rules and query filters.
//!
//! A matcher compares one label against a value with one of four operators:
//! `=`, `!=`, `=~` and `!~`. Regular expressions are fully anchored. A label
//! that is absent from the label set is treated as the empty string.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::types::{LabelSet, is_valid_label_name};

/// The comparison a [`Matcher`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Label value equals the matcher value.
    Equal,
    /// Label value differs from the matcher value.
    NotEqual,
    /// Label value matches the anchored regex.
    Regex,
    /// Label value does not match the anchored regex.
    NotRegex,
}

impl MatchType {
    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_symbol())
    }
}

/// A single label matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawMatcher", into = "RawMatcher")]
pub struct Matcher {
    name: String,
    value: String,
    match_type: MatchType,
    regex: Option<Regex>,
}

/// Wire form of a matcher, compatible with the Alertmanager v2 API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMatcher {
    name: String,
    value: String,
    #[serde(default)]
    is_regex: bool,
    #[serde(default = "default_true")]
    is_equal: bool,
}

const fn default_true() -> bool {
    true
}

impl TryFrom<RawMatcher> for Matcher {
    type Error = AlertError;

    fn try_from(raw: RawMatcher) -> Result<Self> {
        let match_type = match (raw.is_regex, raw.is_equal) {
            (false, true) => MatchType::Equal,
            (false, false) => MatchType::NotEqual,
            (true, true) => MatchType::Regex,
            (true, false) => MatchType::NotRegex,
        };
        Self::new(raw.name, match_type, raw.value)
    }
}

impl From<Matcher> for RawMatcher {
    fn from(m: Matcher) -> Self {
        Self {
            is_regex: matches!(m.match_type, MatchType::Regex | MatchType::NotRegex),
            is_equal: matches!(m.match_type, MatchType::Equal | MatchType::Regex),
            name: m.name,
            value: m.value,
        }
    }
}

impl Matcher {
    /// Creates a matcher, compiling the regex for regex operators.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidMatcher` if the label name is invalid or the
    /// regex does not compile.
    pub fn new(
        name: impl Into<String>,
        match_type: MatchType,
        value: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let value = value.into();

        if !is_valid_label_name(&name) {
            return Err(AlertError::InvalidMatcher {
                matcher: format!("{name}{match_type}{value}"),
                reason: format!("invalid label name '{name}'"),
            });
        }

        let regex = match match_type {
            MatchType::Regex | MatchType::NotRegex => {
                let compiled = Regex::new(&format!("^(?:{value})$")).map_err(|e| {
                    AlertError::InvalidMatcher {
                        matcher: format!("{name}{match_type}{value}"),
                        reason: e.to_string(),
                    }
                })?;
                Some(compiled)
            }
            MatchType::Equal | MatchType::NotEqual => None,
        };

        Ok(Self {
            name,
            value,
            match_type,
            regex,
        })
    }

    /// Shorthand for an equality matcher.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidMatcher` if the label name is invalid.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(name, MatchType::Equal, value)
    }

    /// Returns the label name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the matcher value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the operator.
    #[must_use]
    pub const fn match_type(&self) -> MatchType {
        self.match_type
    }

    /// Tests a single value.
    #[must_use]
    pub fn matches_value(&self, value: &str) -> bool {
        match (self.match_type, &self.regex) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(value),
            (MatchType::NotRegex, Some(re)) => !re.is_match(value),
            (MatchType::Regex | MatchType::NotRegex, None) => false,
        }
    }

    /// Tests a label set; an absent label is treated as the empty string.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        let value = labels.get(&self.name).map_or("", String::as_str);
        self.matches_value(value)
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value && self.match_type == other.match_type
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.match_type, self.value)
    }
}

impl FromStr for Matcher {
    type Err = AlertError;

    /// Parses `name<op>value`, where the value may be double-quoted.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| AlertError::InvalidMatcher {
            matcher: s.to_string(),
            reason: reason.to_string(),
        };

        let op_start = s
            .find(['=', '!'])
            .ok_or_else(|| invalid("missing operator"))?;
        let rest = &s[op_start..];
        let (match_type, op_len) = if rest.starts_with("=~") {
            (MatchType::Regex, 2)
        } else if rest.starts_with("!=") {
            (MatchType::NotEqual, 2)
        } else if rest.starts_with("!~") {
            (MatchType::NotRegex, 2)
        } else if rest.starts_with('=') {
            (MatchType::Equal, 1)
        } else {
            return Err(invalid("unknown operator"));
        };

        let name = s[..op_start].trim();
        if name.is_empty() {
            return Err(invalid("missing label name"));
        }

        let raw_value = s[op_start + op_len..].trim();
        let value = match raw_value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
        {
            Some(quoted) => quoted.replace("\\\"", "\""),
            None => raw_value.to_string(),
        };

        Self::new(name, match_type, value)
    }
}

/// Parses a comma-separated matcher list such as `service=api,severity=~crit.*`.
///
/// Commas inside double quotes do not split.
///
/// # Errors
///
/// Returns `AlertError::InvalidMatcher` for the first matcher that fails to parse.
pub fn parse_matchers(input: &str) -> Result<Vec<Matcher>> {
    let trimmed = input
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}');

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut prev = '\0';
    for c in trimmed.chars() {
        match c {
            '"' if prev != '\\' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
        prev = c;
    }
    parts.push(current);

    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect()
}

/// Returns true if every matcher matches the label set.
#[must_use]
pub fn matches_all(matchers: &[Matcher], labels: &LabelSet) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}
