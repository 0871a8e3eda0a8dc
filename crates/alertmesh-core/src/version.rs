//! Logical clocks for last-write-wins replication.
//!
//! Every replicated record carries a [`Version`]: the Lamport counter of the
//! instance that last mutated it, paired with that instance's identity. Versions
//! are totally ordered (counter first, then origin), so any two peers comparing
//! the same pair of versions reach the same verdict.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Logical timestamp of the last mutation of a replicated record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Lamport counter of the mutating instance at mutation time.
    pub counter: u64,
    /// Identity of the mutating instance.
    pub origin: String,
}

impl Version {
    /// Creates a version.
    #[must_use]
    pub fn new(counter: u64, origin: impl Into<String>) -> Self {
        Self {
            counter,
            origin: origin.into(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.origin)
    }
}

/// A Lamport clock local to one instance.
#[derive(Debug)]
pub struct LamportClock {
    origin: String,
    counter: AtomicU64,
}

impl LamportClock {
    /// Creates a clock for the given instance identity.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the identity stamped into versions produced by this clock.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Returns the current counter value.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Produces the version for a mutation of a record last stamped `previous`.
    ///
    /// The new counter is strictly greater than both the local counter and the
    /// record's counter.
    pub fn stamp(&self, previous: Option<&Version>) -> Version {
        let floor = previous.map_or(0, |v| v.counter);
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            let next = current.max(floor) + 1;
            match self
                .counter
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Version::new(next, self.origin.clone()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Advances the local counter past a counter observed from a peer.
    pub fn observe(&self, counter: u64) {
        self.counter.fetch_max(counter, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_by_counter_then_origin() {
        assert!(Version::new(2, "a") > Version::new(1, "z"));
        assert!(Version::new(1, "b") > Version::new(1, "a"));
        assert_eq!(Version::new(3, "a"), Version::new(3, "a"));
    }

    #[test]
    fn stamp_is_monotonic() {
        let clock = LamportClock::new("peer-1");
        let a = clock.stamp(None);
        let b = clock.stamp(None);
        assert!(b > a);
        assert_eq!(b.origin, "peer-1");
    }

    #[test]
    fn stamp_exceeds_previous_record() {
        let clock = LamportClock::new("peer-1");
        let remote = Version::new(41, "peer-2");
        let v = clock.stamp(Some(&remote));
        assert_eq!(v.counter, 42);
        assert!(v > remote);
    }

    #[test]
    fn observe_advances_clock() {
        let clock = LamportClock::new("peer-1");
        clock.observe(10);
        assert_eq!(clock.current(), 10);
        clock.observe(3);
        assert_eq!(clock.current(), 10);
        assert_eq!(clock.stamp(None).counter, 11);
    }

    #[test]
    fn version_display() {
        assert_eq!(Version::new(7, "am-1").to_string(), "7@am-1");
    }
}
