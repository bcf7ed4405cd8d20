//! Vector clocks for ordering database versions
//!
//! Every database version carries a snapshot of its creator's vector clock:
//! a mapping from client id to a counter. A client increments its own
//! component when it commits a new version and merges a remote clock when it
//! adopts remote versions as causal predecessors.
//!
//! Comparing two clocks yields one of four outcomes. `Simultaneous` means
//! neither clock saw the other's latest change, which is the signal the
//! reconciler uses to detect conflicting edits.
//!
//! ## Examples
//!
//! ```rust
//! use syncfold::vector_clock::{ClockOrdering, VectorClock};
//!
//! let base = VectorClock::new();
//! let a = base.increment("A");
//! let b = base.increment("B");
//!
//! assert_eq!(base.compare(&a), ClockOrdering::Before);
//! assert_eq!(a.compare(&b), ClockOrdering::Simultaneous);
//!
//! let merged = a.merge(&b);
//! assert_eq!(merged.to_string(), "(A1,B1)");
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Causal relationship between two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockOrdering {
    /// Left clock happened strictly before the right one
    Before,
    /// Left clock happened strictly after the right one
    After,
    /// Both clocks are identical
    Equal,
    /// Neither clock dominates the other (concurrent changes)
    Simultaneous,
}

impl ClockOrdering {
    /// Swap the sides of the comparison
    pub fn reverse(self) -> Self {
        match self {
            ClockOrdering::Before => ClockOrdering::After,
            ClockOrdering::After => ClockOrdering::Before,
            other => other,
        }
    }
}

/// Per-client logical clock
///
/// Absent clients count as zero, so `(A1)` and `(A1,B0)` are equal. Zero
/// components are never stored, not even when deserializing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct VectorClock {
    clocks: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty clock (all components zero)
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter of the given client, zero when absent
    pub fn get(&self, client: &str) -> u64 {
        self.clocks.get(client).copied().unwrap_or(0)
    }

    /// Set a component explicitly; zero removes it
    pub fn set(&mut self, client: impl Into<String>, value: u64) {
        let client = client.into();
        if value == 0 {
            self.clocks.remove(&client);
        } else {
            self.clocks.insert(client, value);
        }
    }

    /// Return a copy with `client`'s counter advanced by one
    pub fn increment(&self, client: &str) -> VectorClock {
        let mut next = self.clone();
        let value = self.get(client) + 1;
        next.clocks.insert(client.to_string(), value);
        next
    }

    /// Component-wise maximum over the union of both clocks' clients
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (client, &value) in &other.clocks {
            let entry = merged.clocks.entry(client.clone()).or_insert(0);
            if value > *entry {
                *entry = value;
            }
        }
        merged
    }

    /// Component-wise minimum over the union of both clocks' clients
    pub fn meet(&self, other: &VectorClock) -> VectorClock {
        let mut met = VectorClock::new();
        for (client, &value) in &self.clocks {
            met.set(client.clone(), value.min(other.get(client)));
        }
        met
    }

    /// Compare two clocks causally
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for client in self.clocks.keys().chain(other.clocks.keys()) {
            match self.get(client).cmp(&other.get(client)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Simultaneous;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Simultaneous,
        }
    }

    /// True if this clock happened before or equals `other`
    pub fn dominated_by(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::Before | ClockOrdering::Equal)
    }

    /// Iterate over non-zero components in client order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.clocks.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of non-zero components
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// True if every component is zero
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

impl From<BTreeMap<String, u64>> for VectorClock {
    fn from(mut clocks: BTreeMap<String, u64>) -> Self {
        clocks.retain(|_, value| *value > 0);
        Self { clocks }
    }
}

impl From<VectorClock> for BTreeMap<String, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.clocks
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (client, value)) in self.clocks.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}{}", client, value)?;
        }
        write!(f, ")")
    }
}

impl FromStr for VectorClock {
    type Err = SyncError;

    /// Parse the `(A1,B23)` form produced by `Display`
    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| SyncError::InvalidVectorClock(s.to_string()))?;

        let mut clock = VectorClock::new();
        if inner.is_empty() {
            return Ok(clock);
        }

        for part in inner.split(',') {
            let split = part
                .find(|c: char| c.is_ascii_digit())
                .ok_or_else(|| SyncError::InvalidVectorClock(s.to_string()))?;
            let (client, digits) = part.split_at(split);
            if client.is_empty() {
                return Err(SyncError::InvalidVectorClock(s.to_string()));
            }
            let value: u64 = digits
                .parse()
                .map_err(|_| SyncError::InvalidVectorClock(s.to_string()))?;
            clock.set(client, value);
        }

        Ok(clock)
    }
}
