//! Capability tags.
//!
//! Device variants differ in what they can do rather than in what they are.
//! Behavior that only some devices support is dispatched on these tags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Behavior a device opts into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Accepts a stop command while a transition is in flight
    SupportsCancel,
    /// Reports a continuous position readback
    SupportsPositionFeedback,
    /// Has a reset signal written when a fault is acknowledged
    SupportsFaultReset,
}

/// Set of capability tags declared by a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Create an empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag; returns false if it was already present.
    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    /// Whether the entry is present.
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Tags in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
