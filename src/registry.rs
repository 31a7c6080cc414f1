//! Device registry
//!
//! An explicit collaborator holding the top-level device trees of a
//! beamline. Registration only happens through [`RegistryBuilder`]; the built
//! [`DeviceRegistry`] is read-only and can be shared freely.
//!
//! # Example
//!
//! ```no_run
//! use beamline_devices::device::DeviceNode;
//! use beamline_devices::registry::{DeviceMetadata, RegistryBuilder};
//!
//! let mut builder = RegistryBuilder::new();
//! builder.register(DeviceNode::new("slits"), DeviceMetadata::new("group"))?;
//! let registry = builder.build();
//! assert!(registry.lookup("slits").is_some());
//! # Ok::<(), beamline_devices::error::DeviceError>(())
//! ```

use crate::device::{combine_states, DeviceNode, DeviceState, FaultReport, NodeSnapshot};
use crate::error::{DeviceError, DeviceResult};
use crate::signal::SignalBinding;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Descriptive information attached to a registered device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Device kind ("positioner", "shutter", "group", ...)
    pub kind: String,
    /// Channel prefix shared by the device signals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Free-form operator description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Arbitrary key/value labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub tags: BTreeMap<String, String>,
}

impl DeviceMetadata {
    /// Metadata with only a kind set.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Set the channel prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a label; a repeated key overwrites the old value.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

struct RegistryEntry {
    node: DeviceNode,
    metadata: DeviceMetadata,
}

/// Mutable registration phase.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<RegistryEntry>,
}

impl RegistryBuilder {
    /// Create an empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a top-level device tree. Root names are unique.
    pub fn register(&mut self, node: DeviceNode, metadata: DeviceMetadata) -> DeviceResult<()> {
        if self.contains(node.name()) {
            return Err(DeviceError::DuplicateName(node.name().to_string()));
        }
        info!(device = node.name(), kind = %metadata.kind, "Registered device");
        self.entries.push(RegistryEntry { node, metadata });
        Ok(())
    }

    /// Whether a root with this name is already registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.node.name() == name)
    }

    /// Number of registered roots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the registrations.
    pub fn build(self) -> DeviceRegistry {
        DeviceRegistry {
            entries: self.entries,
        }
    }
}

/// Read-only set of registered device trees.
pub struct DeviceRegistry {
    entries: Vec<RegistryEntry>,
}

/// Serializable view of one registered device tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Registration metadata
    pub metadata: DeviceMetadata,
    /// Tree snapshot rooted at the registered device
    pub node: NodeSnapshot,
}

impl DeviceRegistry {
    /// Root names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.node.name())
    }

    /// Registered trees in registration order.
    pub fn roots(&self) -> impl Iterator<Item = &DeviceNode> {
        self.entries.iter().map(|entry| &entry.node)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Root device by name.
    pub fn get(&self, name: &str) -> Option<&DeviceNode> {
        self.entry(name).map(|entry| &entry.node)
    }

    /// Metadata of the root device by name.
    pub fn metadata(&self, name: &str) -> Option<&DeviceMetadata> {
        self.entry(name).map(|entry| &entry.metadata)
    }

    /// Resolve a dotted path whose first segment is a root name.
    pub fn lookup(&self, path: &str) -> Option<&DeviceNode> {
        let (root, rest) = path.split_once('.').unwrap_or((path, ""));
        self.get(root)?.lookup(rest)
    }

    /// Resolve `"root.device.signal"`.
    pub fn lookup_signal(&self, path: &str) -> Option<&Arc<dyn SignalBinding>> {
        let (root, rest) = path.split_once('.')?;
        self.get(root)?.lookup_signal(rest)
    }

    /// Like [`lookup`](Self::lookup) but reports the missing path.
    pub fn require(&self, path: &str) -> DeviceResult<&DeviceNode> {
        self.lookup(path)
            .ok_or_else(|| DeviceError::NotFound(path.to_string()))
    }

    /// Roots whose metadata kind equals `kind`.
    pub fn by_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a DeviceNode> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.metadata.kind == kind)
            .map(|entry| &entry.node)
    }

    /// Combined state of every registered tree.
    pub fn aggregate_status(&self) -> DeviceState {
        combine_states(self.roots().map(DeviceNode::aggregate_status))
    }

    /// Faulted devices across every tree.
    pub fn faults(&self) -> Vec<FaultReport> {
        self.roots().flat_map(DeviceNode::faults).collect()
    }

    /// Snapshot every tree with its metadata.
    pub fn snapshot(&self) -> Vec<RegistrySnapshot> {
        self.entries
            .iter()
            .map(|entry| RegistrySnapshot {
                metadata: entry.metadata.clone(),
                node: entry.node.snapshot(),
            })
            .collect()
    }

    /// Stop every device state machine in every tree, concurrently.
    pub async fn shutdown(&self) {
        let machines: Vec<_> = self
            .roots()
            .flat_map(DeviceNode::walk)
            .filter_map(|node| node.machine().map(|machine| (node.path(), machine)))
            .collect();
        let results = join_all(machines.iter().map(|(_, machine)| machine.shutdown())).await;
        for ((path, _), result) in machines.iter().zip(results) {
            if let Err(err) = result {
                warn!(device = %path, error = %err, "Shutdown failed");
            }
        }
    }

    fn entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|entry| entry.node.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{MemorySignal, SignalKind, SignalRef, SignalValue};

    fn registry() -> DeviceRegistry {
        let mut slits = DeviceNode::new("slits");
        slits.add_device(DeviceNode::new("top")).unwrap();
        let mut gap = DeviceNode::new("gap");
        gap.add_signal(
            "readback",
            Arc::new(MemorySignal::new(
                SignalRef::read_only("XPP:SLITS:GAP.RBV", SignalKind::Numeric),
                SignalValue::Numeric(1.5),
            )),
        )
        .unwrap();
        slits.add_device(gap).unwrap();

        let mut builder = RegistryBuilder::new();
        builder
            .register(
                slits,
                DeviceMetadata::new("group").with_description("Four-blade slits"),
            )
            .unwrap();
        builder
            .register(
                DeviceNode::new("shutter"),
                DeviceMetadata::new("shutter").with_prefix("XPP:SH:01"),
            )
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_duplicate_root_rejected() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(DeviceNode::new("shutter"), DeviceMetadata::new("shutter"))
            .unwrap();
        let err = builder
            .register(DeviceNode::new("shutter"), DeviceMetadata::new("shutter"))
            .unwrap_err();
        assert_eq!(err, DeviceError::DuplicateName("shutter".into()));
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_lookup_by_path() {
        let registry = registry();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["slits", "shutter"]);
        assert_eq!(registry.lookup("slits.top").unwrap().path(), "slits.top");
        assert!(registry.lookup("slits.bottom").is_none());
        assert!(registry.lookup_signal("slits.gap.readback").is_some());
        assert!(matches!(
            registry.require("mirror"),
            Err(DeviceError::NotFound(_))
        ));
    }

    #[test]
    fn test_metadata_and_kind_filter() {
        let registry = registry();
        assert_eq!(
            registry.metadata("shutter").unwrap().prefix.as_deref(),
            Some("XPP:SH:01")
        );
        let shutters: Vec<_> = registry.by_kind("shutter").map(DeviceNode::name).collect();
        assert_eq!(shutters, vec!["shutter"]);
    }

    #[test]
    fn test_passive_trees_aggregate_idle() {
        let registry = registry();
        assert_eq!(registry.aggregate_status(), DeviceState::Idle);
        assert!(registry.faults().is_empty());

        let snapshot = registry.snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json[0]["metadata"]["description"], "Four-blade slits");
        assert_eq!(json[0]["node"]["children"][1]["path"], "slits.gap");
    }
}
