//! Device composition tree.
//!
//! A [`DeviceNode`] groups signals and sub-devices under one name, e.g. a
//! slit assembly made of four blade motors. The tree is built once; the
//! parent owns its children and children are addressed by dotted path
//! (`"slits.top"`), never by back-pointer.

use super::machine::DeviceHandle;
use super::state::DeviceState;
use crate::error::{DeviceError, DeviceResult};
use crate::signal::{SignalBinding, SignalRef};
use crate::status::StatusSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A named child: either a nested device or a bare signal.
#[derive(Clone)]
pub enum Child {
    /// Nested device
    Device(DeviceNode),
    /// Bare signal
    Signal(Arc<dyn SignalBinding>),
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Child::Device(node) => f.debug_tuple("Device").field(&node.name).finish(),
            Child::Signal(binding) => f.debug_tuple("Signal").field(binding.reference()).finish(),
        }
    }
}

/// A named node in a device tree, optionally backed by a state machine.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    name: String,
    path: Vec<String>,
    machine: Option<DeviceHandle>,
    children: Vec<(String, Child)>,
}

/// A faulted device found while walking a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    /// Dotted path of the device
    pub path: String,
    /// Recorded fault message
    pub fault: Option<String>,
}

/// Serializable view of a node and its descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Node name
    pub name: String,
    /// Dotted path from the root
    pub path: String,
    /// Own state, absent for passive containers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DeviceState>,
    /// Combined state of the node and its descendants
    pub aggregate: DeviceState,
    /// Message of the last interlock denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_denial: Option<String>,
    /// Recorded fault message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    /// Recently resolved statuses, oldest first
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub history: Vec<StatusSnapshot>,
    /// Signals declared directly on this node
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub signals: Vec<SignalEntry>,
    /// Nested device snapshots
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<NodeSnapshot>,
}

/// Named signal declared on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntry {
    /// Name the signal is declared under
    pub name: String,
    /// Channel reference of the binding
    #[serde(flatten)]
    pub reference: SignalRef,
}

/// Fold device states into the state of their container.
///
/// faulted > moving > disabled > idle. `unknown` counts as idle.
pub fn combine_states(states: impl IntoIterator<Item = DeviceState>) -> DeviceState {
    let rank = |state: DeviceState| match state {
        DeviceState::Faulted => 3,
        DeviceState::Moving => 2,
        DeviceState::Disabled => 1,
        DeviceState::Idle | DeviceState::Unknown => 0,
    };
    states
        .into_iter()
        .map(|state| match state {
            DeviceState::Unknown => DeviceState::Idle,
            other => other,
        })
        .max_by_key(|state| rank(*state))
        .unwrap_or(DeviceState::Idle)
}

impl DeviceNode {
    /// A passive container with no state machine of its own.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: vec![name.clone()],
            name,
            machine: None,
            children: Vec::new(),
        }
    }

    /// A node driven by `machine`. Its declared signals become signal children.
    pub fn actuated(machine: DeviceHandle) -> DeviceResult<Self> {
        let mut node = Self::new(machine.name());
        for (name, binding) in machine.signals().iter() {
            node.add_signal(name, Arc::clone(binding))?;
        }
        node.machine = Some(machine);
        Ok(node)
    }

    /// Name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path from the tree root, e.g. `"slits.top"`.
    pub fn path(&self) -> String {
        self.path.join(".")
    }

    /// Path from the root, one segment per level.
    pub fn path_segments(&self) -> &[String] {
        &self.path
    }

    /// State machine handle, if any.
    pub fn machine(&self) -> Option<&DeviceHandle> {
        self.machine.as_ref()
    }

    /// Own state, if this node has a state machine.
    pub fn state(&self) -> Option<DeviceState> {
        self.machine.as_ref().map(DeviceHandle::state)
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Attach `child` under `name`. Names are unique among siblings only.
    ///
    /// A device child takes `name` as its own name.
    pub fn add_child(&mut self, name: impl Into<String>, child: Child) -> DeviceResult<()> {
        let name = name.into();
        self.ensure_unique(&name)?;
        let child = match child {
            Child::Device(mut node) => {
                node.name = name.clone();
                node.reparent(&self.path);
                Child::Device(node)
            }
            signal @ Child::Signal(_) => signal,
        };
        self.children.push((name, child));
        Ok(())
    }

    /// Attach a device under its own name.
    pub fn add_device(&mut self, child: DeviceNode) -> DeviceResult<()> {
        let name = child.name.clone();
        self.add_child(name, Child::Device(child))
    }

    /// Attach a bare signal under `name`.
    pub fn add_signal(
        &mut self,
        name: impl Into<String>,
        binding: Arc<dyn SignalBinding>,
    ) -> DeviceResult<()> {
        self.add_child(name, Child::Signal(binding))
    }

    /// Builder form of [`add_device`](Self::add_device).
    pub fn with_device(mut self, child: DeviceNode) -> DeviceResult<Self> {
        self.add_device(child)?;
        Ok(self)
    }

    fn ensure_unique(&self, name: &str) -> DeviceResult<()> {
        if self.children.iter().any(|(existing, _)| existing == name) {
            return Err(DeviceError::DuplicateName(format!("{}.{}", self.path(), name)));
        }
        Ok(())
    }

    fn reparent(&mut self, parent: &[String]) {
        self.path = parent
            .iter()
            .cloned()
            .chain(std::iter::once(self.name.clone()))
            .collect();
        let path = self.path.clone();
        for (_, child) in &mut self.children {
            if let Child::Device(node) = child {
                node.reparent(&path);
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Children in registration order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Child)> {
        self.children.iter().map(|(name, child)| (name.as_str(), child))
    }

    /// Nested devices, skipping bare signals.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceNode> {
        self.children.iter().filter_map(|(_, child)| match child {
            Child::Device(node) => Some(node),
            Child::Signal(_) => None,
        })
    }

    /// Direct child device by name.
    pub fn device(&self, name: &str) -> Option<&DeviceNode> {
        self.devices().find(|node| node.name == name)
    }

    /// Direct child signal by name.
    pub fn signal(&self, name: &str) -> Option<&Arc<dyn SignalBinding>> {
        self.children.iter().find_map(|(child_name, child)| match child {
            Child::Signal(binding) if child_name == name => Some(binding),
            _ => None,
        })
    }

    /// Resolve a dotted path relative to this node. The empty path is `self`.
    pub fn lookup(&self, path: &str) -> Option<&DeviceNode> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| node.device(segment))
    }

    /// Resolve `"device.path.signal"` relative to this node.
    pub fn lookup_signal(&self, path: &str) -> Option<&Arc<dyn SignalBinding>> {
        match path.rsplit_once('.') {
            Some((devices, signal)) => self.lookup(devices)?.signal(signal),
            None => self.signal(path),
        }
    }

    /// This node followed by all descendant devices, depth first.
    pub fn walk(&self) -> Vec<&DeviceNode> {
        let mut nodes = vec![self];
        for child in self.devices() {
            nodes.extend(child.walk());
        }
        nodes
    }

    /// Combined state of this node and every descendant.
    pub fn aggregate_status(&self) -> DeviceState {
        combine_states(self.walk().into_iter().filter_map(DeviceNode::state))
    }

    /// Every faulted device in this subtree.
    pub fn faults(&self) -> Vec<FaultReport> {
        self.walk()
            .into_iter()
            .filter_map(|node| {
                let machine = node.machine.as_ref()?;
                let record = machine.record();
                (record.state == DeviceState::Faulted).then(|| FaultReport {
                    path: node.path(),
                    fault: record.fault,
                })
            })
            .collect()
    }

    /// Serializable view of this subtree.
    pub fn snapshot(&self) -> NodeSnapshot {
        let record = self.machine.as_ref().map(DeviceHandle::record);
        NodeSnapshot {
            name: self.name.clone(),
            path: self.path(),
            state: record.as_ref().map(|r| r.state),
            aggregate: self.aggregate_status(),
            last_denial: record.as_ref().and_then(|r| r.last_denial.clone()),
            fault: record.and_then(|r| r.fault),
            history: self
                .machine
                .as_ref()
                .map(DeviceHandle::history_snapshots)
                .unwrap_or_default(),
            signals: self
                .children
                .iter()
                .filter_map(|(name, child)| match child {
                    Child::Signal(binding) => Some(SignalEntry {
                        name: name.clone(),
                        reference: binding.reference().clone(),
                    }),
                    Child::Device(_) => None,
                })
                .collect(),
            children: self.devices().map(DeviceNode::snapshot).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::completion::DoneFlag;
    use crate::device::machine::DeviceSpec;
    use crate::signal::{MemorySignal, SignalKind, SignalValue};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(60);

    fn signal(address: &str) -> MemorySignal {
        MemorySignal::new(
            SignalRef::read_write(address, SignalKind::Numeric),
            SignalValue::Numeric(1.0),
        )
    }

    fn blade(name: &str) -> (DeviceHandle, MemorySignal) {
        let done = signal(&format!("TST:{}.DMOV", name));
        let spec = DeviceSpec::builder(name)
            .signal("setpoint", Arc::new(signal(&format!("TST:{}.VAL", name))))
            .signal("done", Arc::new(done.clone()))
            .setpoint("setpoint")
            .completion(DoneFlag::new("done"))
            .build()
            .unwrap();
        (DeviceHandle::spawn(spec).unwrap(), done)
    }

    #[test]
    fn test_combine_states_precedence() {
        use DeviceState::*;
        assert_eq!(combine_states(Vec::new()), Idle);
        assert_eq!(combine_states([Idle, Unknown]), Idle);
        assert_eq!(combine_states([Idle, Disabled]), Disabled);
        assert_eq!(combine_states([Disabled, Moving, Idle]), Moving);
        assert_eq!(combine_states([Moving, Faulted, Disabled]), Faulted);
    }

    #[test]
    fn test_duplicate_child_names_rejected() {
        let mut node = DeviceNode::new("slits");
        node.add_signal("gap", Arc::new(signal("TST:GAP"))).unwrap();
        let err = node.add_device(DeviceNode::new("gap")).unwrap_err();
        assert_eq!(err, DeviceError::DuplicateName("slits.gap".into()));
    }

    #[test]
    fn test_add_child_names_device() {
        let mut node = DeviceNode::new("mirror");
        node.add_child("pitch", Child::Device(DeviceNode::new("axis"))).unwrap();
        assert_eq!(node.lookup("pitch").unwrap().path(), "mirror.pitch");
        assert!(node.lookup("axis").is_none());

        let err = node
            .add_child("pitch", Child::Signal(Arc::new(signal("TST:PITCH"))))
            .unwrap_err();
        assert_eq!(err, DeviceError::DuplicateName("mirror.pitch".into()));
    }

    #[test]
    fn test_paths_follow_reparenting() {
        let inner = DeviceNode::new("top").with_device(DeviceNode::new("encoder")).unwrap();
        let root = DeviceNode::new("slits").with_device(inner).unwrap();

        let encoder = root.lookup("top.encoder").unwrap();
        assert_eq!(encoder.path(), "slits.top.encoder");
        assert_eq!(root.lookup("").unwrap().name(), "slits");
        assert!(root.lookup("bottom").is_none());
        assert_eq!(root.walk().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_follows_children() {
        let (top, top_done) = blade("top");
        let (bottom, _) = blade("bottom");
        let (left, _) = blade("left");
        top.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();
        bottom.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();
        left.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();

        let mut slits = DeviceNode::new("slits");
        slits.add_device(DeviceNode::actuated(top.clone()).unwrap()).unwrap();
        slits.add_device(DeviceNode::actuated(bottom.clone()).unwrap()).unwrap();
        slits.add_device(DeviceNode::actuated(left.clone()).unwrap()).unwrap();
        assert_eq!(slits.aggregate_status(), DeviceState::Idle);

        let _status = top.request_transition(2.0).await.unwrap();
        assert_eq!(slits.aggregate_status(), DeviceState::Moving);

        bottom.disable().await.unwrap();
        assert_eq!(slits.aggregate_status(), DeviceState::Moving);

        top_done.inject_fault(true);
        top.wait_for_state(DeviceState::Faulted, WAIT).await.unwrap();
        assert_eq!(slits.aggregate_status(), DeviceState::Faulted);

        let faults = slits.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].path, "slits.top");
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_lists_signals_and_children() {
        let (top, _) = blade("top");
        top.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();
        let slits = DeviceNode::new("slits")
            .with_device(DeviceNode::actuated(top).unwrap())
            .unwrap();

        assert!(slits.lookup_signal("top.done").is_some());
        assert!(slits.lookup_signal("top.missing").is_none());

        let snapshot = slits.snapshot();
        assert_eq!(snapshot.state, None);
        assert_eq!(snapshot.children.len(), 1);
        let top = &snapshot.children[0];
        assert_eq!(top.path, "slits.top");
        assert_eq!(top.state, Some(DeviceState::Idle));
        assert_eq!(top.signals.len(), 2);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["children"][0]["signals"][1]["address"], "TST:top.DMOV");
    }
}
