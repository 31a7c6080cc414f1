//! Devices: state, capabilities, completion, the per-device state machine
//! and the composition tree.

pub mod capability;
pub mod completion;
pub mod machine;
pub mod node;
pub mod state;

pub use capability::{Capability, CapabilitySet};
pub use completion::{CompletionPolicy, DoneFlag, MotionContext, MotionEvent, ReadbackMatches};
pub use machine::{DeviceHandle, DeviceSpec, DeviceSpecBuilder};
pub use node::{combine_states, Child, DeviceNode, FaultReport, NodeSnapshot, SignalEntry};
pub use state::{DeviceState, StateRecord, TransitionKind};
