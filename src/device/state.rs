//! Device states and the record published on every state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete operational state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Ready to accept a transition request
    Idle,
    /// A transition is in flight
    Moving,
    /// Hardware fault; cleared only by acknowledgement
    Faulted,
    /// Administratively out of service
    Disabled,
    /// No successful signal read yet
    Unknown,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Idle => "idle",
            DeviceState::Moving => "moving",
            DeviceState::Faulted => "faulted",
            DeviceState::Disabled => "disabled",
            DeviceState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Kind of transition, used to pick the timeout armed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// Motion to a position
    Move,
    /// Change of a configuration value
    Configure,
    /// Discrete actuation (open/close, insert/remove)
    Actuate,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionKind::Move => "move",
            TransitionKind::Configure => "configure",
            TransitionKind::Actuate => "actuate",
        };
        f.write_str(name)
    }
}

/// Published view of a device's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Current state
    pub state: DeviceState,
    /// When the device entered `state`
    pub since: DateTime<Utc>,
    /// Message of the most recent interlock denial, cleared by the next
    /// permitted transition
    pub last_denial: Option<String>,
    /// Description of the unacknowledged fault, if any
    pub fault: Option<String>,
}

impl StateRecord {
    pub(crate) fn initial() -> Self {
        Self {
            state: DeviceState::Unknown,
            since: Utc::now(),
            last_denial: None,
            fault: None,
        }
    }
}
