//! Signal bindings
//!
//! A signal is one live, named value exposed by the control system (a motor
//! readback, a shutter state, a done-moving flag). The engine never talks to
//! the control system directly; it consumes the [`SignalBinding`] contract:
//!
//! - `read()` returns the latest known value, or `Unreadable`
//! - `write(value)` acknowledges or fails with `WriteRejected`
//! - `subscribe(callback)` delivers `(value, timestamp, is_fault)` updates
//!   until the returned [`Subscription`] is dropped
//!
//! # Architecture
//!
//! ```text
//! SignalBinding (trait)
//!   ├─ MemorySignal          in-memory channel (tests, simulation)
//!   ├─ InternalSignal        read-only to callers, settable by its owner
//!   ├─ AggregateSignal       readback computed from several sources
//!   ├─ AverageSignal         rolling mean of a numeric source
//!   └─ UnitConversionSignal  linear unit conversion with user offset
//! ```
//!
//! Devices declare their signals once, by name, in a [`SignalTable`].

mod derived;
mod memory;
mod table;
mod units;

pub use derived::{
    AggregateFn, AggregateSignal, AverageSignal, InternalSignal, NotImplementedSignal,
    OptionalSignal, UnitConversionSignal, NOT_IMPLEMENTED,
};
pub use memory::{MemorySignal, WriteHook};
pub use table::SignalTable;
pub use units::convert_unit;

use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

// =============================================================================
// Values and references
// =============================================================================

/// Data kind carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Floating-point value
    Numeric,
    /// Index into a fixed set of labels
    Enumerated,
    /// Free text
    Text,
}

/// A value read from or written to a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SignalValue {
    /// Numeric value
    Numeric(f64),
    /// Enumeration value
    Enumerated {
        /// Position in the enumeration
        index: u16,
        /// Display label of the position
        label: String,
    },
    /// Text value
    Text(String),
}

impl SignalValue {
    /// The kind of this value.
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalValue::Numeric(_) => SignalKind::Numeric,
            SignalValue::Enumerated { .. } => SignalKind::Enumerated,
            SignalValue::Text(_) => SignalKind::Text,
        }
    }

    /// Numeric view; enumerated values yield their index.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Numeric(v) => Some(*v),
            SignalValue::Enumerated { index, .. } => Some(f64::from(*index)),
            SignalValue::Text(_) => None,
        }
    }

    /// Truthiness as the control system sees it: non-zero is true.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_f64().map(|v| v != 0.0)
    }

    /// Text view; enumerated values yield their label.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SignalValue::Text(s) => Some(s),
            SignalValue::Enumerated { label, .. } => Some(label),
            SignalValue::Numeric(_) => None,
        }
    }

    /// Convenience constructor for enumerated values.
    pub fn enumerated(index: u16, label: impl Into<String>) -> Self {
        SignalValue::Enumerated {
            index,
            label: label.into(),
        }
    }
}

impl From<f64> for SignalValue {
    fn from(value: f64) -> Self {
        SignalValue::Numeric(value)
    }
}

impl From<bool> for SignalValue {
    fn from(value: bool) -> Self {
        SignalValue::Numeric(if value { 1.0 } else { 0.0 })
    }
}

impl From<&str> for SignalValue {
    fn from(value: &str) -> Self {
        SignalValue::Text(value.to_string())
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Numeric(v) => write!(f, "{}", v),
            SignalValue::Enumerated { index, label } => write!(f, "{} ({})", label, index),
            SignalValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Direction of a control-system record as declared by its io specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalIo {
    /// Readable only
    Input,
    /// Readable and writable
    Output,
}

impl FromStr for SignalIo {
    type Err = DeviceError;

    fn from_str(io: &str) -> Result<Self, Self::Err> {
        match io.trim().to_ascii_lowercase().as_str() {
            "i" | "input" | "ro" => Ok(SignalIo::Input),
            "o" | "io" | "output" | "rw" => Ok(SignalIo::Output),
            other => Err(DeviceError::Unsupported(format!(
                "invalid io specifier '{}'",
                other
            ))),
        }
    }
}

impl SignalIo {
    /// Whether a record with this io can be written.
    pub fn is_writable(self) -> bool {
        matches!(self, SignalIo::Output)
    }
}

/// Identifies one control-system channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalRef {
    /// Channel address (e.g., "XPP:SB2:MMS:01.RBV")
    pub address: String,
    /// Data kind
    pub kind: SignalKind,
    /// Whether writes are refused
    pub read_only: bool,
}

impl SignalRef {
    /// A writable channel.
    pub fn read_write(address: impl Into<String>, kind: SignalKind) -> Self {
        Self {
            address: address.into(),
            kind,
            read_only: false,
        }
    }

    /// A read-only channel.
    pub fn read_only(address: impl Into<String>, kind: SignalKind) -> Self {
        Self {
            address: address.into(),
            kind,
            read_only: true,
        }
    }

    /// Reference for a PLC-generated record declared by prefix and io specifier.
    ///
    /// Readback lives at `<prefix>_RBV`; writability follows the io direction.
    pub fn from_io(prefix: &str, io: &str, kind: SignalKind) -> DeviceResult<Self> {
        let io: SignalIo = io.parse()?;
        Ok(Self {
            address: format!("{}_RBV", prefix),
            kind,
            read_only: !io.is_writable(),
        })
    }
}

/// One change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalUpdate {
    /// Current value
    pub value: SignalValue,
    /// Time the value was produced
    pub timestamp: DateTime<Utc>,
    /// Set when the control system flags this update as a hardware fault
    pub is_fault: bool,
}

impl SignalUpdate {
    /// A normal (non-fault) update stamped now.
    pub fn now(value: SignalValue) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
            is_fault: false,
        }
    }

    /// A fault update stamped now.
    pub fn fault(value: SignalValue) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
            is_fault: true,
        }
    }
}

// =============================================================================
// Binding contract
// =============================================================================

/// Callback invoked for every update of a subscribed signal.
pub type SignalCallback = Arc<dyn Fn(&SignalUpdate) + Send + Sync>;

/// A named, typed handle to one live control-system value.
#[async_trait]
pub trait SignalBinding: Send + Sync {
    /// The channel this binding is attached to.
    fn reference(&self) -> &SignalRef;

    /// Latest known value.
    fn read(&self) -> DeviceResult<SignalValue>;

    /// Write a value and wait for the acknowledgement.
    async fn write(&self, value: SignalValue) -> DeviceResult<()>;

    /// Register for change notifications until the handle is dropped.
    fn subscribe(&self, callback: SignalCallback) -> Subscription;
}

/// Handle for an active subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl Subscription {
    /// Create a handle that runs `cancel` when dropped.
    pub fn new(id: u64, cancel: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription id, unique per signal.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Keep the subscription alive for the lifetime of the signal.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel(self.id);
        }
    }
}

/// Subscriber bookkeeping shared by the concrete bindings.
///
/// Callbacks are invoked outside the lock so a callback may subscribe,
/// unsubscribe or read the signal without deadlocking.
#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    callbacks: Arc<Mutex<Vec<(u64, SignalCallback)>>>,
}

impl Subscribers {
    pub(crate) fn add(&self, callback: SignalCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().push((id, callback));
        let list: Weak<Mutex<Vec<(u64, SignalCallback)>>> = Arc::downgrade(&self.callbacks);
        Subscription::new(id, move |id| {
            if let Some(list) = list.upgrade() {
                list.lock().retain(|(other, _)| *other != id);
            }
        })
    }

    pub(crate) fn notify(&self, update: &SignalUpdate) {
        let callbacks: Vec<SignalCallback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(update);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_specifiers() {
        assert_eq!("i".parse::<SignalIo>().unwrap(), SignalIo::Input);
        assert_eq!("RO".parse::<SignalIo>().unwrap(), SignalIo::Input);
        assert_eq!("io".parse::<SignalIo>().unwrap(), SignalIo::Output);
        assert_eq!(" rw ".parse::<SignalIo>().unwrap(), SignalIo::Output);
        assert!("sideways".parse::<SignalIo>().is_err());
    }

    #[test]
    fn test_signal_ref_from_io() {
        let rw = SignalRef::from_io("PLC:XPP:ATT:01:Enable", "io", SignalKind::Numeric).unwrap();
        assert_eq!(rw.address, "PLC:XPP:ATT:01:Enable_RBV");
        assert!(!rw.read_only);

        let ro = SignalRef::from_io("PLC:XPP:ATT:01:Temp", "i", SignalKind::Numeric).unwrap();
        assert!(ro.read_only);
    }

    #[test]
    fn test_value_views() {
        assert_eq!(SignalValue::from(true).as_f64(), Some(1.0));
        assert_eq!(SignalValue::enumerated(2, "OUT").as_f64(), Some(2.0));
        assert_eq!(SignalValue::enumerated(2, "OUT").as_str(), Some("OUT"));
        assert_eq!(SignalValue::from("ok").as_bool(), None);
        assert_eq!(SignalValue::Numeric(0.0).as_bool(), Some(false));
    }

    #[test]
    fn test_value_serialization() {
        let json = serde_json::to_value(SignalValue::enumerated(1, "IN")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "enumerated", "value": {"index": 1, "label": "IN"}})
        );
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let subscribers = Subscribers::default();
        let sub = subscribers.add(Arc::new(|_| {}));
        let kept = subscribers.add(Arc::new(|_| {}));
        assert_eq!(subscribers.len(), 2);
        drop(sub);
        assert_eq!(subscribers.len(), 1);
        kept.detach();
        assert_eq!(subscribers.len(), 1);
    }
}
