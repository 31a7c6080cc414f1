//! In-memory signal binding.
//!
//! `MemorySignal` stands in for a live control-system channel. Tests and the
//! simulator drive it from the "IOC side" with [`MemorySignal::set`] and
//! [`MemorySignal::inject_fault`], and can make it misbehave on purpose
//! (unreadable, rejecting writes).

use super::{
    SignalBinding, SignalCallback, SignalRef, SignalUpdate, SignalValue, Subscribers, Subscription,
};
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Hook run after every accepted write, outside any lock.
pub type WriteHook = Arc<dyn Fn(&SignalValue) + Send + Sync>;

/// Thread-safe in-memory channel. Clones share the same channel.
#[derive(Clone)]
pub struct MemorySignal {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    reference: SignalRef,
    state: Mutex<MemoryState>,
    subscribers: Subscribers,
}

struct MemoryState {
    value: Option<SignalValue>,
    timestamp: DateTime<Utc>,
    unreadable: bool,
    reject_writes: Option<String>,
    writes: Vec<SignalValue>,
    on_write: Option<WriteHook>,
}

impl std::fmt::Debug for MemorySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemorySignal")
            .field("reference", &self.inner.reference)
            .field("value", &state.value)
            .field("unreadable", &state.unreadable)
            .finish()
    }
}

impl MemorySignal {
    /// Connected channel holding `initial`.
    pub fn new(reference: SignalRef, initial: SignalValue) -> Self {
        Self::build(reference, Some(initial))
    }

    /// Channel that has not delivered a value yet; reads fail until `set`.
    pub fn disconnected(reference: SignalRef) -> Self {
        Self::build(reference, None)
    }

    fn build(reference: SignalRef, value: Option<SignalValue>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                reference,
                state: Mutex::new(MemoryState {
                    value,
                    timestamp: Utc::now(),
                    unreadable: false,
                    reject_writes: None,
                    writes: Vec::new(),
                    on_write: None,
                }),
                subscribers: Subscribers::default(),
            }),
        }
    }

    /// Publish a new value from the control-system side.
    pub fn set(&self, value: impl Into<SignalValue>) {
        self.publish(SignalUpdate::now(value.into()));
    }

    /// Publish a value flagged as a hardware fault.
    pub fn inject_fault(&self, value: impl Into<SignalValue>) {
        self.publish(SignalUpdate::fault(value.into()));
    }

    /// Publish an arbitrary update.
    pub fn publish(&self, update: SignalUpdate) {
        {
            let mut state = self.inner.state.lock();
            state.value = Some(update.value.clone());
            state.timestamp = update.timestamp;
        }
        trace!(
            address = %self.inner.reference.address,
            value = %update.value,
            is_fault = update.is_fault,
            "Signal update"
        );
        self.inner.subscribers.notify(&update);
    }

    /// Make reads fail with `Unreadable` (e.g., lost connection).
    pub fn set_unreadable(&self, unreadable: bool) {
        self.inner.state.lock().unreadable = unreadable;
    }

    /// Reject subsequent writes with `reason`; `None` accepts them again.
    pub fn reject_writes(&self, reason: Option<&str>) {
        self.inner.state.lock().reject_writes = reason.map(str::to_string);
    }

    /// Install a hook run after every accepted write.
    pub fn on_write(&self, hook: WriteHook) {
        self.inner.state.lock().on_write = Some(hook);
    }

    /// Every accepted write, oldest first.
    pub fn writes(&self) -> Vec<SignalValue> {
        self.inner.state.lock().writes.clone()
    }

    /// Timestamp of the latest value.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.state.lock().timestamp
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

#[async_trait]
impl SignalBinding for MemorySignal {
    fn reference(&self) -> &SignalRef {
        &self.inner.reference
    }

    fn read(&self) -> DeviceResult<SignalValue> {
        let state = self.inner.state.lock();
        if state.unreadable {
            return Err(DeviceError::Unreadable(self.inner.reference.address.clone()));
        }
        state
            .value
            .clone()
            .ok_or_else(|| DeviceError::Unreadable(self.inner.reference.address.clone()))
    }

    async fn write(&self, value: SignalValue) -> DeviceResult<()> {
        let reference = &self.inner.reference;
        let rejected = |reason: String| DeviceError::WriteRejected {
            address: reference.address.clone(),
            reason,
        };

        if reference.read_only {
            return Err(rejected("signal is read-only".to_string()));
        }
        if value.kind() != reference.kind {
            return Err(rejected(format!(
                "expected {:?} value, got {:?}",
                reference.kind,
                value.kind()
            )));
        }

        let hook = {
            let mut state = self.inner.state.lock();
            if let Some(reason) = &state.reject_writes {
                return Err(rejected(reason.clone()));
            }
            state.writes.push(value.clone());
            state.on_write.clone()
        };

        self.publish(SignalUpdate::now(value.clone()));
        if let Some(hook) = hook {
            hook(&value);
        }
        Ok(())
    }

    fn subscribe(&self, callback: SignalCallback) -> Subscription {
        self.inner.subscribers.add(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setpoint() -> MemorySignal {
        MemorySignal::new(
            SignalRef::read_write("TST:MMS:01.VAL", SignalKind::Numeric),
            SignalValue::Numeric(0.0),
        )
    }

    #[tokio::test]
    async fn test_write_updates_value_and_notifies() {
        let signal = setpoint();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let _sub = signal.subscribe(Arc::new(move |update: &SignalUpdate| {
            seen_cb.lock().push(update.value.clone());
        }));

        signal.write(SignalValue::Numeric(2.5)).await.unwrap();

        assert_eq!(signal.read().unwrap(), SignalValue::Numeric(2.5));
        assert_eq!(*seen.lock(), vec![SignalValue::Numeric(2.5)]);
        assert_eq!(signal.writes(), vec![SignalValue::Numeric(2.5)]);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let signal = MemorySignal::new(
            SignalRef::read_only("TST:MMS:01.RBV", SignalKind::Numeric),
            SignalValue::Numeric(0.0),
        );
        let err = signal.write(SignalValue::Numeric(1.0)).await.unwrap_err();
        assert!(matches!(err, DeviceError::WriteRejected { .. }));
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let signal = setpoint();
        let err = signal.write(SignalValue::from("fast")).await.unwrap_err();
        assert!(err.to_string().contains("expected Numeric"));
    }

    #[tokio::test]
    async fn test_reject_writes_and_hook() {
        let signal = setpoint();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_hook = Arc::clone(&calls);
        signal.on_write(Arc::new(move |_| {
            calls_hook.fetch_add(1, Ordering::SeqCst);
        }));

        signal.reject_writes(Some("IOC in safe mode"));
        assert!(signal.write(SignalValue::Numeric(1.0)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        signal.reject_writes(None);
        signal.write(SignalValue::Numeric(1.0)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnected_and_unreadable() {
        let signal = MemorySignal::disconnected(SignalRef::read_only(
            "TST:DONE",
            SignalKind::Numeric,
        ));
        assert!(matches!(signal.read(), Err(DeviceError::Unreadable(_))));

        signal.set(1.0);
        assert!(signal.read().is_ok());

        signal.set_unreadable(true);
        assert!(matches!(signal.read(), Err(DeviceError::Unreadable(_))));
    }

    #[test]
    fn test_fault_flag_delivered() {
        let signal = setpoint();
        let faults = Arc::new(AtomicUsize::new(0));
        let faults_cb = Arc::clone(&faults);
        let _sub = signal.subscribe(Arc::new(move |update: &SignalUpdate| {
            if update.is_fault {
                faults_cb.fetch_add(1, Ordering::SeqCst);
            }
        }));

        signal.set(1.0);
        signal.inject_fault(-1.0);
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }
}
