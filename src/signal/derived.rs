//! Signals derived from other signals.
//!
//! None of these talk to the control system themselves: they subscribe to
//! their sources and republish a computed readback to their own subscribers.
//! Source subscriptions hold only a weak reference back to the derived
//! signal, so dropping the derived signal unsubscribes from every source.

use super::{
    convert_unit, MemorySignal, SignalBinding, SignalCallback, SignalKind, SignalRef,
    SignalUpdate, SignalValue, Subscribers, Subscription,
};
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

fn read_only_write(reference: &SignalRef, reason: &str) -> DeviceError {
    DeviceError::WriteRejected {
        address: reference.address.clone(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// InternalSignal
// =============================================================================

/// A signal that callers can read and subscribe to but never write.
///
/// Its owner updates it with [`InternalSignal::put_internal`]; typical uses are
/// values computed in software (a derived state, a summary flag) that must
/// look like any other signal to interlocks and operator panels.
#[derive(Clone, Debug)]
pub struct InternalSignal {
    inner: MemorySignal,
}

impl InternalSignal {
    /// Internal signal holding `initial`.
    pub fn new(address: impl Into<String>, initial: SignalValue) -> Self {
        let reference = SignalRef::read_only(address, initial.kind());
        Self {
            inner: MemorySignal::new(reference, initial),
        }
    }

    /// Update the value from inside the owning component.
    pub fn put_internal(&self, value: impl Into<SignalValue>) {
        self.inner.set(value);
    }
}

#[async_trait]
impl SignalBinding for InternalSignal {
    fn reference(&self) -> &SignalRef {
        self.inner.reference()
    }

    fn read(&self) -> DeviceResult<SignalValue> {
        self.inner.read()
    }

    async fn write(&self, _value: SignalValue) -> DeviceResult<()> {
        Err(read_only_write(
            self.reference(),
            "internal signal can only be set by its owner",
        ))
    }

    fn subscribe(&self, callback: SignalCallback) -> Subscription {
        self.inner.subscribe(callback)
    }
}

// =============================================================================
// NotImplementedSignal
// =============================================================================

/// Value served by [`NotImplementedSignal`].
pub const NOT_IMPLEMENTED: &str = "Not implemented";

/// Placeholder for a channel a device variant does not provide.
///
/// Always reads [`NOT_IMPLEMENTED`] and refuses writes with `Unsupported`, so
/// a device can declare a uniform signal set across hardware variants.
#[derive(Debug, Clone)]
pub struct NotImplementedSignal {
    reference: SignalRef,
}

impl NotImplementedSignal {
    /// Placeholder at `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            reference: SignalRef::read_only(address, SignalKind::Text),
        }
    }
}

#[async_trait]
impl SignalBinding for NotImplementedSignal {
    fn reference(&self) -> &SignalRef {
        &self.reference
    }

    fn read(&self) -> DeviceResult<SignalValue> {
        Ok(SignalValue::Text(NOT_IMPLEMENTED.to_string()))
    }

    async fn write(&self, _value: SignalValue) -> DeviceResult<()> {
        Err(DeviceError::Unsupported(format!(
            "'{}' is not implemented",
            self.reference.address
        )))
    }

    fn subscribe(&self, _callback: SignalCallback) -> Subscription {
        // The value never changes, so there is nothing to deliver.
        Subscription::new(0, |_| {})
    }
}

// =============================================================================
// OptionalSignal
// =============================================================================

/// A channel that may not exist on every installation.
///
/// Until the remote channel has been seen (a successful read or any update),
/// reads, writes and notifications are served by an in-memory fallback value.
/// From then on everything is proxied to the remote binding; the switch is
/// one-way for the lifetime of the signal.
pub struct OptionalSignal {
    inner: Arc<OptionalInner>,
}

struct OptionalInner {
    reference: SignalRef,
    remote: Arc<dyn SignalBinding>,
    fallback: MemorySignal,
    connected: AtomicBool,
    subscribers: Subscribers,
    source_subscriptions: Mutex<Vec<Subscription>>,
}

impl OptionalSignal {
    /// Wrap `remote`, serving `fallback` until it connects.
    pub fn new(remote: Arc<dyn SignalBinding>, fallback: SignalValue) -> Self {
        let reference = remote.reference().clone();
        let local = SignalRef::read_write(reference.address.clone(), fallback.kind());
        let connected = remote.read().is_ok();

        let inner = Arc::new(OptionalInner {
            reference,
            remote: Arc::clone(&remote),
            fallback: MemorySignal::new(local, fallback),
            connected: AtomicBool::new(connected),
            subscribers: Subscribers::default(),
            source_subscriptions: Mutex::new(Vec::with_capacity(2)),
        });

        let weak = Arc::downgrade(&inner);
        let remote_sub = remote.subscribe(Arc::new(move |update: &SignalUpdate| {
            if let Some(inner) = weak.upgrade() {
                inner.mark_connected();
                inner.subscribers.notify(update);
            }
        }));
        let weak = Arc::downgrade(&inner);
        let fallback_sub = inner.fallback.subscribe(Arc::new(move |update: &SignalUpdate| {
            if let Some(inner) = weak.upgrade() {
                if !inner.is_connected() {
                    inner.subscribers.notify(update);
                }
            }
        }));
        inner
            .source_subscriptions
            .lock()
            .extend([remote_sub, fallback_sub]);

        Self { inner }
    }

    /// Whether calls are proxied to the remote channel.
    pub fn uses_remote(&self) -> bool {
        self.inner.is_connected()
    }
}

impl OptionalInner {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            debug!(address = %self.reference.address, "Optional signal connected");
        }
    }
}

#[async_trait]
impl SignalBinding for OptionalSignal {
    fn reference(&self) -> &SignalRef {
        &self.inner.reference
    }

    fn read(&self) -> DeviceResult<SignalValue> {
        let inner = &self.inner;
        if inner.is_connected() {
            return inner.remote.read();
        }
        match inner.remote.read() {
            Ok(value) => {
                inner.mark_connected();
                Ok(value)
            }
            Err(_) => inner.fallback.read(),
        }
    }

    async fn write(&self, value: SignalValue) -> DeviceResult<()> {
        if self.inner.is_connected() {
            self.inner.remote.write(value).await
        } else {
            self.inner.fallback.write(value).await
        }
    }

    fn subscribe(&self, callback: SignalCallback) -> Subscription {
        self.inner.subscribers.add(callback)
    }
}

// =============================================================================
// AggregateSignal
// =============================================================================

/// Computes an aggregate readback from cached source values.
pub type AggregateFn = Arc<dyn Fn(&[Option<SignalValue>]) -> Option<SignalValue> + Send + Sync>;

/// Signal whose readback is computed from several source signals.
///
/// Each source update refreshes one cache slot and re-runs the calculation;
/// subscribers are only notified when the computed value changes, or when the
/// source update carries a fault flag.
pub struct AggregateSignal {
    inner: Arc<AggregateInner>,
}

struct AggregateInner {
    reference: SignalRef,
    calc: AggregateFn,
    state: Mutex<AggregateState>,
    subscribers: Subscribers,
    source_subscriptions: Mutex<Vec<Subscription>>,
}

struct AggregateState {
    cache: Vec<Option<SignalValue>>,
    readback: Option<SignalValue>,
}

impl AggregateSignal {
    /// Combine `sources` through `calc`, recomputed on every source update.
    pub fn new(
        reference: SignalRef,
        sources: &[Arc<dyn SignalBinding>],
        calc: impl Fn(&[Option<SignalValue>]) -> Option<SignalValue> + Send + Sync + 'static,
    ) -> Self {
        let calc: AggregateFn = Arc::new(calc);
        let cache: Vec<Option<SignalValue>> = sources.iter().map(|s| s.read().ok()).collect();
        let readback = calc(&cache);

        let inner = Arc::new(AggregateInner {
            reference: SignalRef {
                read_only: true,
                ..reference
            },
            calc,
            state: Mutex::new(AggregateState { cache, readback }),
            subscribers: Subscribers::default(),
            source_subscriptions: Mutex::new(Vec::with_capacity(sources.len())),
        });

        for (index, source) in sources.iter().enumerate() {
            let weak = Arc::downgrade(&inner);
            let subscription = source.subscribe(Arc::new(move |update: &SignalUpdate| {
                if let Some(inner) = weak.upgrade() {
                    inner.insert(index, update);
                }
            }));
            inner.source_subscriptions.lock().push(subscription);
        }

        Self { inner }
    }
}

impl AggregateInner {
    fn insert(&self, index: usize, update: &SignalUpdate) {
        let changed = {
            let mut state = self.state.lock();
            state.cache[index] = Some(update.value.clone());
            let readback = (self.calc)(&state.cache);
            if update.is_fault {
                // A fault is always forwarded, carrying the source value when
                // nothing can be computed yet.
                state.readback = readback.clone();
                Some(readback.unwrap_or_else(|| update.value.clone()))
            } else if readback != state.readback {
                state.readback = readback.clone();
                readback
            } else {
                None
            }
        };

        if let Some(value) = changed {
            self.subscribers.notify(&SignalUpdate {
                value,
                timestamp: update.timestamp,
                is_fault: update.is_fault,
            });
        }
    }
}

#[async_trait]
impl SignalBinding for AggregateSignal {
    fn reference(&self) -> &SignalRef {
        &self.inner.reference
    }

    fn read(&self) -> DeviceResult<SignalValue> {
        self.inner
            .state
            .lock()
            .readback
            .clone()
            .ok_or_else(|| DeviceError::Unreadable(self.inner.reference.address.clone()))
    }

    async fn write(&self, _value: SignalValue) -> DeviceResult<()> {
        Err(read_only_write(
            &self.inner.reference,
            "aggregate signals are computed",
        ))
    }

    fn subscribe(&self, callback: SignalCallback) -> Subscription {
        self.inner.subscribers.add(callback)
    }
}

// =============================================================================
// AverageSignal
// =============================================================================

/// Rolling mean over the last `averages` numeric updates of a source signal.
pub struct AverageSignal {
    inner: Arc<AverageInner>,
}

struct AverageInner {
    reference: SignalRef,
    state: Mutex<AverageState>,
    subscribers: Subscribers,
    source_subscription: Mutex<Option<Subscription>>,
}

struct AverageState {
    averages: usize,
    samples: VecDeque<f64>,
}

impl AverageState {
    fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }
}

impl AverageSignal {
    /// Running mean over the last `averages` numeric updates of `source`.
    pub fn new(
        address: impl Into<String>,
        source: &dyn SignalBinding,
        averages: usize,
    ) -> DeviceResult<Self> {
        let reference = SignalRef::read_only(address, SignalKind::Numeric);
        validate_averages(&reference, averages)?;

        let mut samples = VecDeque::with_capacity(averages);
        if let Some(value) = source.read().ok().and_then(|v| v.as_f64()) {
            samples.push_back(value);
        }

        let inner = Arc::new(AverageInner {
            reference,
            state: Mutex::new(AverageState { averages, samples }),
            subscribers: Subscribers::default(),
            source_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = source.subscribe(Arc::new(move |update: &SignalUpdate| {
            if let Some(inner) = weak.upgrade() {
                inner.push(update);
            }
        }));
        *inner.source_subscription.lock() = Some(subscription);

        Ok(Self { inner })
    }

    /// Current window size.
    pub fn averages(&self) -> usize {
        self.inner.state.lock().averages
    }

    /// Change the window size. The sample buffer is cleared.
    pub fn set_averages(&self, averages: usize) -> DeviceResult<()> {
        validate_averages(&self.inner.reference, averages)?;
        let mut state = self.inner.state.lock();
        state.averages = averages;
        state.samples = VecDeque::with_capacity(averages);
        Ok(())
    }
}

fn validate_averages(reference: &SignalRef, averages: usize) -> DeviceResult<()> {
    if averages == 0 {
        return Err(read_only_write(reference, "averages must be at least 1"));
    }
    Ok(())
}

impl AverageInner {
    fn push(&self, update: &SignalUpdate) {
        let Some(value) = update.value.as_f64() else {
            return;
        };
        let mean = {
            let mut state = self.state.lock();
            state.samples.push_back(value);
            while state.samples.len() > state.averages {
                state.samples.pop_front();
            }
            state.mean()
        };
        if let Some(mean) = mean {
            self.subscribers.notify(&SignalUpdate {
                value: SignalValue::Numeric(mean),
                timestamp: update.timestamp,
                is_fault: update.is_fault,
            });
        }
    }
}

#[async_trait]
impl SignalBinding for AverageSignal {
    fn reference(&self) -> &SignalRef {
        &self.inner.reference
    }

    fn read(&self) -> DeviceResult<SignalValue> {
        self.inner
            .state
            .lock()
            .mean()
            .map(SignalValue::Numeric)
            .ok_or_else(|| DeviceError::Unreadable(self.inner.reference.address.clone()))
    }

    async fn write(&self, _value: SignalValue) -> DeviceResult<()> {
        Err(read_only_write(&self.inner.reference, "averages are computed"))
    }

    fn subscribe(&self, callback: SignalCallback) -> Subscription {
        self.inner.subscribers.add(callback)
    }
}

// =============================================================================
// UnitConversionSignal
// =============================================================================

/// Presents a numeric source signal in different units, plus a user offset.
///
/// `derived = convert(source, original → derived) + user_offset`; writes apply
/// the inverse before reaching the source.
pub struct UnitConversionSignal {
    inner: Arc<ConversionInner>,
}

struct ConversionInner {
    reference: SignalRef,
    source: Arc<dyn SignalBinding>,
    original_units: String,
    derived_units: String,
    user_offset: RwLock<f64>,
    subscribers: Subscribers,
    source_subscription: Mutex<Option<Subscription>>,
}

impl ConversionInner {
    fn forward(&self, value: f64) -> DeviceResult<f64> {
        let converted = convert_unit(value, &self.original_units, &self.derived_units)?;
        Ok(converted + *self.user_offset.read())
    }

    fn inverse(&self, value: f64) -> DeviceResult<f64> {
        convert_unit(
            value - *self.user_offset.read(),
            &self.derived_units,
            &self.original_units,
        )
    }

    fn derive(&self, value: &SignalValue) -> DeviceResult<SignalValue> {
        let raw = value.as_f64().ok_or_else(|| {
            DeviceError::Unsupported(format!(
                "unit conversion of non-numeric value from '{}'",
                self.source.reference().address
            ))
        })?;
        Ok(SignalValue::Numeric(self.forward(raw)?))
    }

    fn republish(&self, update: &SignalUpdate) {
        if let Ok(value) = self.derive(&update.value) {
            self.subscribers.notify(&SignalUpdate {
                value,
                timestamp: update.timestamp,
                is_fault: update.is_fault,
            });
        }
    }
}

impl UnitConversionSignal {
    /// View `source` in `derived_units`. Both units must be known and compatible.
    pub fn new(
        address: impl Into<String>,
        source: Arc<dyn SignalBinding>,
        original_units: impl Into<String>,
        derived_units: impl Into<String>,
    ) -> DeviceResult<Self> {
        let original_units = original_units.into();
        let derived_units = derived_units.into();
        // Fail at construction for units that can never convert.
        convert_unit(1.0, &original_units, &derived_units)?;

        let reference = SignalRef {
            address: address.into(),
            kind: SignalKind::Numeric,
            read_only: source.reference().read_only,
        };
        let inner = Arc::new(ConversionInner {
            reference,
            source: Arc::clone(&source),
            original_units,
            derived_units,
            user_offset: RwLock::new(0.0),
            subscribers: Subscribers::default(),
            source_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = source.subscribe(Arc::new(move |update: &SignalUpdate| {
            if let Some(inner) = weak.upgrade() {
                inner.republish(update);
            }
        }));
        *inner.source_subscription.lock() = Some(subscription);

        Ok(Self { inner })
    }

    /// Units of the source signal.
    pub fn original_units(&self) -> &str {
        &self.inner.original_units
    }

    /// Units presented to callers.
    pub fn derived_units(&self) -> &str {
        &self.inner.derived_units
    }

    /// Offset added after conversion.
    pub fn user_offset(&self) -> f64 {
        *self.inner.user_offset.read()
    }

    /// Change the user offset and republish the recalculated readback.
    pub fn set_user_offset(&self, offset: f64) {
        *self.inner.user_offset.write() = offset;
        if let Ok(value) = self.inner.source.read() {
            self.inner.republish(&SignalUpdate::now(value));
        }
    }
}

#[async_trait]
impl SignalBinding for UnitConversionSignal {
    fn reference(&self) -> &SignalRef {
        &self.inner.reference
    }

    fn read(&self) -> DeviceResult<SignalValue> {
        let raw = self.inner.source.read()?;
        self.inner.derive(&raw)
    }

    async fn write(&self, value: SignalValue) -> DeviceResult<()> {
        let derived = value.as_f64().ok_or_else(|| {
            read_only_write(&self.inner.reference, "unit conversion requires a numeric value")
        })?;
        let raw = self.inner.inverse(derived)?;
        self.inner.source.write(SignalValue::Numeric(raw)).await
    }

    fn subscribe(&self, callback: SignalCallback) -> Subscription {
        self.inner.subscribers.add(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(address: &str, value: f64) -> MemorySignal {
        MemorySignal::new(
            SignalRef::read_write(address, SignalKind::Numeric),
            SignalValue::Numeric(value),
        )
    }

    fn recorder(signal: &dyn SignalBinding) -> (Arc<Mutex<Vec<SignalUpdate>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let sub = signal.subscribe(Arc::new(move |update: &SignalUpdate| {
            seen_cb.lock().push(update.clone());
        }));
        (seen, sub)
    }

    #[tokio::test]
    async fn test_internal_signal_rejects_external_writes() {
        let signal = InternalSignal::new("TST:STATE", SignalValue::enumerated(0, "OUT"));
        assert!(signal.write(SignalValue::enumerated(1, "IN")).await.is_err());

        signal.put_internal(SignalValue::enumerated(1, "IN"));
        assert_eq!(signal.read().unwrap().as_str(), Some("IN"));
        assert!(signal.reference().read_only);
    }

    #[tokio::test]
    async fn test_not_implemented_signal() {
        let signal = NotImplementedSignal::new("TST:MMS:01:HOMING");
        assert_eq!(signal.read().unwrap().as_str(), Some(NOT_IMPLEMENTED));
        assert!(matches!(
            signal.write(SignalValue::from(true)).await,
            Err(DeviceError::Unsupported(_))
        ));
        let (seen, _sub) = recorder(&signal);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_optional_signal_serves_fallback_until_connected() {
        let remote = MemorySignal::disconnected(SignalRef::read_write(
            "TST:NOTEPAD:GAIN",
            SignalKind::Numeric,
        ));
        let optional = OptionalSignal::new(Arc::new(remote.clone()), SignalValue::Numeric(1.0));
        assert!(!optional.uses_remote());
        assert_eq!(optional.reference().address, "TST:NOTEPAD:GAIN");
        let (seen, _sub) = recorder(&optional);

        optional.write(SignalValue::Numeric(2.0)).await.unwrap();
        assert_eq!(optional.read().unwrap(), SignalValue::Numeric(2.0));
        assert!(remote.writes().is_empty());
        assert_eq!(seen.lock().len(), 1);

        // First value from the channel switches over for good
        remote.set(7.5);
        assert!(optional.uses_remote());
        assert_eq!(optional.read().unwrap(), SignalValue::Numeric(7.5));
        assert_eq!(seen.lock().last().unwrap().value, SignalValue::Numeric(7.5));

        optional.write(SignalValue::Numeric(3.0)).await.unwrap();
        assert_eq!(remote.writes(), vec![SignalValue::Numeric(3.0)]);

        remote.set_unreadable(true);
        assert!(optional.read().is_err());
    }

    #[test]
    fn test_optional_signal_switches_on_successful_read() {
        let remote = numeric("TST:NOTEPAD:OFFSET", 0.25);
        remote.set_unreadable(true);
        let optional = OptionalSignal::new(Arc::new(remote.clone()), SignalValue::Numeric(0.0));
        assert_eq!(optional.read().unwrap(), SignalValue::Numeric(0.0));
        assert!(!optional.uses_remote());

        remote.set_unreadable(false);
        assert_eq!(optional.read().unwrap(), SignalValue::Numeric(0.25));
        assert!(optional.uses_remote());
    }

    #[test]
    fn test_optional_signal_connected_at_start() {
        let remote = numeric("TST:NOTEPAD:MODE", 4.0);
        let optional = OptionalSignal::new(Arc::new(remote), SignalValue::Numeric(0.0));
        assert!(optional.uses_remote());
        assert_eq!(optional.read().unwrap(), SignalValue::Numeric(4.0));
    }

    #[test]
    fn test_aggregate_updates_only_on_change() {
        let a = numeric("TST:A", 1.0);
        let b = numeric("TST:B", 0.0);
        let sources: Vec<Arc<dyn SignalBinding>> = vec![Arc::new(a.clone()), Arc::new(b.clone())];
        // "all closed" summary
        let aggregate = AggregateSignal::new(
            SignalRef::read_only("TST:ALL", SignalKind::Numeric),
            &sources,
            |cache| {
                let all = cache
                    .iter()
                    .all(|v| v.as_ref().and_then(SignalValue::as_bool).unwrap_or(false));
                Some(SignalValue::from(all))
            },
        );
        assert_eq!(aggregate.read().unwrap(), SignalValue::from(false));

        let (seen, _sub) = recorder(&aggregate);
        a.set(1.0); // unchanged aggregate
        assert!(seen.lock().is_empty());

        b.set(1.0);
        assert_eq!(aggregate.read().unwrap(), SignalValue::from(true));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_aggregate_forwards_faults() {
        let a = numeric("TST:A", 1.0);
        let sources: Vec<Arc<dyn SignalBinding>> = vec![Arc::new(a.clone())];
        let aggregate = AggregateSignal::new(
            SignalRef::read_only("TST:SUM", SignalKind::Numeric),
            &sources,
            |cache| cache[0].clone(),
        );
        let (seen, _sub) = recorder(&aggregate);
        a.inject_fault(1.0);
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].is_fault);
    }

    #[test]
    fn test_aggregate_forwards_fault_without_computed_value() {
        let a = numeric("TST:A", 1.0);
        let b = numeric("TST:B", 0.0);
        let sources: Vec<Arc<dyn SignalBinding>> = vec![Arc::new(a.clone()), Arc::new(b)];
        let reference = SignalRef::read_only("TST:RATIO", SignalKind::Numeric);
        let aggregate = AggregateSignal::new(reference, &sources, |_| None);
        let (seen, _sub) = recorder(&aggregate);

        a.set(2.0);
        assert!(seen.lock().is_empty());

        a.inject_fault(3.0);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_fault);
        assert_eq!(seen[0].value, SignalValue::Numeric(3.0));
        assert!(aggregate.read().is_err());
    }

    #[test]
    fn test_aggregate_drop_unsubscribes_sources() {
        let a = numeric("TST:A", 1.0);
        let sources: Vec<Arc<dyn SignalBinding>> = vec![Arc::new(a.clone())];
        let reference = SignalRef::read_only("TST:SUM", SignalKind::Numeric);
        let aggregate = AggregateSignal::new(reference, &sources, |c| c[0].clone());
        assert_eq!(a.subscriber_count(), 1);
        drop(aggregate);
        assert_eq!(a.subscriber_count(), 0);
    }

    #[test]
    fn test_average_window() {
        let source = numeric("TST:I0", 2.0);
        let average = AverageSignal::new("TST:I0:AVG", &source, 3).unwrap();
        assert_eq!(average.read().unwrap(), SignalValue::Numeric(2.0));

        source.set(4.0);
        source.set(6.0);
        assert_eq!(average.read().unwrap(), SignalValue::Numeric(4.0));

        // Window slides: [4, 6, 8]
        source.set(8.0);
        assert_eq!(average.read().unwrap(), SignalValue::Numeric(6.0));
    }

    #[test]
    fn test_average_resize_resets() {
        let source = numeric("TST:I0", 2.0);
        let average = AverageSignal::new("TST:I0:AVG", &source, 3).unwrap();
        average.set_averages(2).unwrap();
        assert!(average.read().is_err());
        assert_eq!(average.averages(), 2);
        assert!(average.set_averages(0).is_err());
        assert!(AverageSignal::new("TST:BAD", &source, 0).is_err());
    }

    #[tokio::test]
    async fn test_unit_conversion_round_trip_with_offset() {
        let motor = numeric("TST:MMS.RBV", 1.5);
        let source: Arc<dyn SignalBinding> = Arc::new(motor.clone());
        let um = UnitConversionSignal::new("TST:MMS:UM", source, "mm", "um").unwrap();

        assert_eq!(um.read().unwrap(), SignalValue::Numeric(1500.0));

        um.set_user_offset(10.0);
        assert_eq!(um.read().unwrap(), SignalValue::Numeric(1510.0));

        um.write(SignalValue::Numeric(2010.0)).await.unwrap();
        assert_eq!(motor.read().unwrap(), SignalValue::Numeric(2.0));
    }

    #[test]
    fn test_unit_conversion_republishes_on_offset_change() {
        let motor = numeric("TST:MMS.RBV", 1.0);
        let source: Arc<dyn SignalBinding> = Arc::new(motor.clone());
        let um = UnitConversionSignal::new("TST:MMS:UM", source, "mm", "um").unwrap();
        let (seen, _sub) = recorder(&um);

        um.set_user_offset(5.0);
        motor.set(2.0);

        let values: Vec<f64> = seen
            .lock()
            .iter()
            .filter_map(|u| u.value.as_f64())
            .collect();
        assert_eq!(values.len(), 2);
        assert!((values[0] - 1005.0).abs() < 1e-9);
        assert!((values[1] - 2005.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_conversion_rejects_incompatible_units() {
        let source: Arc<dyn SignalBinding> = Arc::new(numeric("TST:MMS.RBV", 1.0));
        assert!(UnitConversionSignal::new("TST:BAD", source, "mm", "ms").is_err());
    }
}
