//! Per-device state machine
//!
//! Each device runs as an actor: a single tokio task owns the device state and
//! processes [`Command`]s in arrival order, so requests, signal notifications
//! and timer expiries for one device are totally ordered without locks.
//!
//! ```text
//!   DeviceHandle ──Command──▶ ┌──────────────┐ ──watch──▶ StateRecord
//!   signal callbacks ───────▶ │ MachineActor │
//!   transition deadline ────▶ └──────────────┘ ──▶ Status resolution
//! ```
//!
//! Signal callbacks hold only a weak sender, so the actor stops once every
//! [`DeviceHandle`] has been dropped.
//!
//! # Timeouts
//!
//! The timeout for the in-flight transition is re-armed on every progress
//! notification: it bounds the time without news from the device rather than
//! the total duration of a long move.

use super::capability::{Capability, CapabilitySet};
use super::completion::{CompletionPolicy, MotionContext, MotionEvent};
use super::state::{DeviceState, StateRecord, TransitionKind};
use crate::config::TimeoutConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::interlock::{self, InterlockContext, InterlockRule, InterlockVerdict};
use crate::signal::{SignalBinding, SignalTable, SignalUpdate, SignalValue, Subscription};
use crate::status::{Status, StatusPhase, StatusSnapshot};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const DEFAULT_HISTORY_DEPTH: usize = 16;

/// Static description of a device: its signals, how it completes and which
/// interlocks guard it.
pub struct DeviceSpec {
    name: String,
    signals: SignalTable,
    setpoint: String,
    stop: Option<String>,
    reset: Option<String>,
    completion: Arc<dyn CompletionPolicy>,
    interlocks: Vec<InterlockRule>,
    acknowledge_interlocks: Vec<InterlockRule>,
    capabilities: CapabilitySet,
    timeouts: TimeoutConfig,
    history_depth: usize,
}

impl fmt::Debug for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSpec")
            .field("name", &self.name)
            .field("signals", &self.signals)
            .field("setpoint", &self.setpoint)
            .field("completion", &self.completion)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl DeviceSpec {
    /// Start describing a device named `name`.
    pub fn builder(name: impl Into<String>) -> DeviceSpecBuilder {
        DeviceSpecBuilder {
            name: name.into(),
            signals: Vec::new(),
            setpoint: None,
            stop: None,
            reset: None,
            completion: None,
            interlocks: Vec::new(),
            acknowledge_interlocks: Vec::new(),
            capabilities: CapabilitySet::new(),
            timeouts: TimeoutConfig::default(),
            history_depth: DEFAULT_HISTORY_DEPTH,
        }
    }

    /// Name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder for [`DeviceSpec`]. All names are checked in [`build`](Self::build).
pub struct DeviceSpecBuilder {
    name: String,
    signals: Vec<(String, Arc<dyn SignalBinding>)>,
    setpoint: Option<String>,
    stop: Option<String>,
    reset: Option<String>,
    completion: Option<Arc<dyn CompletionPolicy>>,
    interlocks: Vec<InterlockRule>,
    acknowledge_interlocks: Vec<InterlockRule>,
    capabilities: CapabilitySet,
    timeouts: TimeoutConfig,
    history_depth: usize,
}

impl DeviceSpecBuilder {
    /// Declare a signal under `name`. Names must be unique.
    pub fn signal(mut self, name: impl Into<String>, binding: Arc<dyn SignalBinding>) -> Self {
        self.signals.push((name.into(), binding));
        self
    }

    /// Signal written with the target of every transition.
    pub fn setpoint(mut self, name: impl Into<String>) -> Self {
        self.setpoint = Some(name.into());
        self
    }

    /// Signal written with `1` to stop an in-flight transition.
    pub fn stop(mut self, name: impl Into<String>) -> Self {
        self.stop = Some(name.into());
        self.capabilities.insert(Capability::SupportsCancel);
        self
    }

    /// Signal written with `1` when a fault is acknowledged.
    pub fn reset(mut self, name: impl Into<String>) -> Self {
        self.reset = Some(name.into());
        self.capabilities.insert(Capability::SupportsFaultReset);
        self
    }

    /// How completion is detected for this device.
    pub fn completion(mut self, policy: impl CompletionPolicy + 'static) -> Self {
        self.completion = Some(Arc::new(policy));
        self
    }

    /// Precondition for starting a transition.
    pub fn interlock(mut self, rule: InterlockRule) -> Self {
        self.interlocks.push(rule);
        self
    }

    /// Precondition for acknowledging a fault.
    pub fn acknowledge_interlock(mut self, rule: InterlockRule) -> Self {
        self.acknowledge_interlocks.push(rule);
        self
    }

    /// Declare a capability tag.
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Override the default timeouts.
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Number of resolved statuses kept for diagnostics.
    pub fn history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }

    /// Validate the description.
    pub fn build(self) -> DeviceResult<DeviceSpec> {
        let mut signals = SignalTable::new();
        for (name, binding) in self.signals {
            signals.insert(name, binding)?;
        }

        let undeclared = |name: &str| {
            DeviceError::NotFound(format!("signal '{}' on device '{}'", name, self.name))
        };

        let setpoint = self.setpoint.ok_or_else(|| {
            DeviceError::Unsupported(format!("device '{}' declares no setpoint", self.name))
        })?;
        let binding = signals.get(&setpoint).ok_or_else(|| undeclared(&setpoint))?;
        if binding.reference().read_only {
            return Err(DeviceError::Unsupported(format!(
                "setpoint '{}' of device '{}' is read-only",
                setpoint, self.name
            )));
        }

        let completion = self.completion.ok_or_else(|| {
            DeviceError::Unsupported(format!("device '{}' has no completion policy", self.name))
        })?;
        let referenced = completion
            .signals()
            .into_iter()
            .chain(self.stop.as_deref())
            .chain(self.reset.as_deref());
        for name in referenced {
            if !signals.contains(name) {
                return Err(undeclared(name));
            }
        }

        if self.capabilities.contains(Capability::SupportsCancel) && self.stop.is_none() {
            return Err(DeviceError::Unsupported(format!(
                "device '{}' supports cancel but declares no stop signal",
                self.name
            )));
        }

        Ok(DeviceSpec {
            name: self.name,
            signals,
            setpoint,
            stop: self.stop,
            reset: self.reset,
            completion,
            interlocks: self.interlocks,
            acknowledge_interlocks: self.acknowledge_interlocks,
            capabilities: self.capabilities,
            timeouts: self.timeouts,
            history_depth: self.history_depth.max(1),
        })
    }
}

/// Messages processed by the device actor.
enum Command {
    Request {
        kind: TransitionKind,
        target: SignalValue,
        response: oneshot::Sender<DeviceResult<Status>>,
    },
    Cancel {
        response: oneshot::Sender<DeviceResult<Status>>,
    },
    Acknowledge {
        response: oneshot::Sender<Status>,
    },
    Disable {
        response: oneshot::Sender<DeviceResult<DeviceState>>,
    },
    Enable {
        response: oneshot::Sender<DeviceResult<DeviceState>>,
    },
    Refresh {
        response: oneshot::Sender<DeviceState>,
    },
    Signal {
        name: Arc<str>,
        update: SignalUpdate,
    },
    /// The in-flight Status was resolved outside the actor (e.g. by a
    /// caller's `wait` timing out).
    StatusResolved {
        id: Uuid,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running device state machine.
#[derive(Clone)]
pub struct DeviceHandle {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<StateRecord>,
    history: Arc<Mutex<VecDeque<Status>>>,
    signals: SignalTable,
    capabilities: CapabilitySet,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceHandle {
    /// Start the actor for `spec` on the current tokio runtime.
    pub fn spawn(spec: DeviceSpec) -> DeviceResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            DeviceError::Unsupported(format!(
                "device '{}' must be spawned inside a tokio runtime",
                spec.name
            ))
        })?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(StateRecord::initial());
        let history = Arc::new(Mutex::new(VecDeque::with_capacity(spec.history_depth)));

        let weak = commands.downgrade();
        let subscriptions = spec
            .signals
            .iter()
            .map(|(name, binding)| {
                let name: Arc<str> = Arc::from(name);
                let weak = weak.clone();
                binding.subscribe(Arc::new(move |update: &SignalUpdate| {
                    if let Some(commands) = weak.upgrade() {
                        let _ = commands.send(Command::Signal {
                            name: Arc::clone(&name),
                            update: update.clone(),
                        });
                    }
                }))
            })
            .collect();

        let handle = Self {
            name: Arc::from(spec.name.as_str()),
            commands,
            state,
            history: Arc::clone(&history),
            signals: spec.signals.clone(),
            capabilities: spec.capabilities.clone(),
        };

        let actor = MachineActor {
            name: spec.name,
            signals: spec.signals,
            setpoint: spec.setpoint,
            stop: spec.stop,
            reset: spec.reset,
            completion: spec.completion,
            interlocks: spec.interlocks,
            acknowledge_interlocks: spec.acknowledge_interlocks,
            capabilities: spec.capabilities,
            timeouts: spec.timeouts,
            history_depth: spec.history_depth,
            history,
            record: StateRecord::initial(),
            state_tx,
            commands: weak,
            in_flight: None,
            _subscriptions: subscriptions,
        };
        runtime.spawn(actor.run(receiver));
        Ok(handle)
    }

    /// Name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals declared by the device.
    pub fn signals(&self) -> &SignalTable {
        &self.signals
    }

    /// Declared capability tags.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Current state from the watch channel.
    pub fn state(&self) -> DeviceState {
        self.state.borrow().state
    }

    /// Current state together with the fault and last denial.
    pub fn record(&self) -> StateRecord {
        self.state.borrow().clone()
    }

    /// Receiver that observes every published state change.
    pub fn subscribe(&self) -> watch::Receiver<StateRecord> {
        self.state.clone()
    }

    /// Wait until the device reaches `state`.
    pub async fn wait_for_state(&self, state: DeviceState, timeout: Duration) -> DeviceResult<()> {
        let mut receiver = self.state.clone();
        let reached = tokio::time::timeout(timeout, async {
            receiver.wait_for(|record| record.state == state).await.map(|_| ())
        })
        .await
        .map_err(|_| DeviceError::Timeout(format!("{} reaching {}", self.name, state)))?;
        reached.map_err(|_| self.shut_down())
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> Vec<Status> {
        self.history.lock().iter().cloned().collect()
    }

    /// Snapshots of the recently resolved statuses, oldest first.
    pub fn history_snapshots(&self) -> Vec<StatusSnapshot> {
        self.history.lock().iter().map(Status::snapshot).collect()
    }

    /// The most recent Status if it is still pending.
    pub fn current_status(&self) -> Option<Status> {
        self.history.lock().back().filter(|s| !s.is_done()).cloned()
    }

    /// Request a move to `target`.
    pub async fn request_transition(&self, target: impl Into<SignalValue>) -> DeviceResult<Status> {
        self.request(TransitionKind::Move, target).await
    }

    /// Request a transition of `kind` to `target`.
    ///
    /// Fails with `Busy` while another transition is in flight. Every other
    /// refusal (interlock denial, wrong state, rejected write) is reported
    /// through an already-failed Status.
    pub async fn request(
        &self,
        kind: TransitionKind,
        target: impl Into<SignalValue>,
    ) -> DeviceResult<Status> {
        let target = target.into();
        self.call(|response| Command::Request {
            kind,
            target,
            response,
        })
        .await?
    }

    /// Stop the in-flight transition; its Status resolves as cancelled.
    pub async fn cancel(&self) -> DeviceResult<Status> {
        self.call(|response| Command::Cancel { response }).await?
    }

    /// Clear a fault once the hardware no longer reports it.
    pub async fn acknowledge_fault(&self) -> DeviceResult<Status> {
        self.call(|response| Command::Acknowledge { response }).await
    }

    /// Refuse further requests until re-enabled.
    pub async fn disable(&self) -> DeviceResult<DeviceState> {
        self.call(|response| Command::Disable { response }).await?
    }

    /// Accept requests again.
    pub async fn enable(&self) -> DeviceResult<DeviceState> {
        self.call(|response| Command::Enable { response }).await?
    }

    /// Re-read the device's signals; leaves `unknown` once all are readable.
    pub async fn refresh(&self) -> DeviceResult<DeviceState> {
        self.call(|response| Command::Refresh { response }).await
    }

    /// Stop the actor. An in-flight transition resolves as failed.
    pub async fn shutdown(&self) -> DeviceResult<()> {
        self.call(|response| Command::Shutdown { response }).await
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> DeviceResult<T> {
        let (response, receiver) = oneshot::channel();
        self.commands
            .send(command(response))
            .map_err(|_| self.shut_down())?;
        receiver.await.map_err(|_| self.shut_down())
    }

    fn shut_down(&self) -> DeviceError {
        DeviceError::Shutdown(self.name.to_string())
    }
}

struct InFlight {
    status: Status,
    kind: TransitionKind,
    target: SignalValue,
    start: Option<f64>,
    started: bool,
    timeout: Duration,
    deadline: Instant,
    cancel_deadline: Option<Instant>,
}

impl InFlight {
    fn deadline(&self) -> Instant {
        self.cancel_deadline.unwrap_or(self.deadline)
    }
}

struct MachineActor {
    name: String,
    signals: SignalTable,
    setpoint: String,
    stop: Option<String>,
    reset: Option<String>,
    completion: Arc<dyn CompletionPolicy>,
    interlocks: Vec<InterlockRule>,
    acknowledge_interlocks: Vec<InterlockRule>,
    capabilities: CapabilitySet,
    timeouts: TimeoutConfig,
    history_depth: usize,
    history: Arc<Mutex<VecDeque<Status>>>,
    record: StateRecord,
    state_tx: watch::Sender<StateRecord>,
    commands: mpsc::WeakUnboundedSender<Command>,
    in_flight: Option<InFlight>,
    _subscriptions: Vec<Subscription>,
}

impl MachineActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(device = %self.name, "Device state machine started");
        self.try_leave_unknown();

        loop {
            let deadline = self.in_flight.as_ref().map(InFlight::deadline);
            let command = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline();
                    continue;
                }
            };

            match command {
                Command::Request {
                    kind,
                    target,
                    response,
                } => {
                    let result = self.request(kind, target).await;
                    let _ = response.send(result);
                }
                Command::Cancel { response } => {
                    let result = self.cancel().await;
                    let _ = response.send(result);
                }
                Command::Acknowledge { response } => {
                    let status = self.acknowledge().await;
                    let _ = response.send(status);
                }
                Command::Disable { response } => {
                    let _ = response.send(self.disable());
                }
                Command::Enable { response } => {
                    let _ = response.send(self.enable());
                }
                Command::Refresh { response } => {
                    self.try_leave_unknown();
                    let _ = response.send(self.record.state);
                }
                Command::Signal { name, update } => self.on_signal(&name, update),
                Command::StatusResolved { id } => self.on_status_resolved(id),
                Command::Shutdown { response } => {
                    self.abandon_in_flight();
                    let _ = response.send(());
                    break;
                }
            }
        }

        self.abandon_in_flight();
        info!(device = %self.name, "Device state machine stopped");
    }

    // =========================================================================
    // Requests
    // =========================================================================

    async fn request(&mut self, kind: TransitionKind, target: SignalValue) -> DeviceResult<Status> {
        let description = format!("{} {} to {}", self.name, kind, target);
        match self.record.state {
            DeviceState::Idle => {}
            DeviceState::Moving => return Err(DeviceError::Busy),
            other => {
                let reason = DeviceError::InvalidTransition {
                    from: other,
                    action: format!("start a {}", kind),
                };
                debug!(device = %self.name, reason = %reason, "Transition refused");
                return Ok(self.remember(Status::failed(description, reason)));
            }
        }

        let context = InterlockContext::new(&self.signals).with_target(&target);
        if let InterlockVerdict::Denied { rule, reason } =
            interlock::evaluate(&self.interlocks, &context)
        {
            warn!(device = %self.name, rule = %rule, reason = %reason, "Transition denied");
            self.record.last_denial = Some(reason.to_string());
            self.publish();
            return Ok(self.remember(Status::failed(description, reason)));
        }

        let setpoint = self
            .signals
            .get(&self.setpoint)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(format!("signal '{}'", self.setpoint)))?;
        let start = self.completion.start_position(&self.signals);
        let status = self.remember(Status::new(description));

        if let Err(err) = setpoint.write(target.clone()).await {
            warn!(device = %self.name, error = %err, "Setpoint write failed");
            self.settle(status.resolve_failure(err));
            return Ok(status);
        }

        let timeout = self.timeouts.for_kind(kind);
        self.in_flight = Some(InFlight {
            status: status.clone(),
            kind,
            target,
            start,
            started: false,
            timeout,
            deadline: Instant::now() + timeout,
            cancel_deadline: None,
        });
        self.record.last_denial = None;
        self.set_state(DeviceState::Moving);

        let commands = self.commands.clone();
        let id = status.id();
        status.register_callback(move |_| {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::StatusResolved { id });
            }
        });
        Ok(status)
    }

    async fn cancel(&mut self) -> DeviceResult<Status> {
        if !self.capabilities.contains(Capability::SupportsCancel) {
            return Err(DeviceError::Unsupported(format!(
                "device '{}' cannot cancel",
                self.name
            )));
        }
        let Some(flight) = self.in_flight.as_ref() else {
            return Err(DeviceError::InvalidTransition {
                from: self.record.state,
                action: "cancel".to_string(),
            });
        };
        let status = flight.status.clone();
        if flight.cancel_deadline.is_some() {
            return Ok(status);
        }

        let stop = self
            .stop
            .as_ref()
            .and_then(|name| self.signals.get(name))
            .cloned()
            .ok_or_else(|| {
                DeviceError::Unsupported(format!("device '{}' has no stop signal", self.name))
            })?;
        stop.write(SignalValue::from(true)).await?;

        if let Some(flight) = self.in_flight.as_mut() {
            flight.cancel_deadline = Some(Instant::now() + self.timeouts.cancel_grace);
        }
        info!(device = %self.name, status_id = %status.id(), "Stop requested");
        Ok(status)
    }

    async fn acknowledge(&mut self) -> Status {
        let description = format!("{} acknowledge fault", self.name);
        if self.record.state != DeviceState::Faulted {
            let reason = DeviceError::InvalidTransition {
                from: self.record.state,
                action: "acknowledge a fault".to_string(),
            };
            return self.remember(Status::failed(description, reason));
        }

        let context = InterlockContext::new(&self.signals);
        if let InterlockVerdict::Denied { rule, reason } =
            interlock::evaluate(&self.acknowledge_interlocks, &context)
        {
            warn!(device = %self.name, rule = %rule, reason = %reason, "Acknowledgement denied");
            self.record.last_denial = Some(reason.to_string());
            self.publish();
            return self.remember(Status::failed(description, reason));
        }

        if self.capabilities.contains(Capability::SupportsFaultReset) {
            let reset = self.reset.as_ref().and_then(|name| self.signals.get(name)).cloned();
            if let Some(reset) = reset {
                if let Err(err) = reset.write(SignalValue::from(true)).await {
                    warn!(device = %self.name, error = %err, "Fault reset write failed");
                    return self.remember(Status::failed(description, err));
                }
            }
        }

        info!(device = %self.name, fault = ?self.record.fault, "Fault acknowledged");
        self.record.fault = None;
        self.record.last_denial = None;
        self.set_state(DeviceState::Idle);
        self.remember(Status::succeeded(description))
    }

    fn disable(&mut self) -> DeviceResult<DeviceState> {
        match self.record.state {
            DeviceState::Idle | DeviceState::Faulted => {
                self.set_state(DeviceState::Disabled);
                Ok(DeviceState::Disabled)
            }
            DeviceState::Disabled => Ok(DeviceState::Disabled),
            other => Err(DeviceError::InvalidTransition {
                from: other,
                action: "disable".to_string(),
            }),
        }
    }

    /// An unacknowledged fault survives disable/enable.
    fn enable(&mut self) -> DeviceResult<DeviceState> {
        match self.record.state {
            DeviceState::Disabled => {
                let next = if self.record.fault.is_some() {
                    DeviceState::Faulted
                } else {
                    DeviceState::Idle
                };
                self.set_state(next);
                Ok(next)
            }
            other => Err(DeviceError::InvalidTransition {
                from: other,
                action: "enable".to_string(),
            }),
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn on_signal(&mut self, name: &str, update: SignalUpdate) {
        if update.is_fault {
            self.on_fault(name, &update);
            return;
        }
        if self.record.state == DeviceState::Unknown {
            self.try_leave_unknown();
        }

        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };
        let event = {
            let context = MotionContext {
                target: &flight.target,
                start: flight.start,
                started: flight.started,
                cancelling: flight.cancel_deadline.is_some(),
            };
            self.completion.classify(name, &context, &update)
        };

        match event {
            MotionEvent::Ignore => {}
            MotionEvent::Progress(fraction) => {
                flight.started = true;
                if flight.cancel_deadline.is_none() {
                    flight.deadline = Instant::now() + flight.timeout;
                }
                if let Some(fraction) = fraction {
                    let _ = flight.status.set_progress(fraction);
                }
                trace!(device = %self.name, signal = name, progress = ?fraction, "Progress");
            }
            MotionEvent::Complete => {
                if let Some(flight) = self.in_flight.take() {
                    if flight.cancel_deadline.is_some() {
                        info!(device = %self.name, "Stop confirmed");
                        self.settle(flight.status.resolve_cancelled());
                    } else {
                        info!(device = %self.name, kind = %flight.kind, "Transition complete");
                        self.settle(flight.status.resolve_success());
                    }
                    self.set_state(DeviceState::Idle);
                }
            }
            MotionEvent::Error(message) => {
                if let Some(flight) = self.in_flight.take() {
                    error!(device = %self.name, signal = name, %message, "Motion error");
                    self.settle(
                        flight
                            .status
                            .resolve_failure(DeviceError::MotionError(message.clone())),
                    );
                    self.record.fault = Some(message);
                    self.set_state(DeviceState::Faulted);
                }
            }
        }
    }

    /// Faults win over everything, including a cancel awaiting confirmation.
    fn on_fault(&mut self, name: &str, update: &SignalUpdate) {
        let address = self
            .signals
            .get(name)
            .map(|binding| binding.reference().address.clone())
            .unwrap_or_else(|| name.to_string());
        let message = format!("{} reported fault (value {})", address, update.value);
        error!(device = %self.name, signal = name, %message, "Asynchronous fault");

        if let Some(flight) = self.in_flight.take() {
            self.settle(
                flight
                    .status
                    .resolve_failure(DeviceError::AsynchronousFault(message.clone())),
            );
        }
        self.record.fault = Some(message);
        if self.record.state == DeviceState::Faulted {
            self.publish();
        } else {
            self.set_state(DeviceState::Faulted);
        }
    }

    fn on_deadline(&mut self) {
        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|flight| flight.deadline() <= Instant::now());
        if !expired {
            return;
        }
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        if flight.cancel_deadline.is_some() {
            warn!(
                device = %self.name,
                grace = ?self.timeouts.cancel_grace,
                "Stop not confirmed; resolving as cancelled"
            );
            self.settle(flight.status.resolve_cancelled());
            self.set_state(DeviceState::Idle);
        } else {
            warn!(device = %self.name, timeout = ?flight.timeout, "Transition timed out");
            self.settle(flight.status.resolve_timeout());
            self.fault_timed_out(&flight);
        }
    }

    /// Reconcile device state with a Status resolved by someone else.
    ///
    /// Resolutions made by the actor itself take `in_flight` first, so their
    /// notifications find no match and are ignored.
    fn on_status_resolved(&mut self, id: Uuid) {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|flight| flight.status.id() == id && flight.status.is_done());
        if !matches {
            return;
        }
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        let phase = flight.status.phase();
        warn!(device = %self.name, phase = %phase, "In-flight status resolved externally");
        match phase {
            StatusPhase::TimedOut => self.fault_timed_out(&flight),
            StatusPhase::Failure => {
                self.record.fault = Some(
                    flight
                        .status
                        .reason()
                        .map(|reason| reason.to_string())
                        .unwrap_or_else(|| format!("{} failed", flight.status.description())),
                );
                self.set_state(DeviceState::Faulted);
            }
            StatusPhase::Success | StatusPhase::Cancelled | StatusPhase::Pending => {
                self.set_state(DeviceState::Idle)
            }
        }
    }

    fn fault_timed_out(&mut self, flight: &InFlight) {
        self.record.fault = Some(format!(
            "{} timed out after {:?}",
            flight.status.description(),
            flight.timeout
        ));
        self.set_state(DeviceState::Faulted);
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn try_leave_unknown(&mut self) {
        if self.record.state != DeviceState::Unknown {
            return;
        }
        let unreadable = self
            .signals
            .iter()
            .find_map(|(name, binding)| binding.read().err().map(|err| (name.to_string(), err)));
        match unreadable {
            None => self.set_state(DeviceState::Idle),
            Some((signal, err)) => {
                debug!(device = %self.name, signal = %signal, error = %err, "State still unknown")
            }
        }
    }

    fn abandon_in_flight(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            self.settle(
                flight
                    .status
                    .resolve_failure(DeviceError::Shutdown(self.name.clone())),
            );
        }
    }

    fn set_state(&mut self, next: DeviceState) {
        let previous = self.record.state;
        self.record.state = next;
        self.record.since = Utc::now();
        info!(device = %self.name, from = %previous, to = %next, "State transition");
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.record.clone());
    }

    fn remember(&self, status: Status) -> Status {
        let mut history = self.history.lock();
        history.push_back(status.clone());
        while history.len() > self.history_depth {
            history.pop_front();
        }
        status
    }

    /// A caller's own wait may already have resolved the Status.
    fn settle(&self, result: DeviceResult<()>) {
        if let Err(err) = result {
            debug!(device = %self.name, error = %err, "Status already resolved elsewhere");
        }
    }
}
