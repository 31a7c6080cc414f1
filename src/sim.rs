//! Simulated devices
//!
//! Provides simulated beamline hardware wired onto [`MemorySignal`]s so the
//! full engine can run without a control system. All motion uses
//! `tokio::time::sleep`, so tests can drive it with paused time.
//!
//! # Available Simulations
//!
//! - [`SimulatedPositioner`] - motor record style axis (`.VAL`, `.RBV`,
//!   `.DMOV`, `.STOP`) ramping at a fixed speed
//! - [`SimulatedShutter`] - two-state actuator with a permit interlock
//!
//! [`build_beamline`] assembles both from [`EngineConfig`] device
//! definitions into a [`DeviceRegistry`].

use crate::config::{DeviceDefinition, DeviceKind, EngineConfig};
use crate::device::{
    Capability, DeviceHandle, DeviceNode, DeviceSpec, ReadbackMatches, TransitionKind,
};
use crate::error::{DeviceError, DeviceResult};
use crate::interlock::InterlockRule;
use crate::registry::{DeviceMetadata, DeviceRegistry, RegistryBuilder};
use crate::signal::{MemorySignal, SignalBinding, SignalKind, SignalRef, SignalValue};
use crate::status::Status;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Interval between simulated readback updates.
pub const MOTION_STEP: Duration = Duration::from_millis(100);

/// Time a simulated shutter takes to change state.
pub const SHUTTER_TRAVEL: Duration = Duration::from_millis(500);

/// Shutter positions as published on the enumerated state signal.
pub const SHUTTER_CLOSED: u16 = 0;
/// Enumeration index of the open shutter position.
pub const SHUTTER_OPEN: u16 = 1;

/// Parse an operator shutter command ("open", "close", "closed").
pub fn shutter_position(command: &str) -> DeviceResult<SignalValue> {
    match command.to_ascii_lowercase().as_str() {
        "open" => Ok(SignalValue::enumerated(SHUTTER_OPEN, "OPEN")),
        "close" | "closed" => Ok(SignalValue::enumerated(SHUTTER_CLOSED, "CLOSED")),
        other => Err(DeviceError::Unsupported(format!(
            "unknown shutter command '{}'",
            other
        ))),
    }
}

#[derive(Default)]
struct MotionState {
    task: Option<JoinHandle<()>>,
    stalled: bool,
}

impl MotionState {
    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn spawn_motion(
    motion: &Arc<Mutex<MotionState>>,
    task: impl std::future::Future<Output = ()> + Send + 'static,
) -> bool {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("Simulated motion requested outside a tokio runtime");
        return false;
    };
    let mut state = motion.lock();
    state.abort();
    state.task = Some(runtime.spawn(task));
    true
}

// =============================================================================
// SimulatedPositioner
// =============================================================================

/// Simulated motor axis
///
/// Writing the setpoint drops `done`, ramps `readback` towards the target at
/// `speed` units per second and raises `done` on arrival. Writing `stop`
/// halts the ramp where it is.
#[derive(Clone)]
pub struct SimulatedPositioner {
    /// Commanded position (`.VAL`)
    pub setpoint: MemorySignal,
    /// Current position (`.RBV`)
    pub readback: MemorySignal,
    /// Motion complete flag (`.DMOV`)
    pub done: MemorySignal,
    /// Stop command (`.STOP`)
    pub stop: MemorySignal,
    /// Amplifier fault flag
    pub amp_fault: MemorySignal,
    /// Fault reset command
    pub reset: MemorySignal,
    speed: f64,
    motion: Arc<Mutex<MotionState>>,
}

impl SimulatedPositioner {
    /// Axis under `prefix` ramping at `speed` units per second.
    pub fn new(prefix: &str, speed: f64) -> DeviceResult<Self> {
        let positioner = Self {
            setpoint: MemorySignal::new(
                SignalRef::read_write(format!("{}.VAL", prefix), SignalKind::Numeric),
                SignalValue::Numeric(0.0),
            ),
            readback: MemorySignal::new(
                SignalRef::read_only(format!("{}.RBV", prefix), SignalKind::Numeric),
                SignalValue::Numeric(0.0),
            ),
            done: MemorySignal::new(
                SignalRef::read_only(format!("{}.DMOV", prefix), SignalKind::Numeric),
                SignalValue::from(true),
            ),
            stop: MemorySignal::new(
                SignalRef::read_write(format!("{}.STOP", prefix), SignalKind::Numeric),
                SignalValue::from(false),
            ),
            amp_fault: MemorySignal::new(
                SignalRef::from_io(&format!("{}:PLC:AMPFLT", prefix), "i", SignalKind::Numeric)?,
                SignalValue::from(false),
            ),
            reset: MemorySignal::new(
                SignalRef::from_io(&format!("{}:PLC:RESET", prefix), "io", SignalKind::Numeric)?,
                SignalValue::from(false),
            ),
            speed,
            motion: Arc::new(Mutex::new(MotionState::default())),
        };
        positioner.install_hooks();
        Ok(positioner)
    }

    fn install_hooks(&self) {
        let sim = self.clone();
        self.setpoint.on_write(Arc::new(move |value| {
            if let Some(target) = value.as_f64() {
                sim.start_motion(target);
            }
        }));

        let sim = self.clone();
        self.stop.on_write(Arc::new(move |value| {
            if value.as_bool() == Some(true) {
                sim.motion.lock().abort();
                debug!(address = %sim.readback.reference().address, "Simulated stop");
                sim.done.set(true);
            }
        }));
    }

    fn start_motion(&self, target: f64) {
        self.done.set(false);
        let sim = self.clone();
        let step_size = self.speed * MOTION_STEP.as_secs_f64();
        let started = spawn_motion(&self.motion, async move {
            loop {
                sleep(MOTION_STEP).await;
                if sim.motion.lock().stalled {
                    continue;
                }
                let current = sim.position();
                let remaining = target - current;
                if remaining.abs() <= step_size {
                    sim.readback.set(target);
                    break;
                }
                sim.readback.set(current + step_size.copysign(remaining));
            }
            sim.done.set(true);
        });
        if !started {
            self.readback.set(target);
            self.done.set(true);
        }
    }

    /// Current readback, zero if unreadable.
    pub fn position(&self) -> f64 {
        self.readback
            .read()
            .ok()
            .and_then(|value| value.as_f64())
            .unwrap_or_default()
    }

    /// Freeze the axis: it stays "moving" but makes no progress.
    pub fn set_stalled(&self, stalled: bool) {
        self.motion.lock().stalled = stalled;
    }

    /// Raise the amplifier fault.
    pub fn trip_fault(&self) {
        self.motion.lock().abort();
        self.amp_fault.inject_fault(true);
    }

    /// Clear the amplifier fault.
    pub fn clear_fault(&self) {
        self.amp_fault.set(false);
    }

    /// Device description for the state machine.
    pub fn spec(
        &self,
        name: &str,
        definition: &DeviceDefinition,
        config: &EngineConfig,
    ) -> DeviceResult<DeviceSpec> {
        let completion =
            ReadbackMatches::new("readback", definition.tolerance).with_done_signal("done");
        let mut builder = DeviceSpec::builder(name)
            .signal("setpoint", Arc::new(self.setpoint.clone()))
            .signal("readback", Arc::new(self.readback.clone()))
            .signal("done", Arc::new(self.done.clone()))
            .signal("stop", Arc::new(self.stop.clone()))
            .signal("amp_fault", Arc::new(self.amp_fault.clone()))
            .signal("reset", Arc::new(self.reset.clone()))
            .setpoint("setpoint")
            .reset("reset")
            .completion(completion)
            .capability(Capability::SupportsPositionFeedback)
            .interlock(InterlockRule::signal_false(
                "amplifier ok",
                "amp_fault",
                "amplifier fault active",
            ))
            .acknowledge_interlock(InterlockRule::signal_false(
                "fault cleared",
                "amp_fault",
                "amplifier fault still active",
            ))
            .timeouts(config.timeouts)
            .history_depth(config.status.history_depth);

        if definition.supports_cancel {
            builder = builder.stop("stop");
        }
        if definition.low_limit.is_some() || definition.high_limit.is_some() {
            builder = builder.interlock(InterlockRule::target_within(
                "limit ok",
                "readback",
                definition.low_limit.unwrap_or(f64::NEG_INFINITY),
                definition.high_limit.unwrap_or(f64::INFINITY),
                "target outside travel limits",
            ));
        }
        builder.build()
    }
}

// =============================================================================
// SimulatedShutter
// =============================================================================

/// Simulated two-state shutter
///
/// Writing `command` moves `state` to the commanded position after
/// [`SHUTTER_TRAVEL`]. Opening requires `permit` to be set.
#[derive(Clone)]
pub struct SimulatedShutter {
    /// Commanded position
    pub command: MemorySignal,
    /// Reported blade position
    pub state: MemorySignal,
    /// Beam permit; opening is refused while false
    pub permit: MemorySignal,
    motion: Arc<Mutex<MotionState>>,
}

impl SimulatedShutter {
    /// Closed shutter under `prefix`.
    pub fn new(prefix: &str) -> Self {
        let closed = SignalValue::enumerated(SHUTTER_CLOSED, "CLOSED");
        let shutter = Self {
            command: MemorySignal::new(
                SignalRef::read_write(format!("{}:CMD", prefix), SignalKind::Enumerated),
                closed.clone(),
            ),
            state: MemorySignal::new(
                SignalRef::read_only(format!("{}:STATE", prefix), SignalKind::Enumerated),
                closed,
            ),
            permit: MemorySignal::new(
                SignalRef::read_only(format!("{}:PERMIT", prefix), SignalKind::Numeric),
                SignalValue::from(true),
            ),
            motion: Arc::new(Mutex::new(MotionState::default())),
        };

        let sim = shutter.clone();
        shutter.command.on_write(Arc::new(move |value| {
            let target = value.clone();
            let state = sim.state.clone();
            let motion = Arc::clone(&sim.motion);
            let started = spawn_motion(&sim.motion, async move {
                sleep(SHUTTER_TRAVEL).await;
                if !motion.lock().stalled {
                    state.set(target);
                }
            });
            if !started {
                sim.state.set(value.clone());
            }
        }));
        shutter
    }

    /// Whether the blade reports open.
    pub fn is_open(&self) -> bool {
        self.state
            .read()
            .ok()
            .and_then(|value| value.as_f64())
            .is_some_and(|index| index == f64::from(SHUTTER_OPEN))
    }

    /// Drive the beam permit signal.
    pub fn set_permit(&self, permitted: bool) {
        self.permit.set(permitted);
    }

    /// Jam the blade: commands are accepted but the state never changes.
    pub fn set_stalled(&self, stalled: bool) {
        self.motion.lock().stalled = stalled;
    }

    /// Device description for the state machine.
    pub fn spec(&self, name: &str, config: &EngineConfig) -> DeviceResult<DeviceSpec> {
        DeviceSpec::builder(name)
            .signal("command", Arc::new(self.command.clone()))
            .signal("state", Arc::new(self.state.clone()))
            .signal("permit", Arc::new(self.permit.clone()))
            .setpoint("command")
            .completion(ReadbackMatches::new("state", 0.0))
            .interlock(InterlockRule::new(
                "permit",
                "shutter permit not granted",
                |ctx| {
                    let closing = ctx
                        .target()
                        .and_then(SignalValue::as_f64)
                        .is_some_and(|index| index == f64::from(SHUTTER_CLOSED));
                    if closing {
                        return Ok(true);
                    }
                    ctx.read_bool("permit")
                },
            ))
            .timeouts(config.timeouts)
            .history_depth(config.status.history_depth)
            .build()
    }
}

// =============================================================================
// Beamline assembly
// =============================================================================

/// Test and operator controls for one simulated device.
#[derive(Clone)]
pub enum SimControls {
    /// Ramping motor axis
    Positioner(SimulatedPositioner),
    /// Two-state shutter
    Shutter(SimulatedShutter),
}

impl SimControls {
    /// Transition kind used when commanding this device.
    pub fn transition_kind(&self) -> TransitionKind {
        match self {
            SimControls::Positioner(_) => TransitionKind::Move,
            SimControls::Shutter(_) => TransitionKind::Actuate,
        }
    }
}

/// A registry of simulated devices plus the handles to drive their hardware.
pub struct SimBeamline {
    /// Registry of the simulated device trees
    pub registry: DeviceRegistry,
    controls: BTreeMap<String, SimControls>,
}

impl SimBeamline {
    /// Controls for the device at `path` (e.g. `"slits.top"`).
    pub fn controls(&self, path: &str) -> Option<&SimControls> {
        self.controls.get(path)
    }

    /// Positioner controls at `path`.
    pub fn positioner(&self, path: &str) -> DeviceResult<&SimulatedPositioner> {
        match self.controls.get(path) {
            Some(SimControls::Positioner(positioner)) => Ok(positioner),
            _ => Err(DeviceError::NotFound(format!("positioner '{}'", path))),
        }
    }

    /// Shutter controls at `path`.
    pub fn shutter(&self, path: &str) -> DeviceResult<&SimulatedShutter> {
        match self.controls.get(path) {
            Some(SimControls::Shutter(shutter)) => Ok(shutter),
            _ => Err(DeviceError::NotFound(format!("shutter '{}'", path))),
        }
    }

    /// The state machine of the device at `path`.
    pub fn device(&self, path: &str) -> DeviceResult<&DeviceHandle> {
        self.registry
            .require(path)?
            .machine()
            .ok_or_else(|| DeviceError::Unsupported(format!("'{}' is not actuated", path)))
    }

    /// Command the device at `path`, parsing `target` by device kind.
    pub async fn command(&self, path: &str, target: &str) -> DeviceResult<Status> {
        let controls = self
            .controls(path)
            .ok_or_else(|| DeviceError::NotFound(path.to_string()))?;
        let value = match controls {
            SimControls::Positioner(_) => {
                let position: f64 = target.parse().map_err(|_| {
                    DeviceError::Unsupported(format!("'{}' is not a position", target))
                })?;
                SignalValue::Numeric(position)
            }
            SimControls::Shutter(_) => shutter_position(target)?,
        };
        self.device(path)?
            .request(controls.transition_kind(), value)
            .await
    }
}

/// Build every configured device, grouped as configured, into a registry.
///
/// Must be called inside a tokio runtime.
pub fn build_beamline(config: &EngineConfig) -> DeviceResult<SimBeamline> {
    let mut roots: Vec<(DeviceNode, DeviceMetadata)> = Vec::new();
    let mut controls = BTreeMap::new();

    for definition in &config.devices {
        let (spec, control, kind) = match definition.kind {
            DeviceKind::Positioner => {
                let positioner = SimulatedPositioner::new(&definition.prefix, definition.speed)?;
                let spec = positioner.spec(&definition.name, definition, config)?;
                (spec, SimControls::Positioner(positioner), "positioner")
            }
            DeviceKind::Shutter => {
                let shutter = SimulatedShutter::new(&definition.prefix);
                let spec = shutter.spec(&definition.name, config)?;
                (spec, SimControls::Shutter(shutter), "shutter")
            }
        };
        let node = DeviceNode::actuated(DeviceHandle::spawn(spec)?)?;

        match &definition.group {
            Some(group) => {
                let index = match roots.iter().position(|(root, _)| root.name() == group) {
                    Some(index) => index,
                    None => {
                        roots.push((DeviceNode::new(group), DeviceMetadata::new("group")));
                        roots.len() - 1
                    }
                };
                roots[index].0.add_device(node)?;
                controls.insert(format!("{}.{}", group, definition.name), control);
            }
            None => {
                let metadata = DeviceMetadata::new(kind).with_prefix(&definition.prefix);
                roots.push((node, metadata));
                controls.insert(definition.name.clone(), control);
            }
        }
    }

    let mut builder = RegistryBuilder::new();
    for (node, metadata) in roots {
        builder.register(node, metadata)?;
    }
    Ok(SimBeamline {
        registry: builder.build(),
        controls,
    })
}
