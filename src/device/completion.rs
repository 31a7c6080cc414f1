//! Completion policies.
//!
//! A policy watches the signal updates that arrive while a transition is in
//! flight and classifies each one as progress, completion or an error
//! condition. The state machine owns timing; policies are pure.

use crate::signal::{SignalTable, SignalUpdate, SignalValue};
use std::fmt;

/// What the state machine knows about the in-flight transition.
#[derive(Debug, Clone)]
pub struct MotionContext<'a> {
    /// Value the transition is heading for
    pub target: &'a SignalValue,
    /// Numeric position when the transition started, if one was readable
    pub start: Option<f64>,
    /// Whether the device has acknowledged the request by starting to move
    pub started: bool,
    /// Whether a cancel has been requested
    pub cancelling: bool,
}

/// Classification of a single signal update.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionEvent {
    /// Still in flight; carries a fractional progress estimate when known
    Progress(Option<f64>),
    /// Reached the target
    Complete,
    /// The device reported an error condition
    Error(String),
    /// Not relevant to the transition
    Ignore,
}

/// Decides from signal updates whether a transition has finished.
pub trait CompletionPolicy: Send + Sync + fmt::Debug {
    /// Signal names this policy reads. Each must be declared by the device.
    fn signals(&self) -> Vec<&str>;

    /// Numeric start position captured when a transition begins.
    fn start_position(&self, _signals: &SignalTable) -> Option<f64> {
        None
    }

    /// Classify an update of the declared signal `name`.
    fn classify(&self, name: &str, ctx: &MotionContext<'_>, update: &SignalUpdate) -> MotionEvent;
}

/// Completion signalled by a done flag (EPICS motor `DMOV` style).
///
/// The flag must drop to false before a true value counts as completion, so
/// a stale "done" from the previous move is not mistaken for this one.
#[derive(Debug, Clone)]
pub struct DoneFlag {
    done: String,
    error: Option<String>,
}

impl DoneFlag {
    /// Completion when the `done` flag rises.
    pub fn new(done: impl Into<String>) -> Self {
        Self {
            done: done.into(),
            error: None,
        }
    }

    /// Treat a true value on `error` as a motion error.
    pub fn with_error_signal(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

impl CompletionPolicy for DoneFlag {
    fn signals(&self) -> Vec<&str> {
        let mut names = vec![self.done.as_str()];
        names.extend(self.error.as_deref());
        names
    }

    fn classify(&self, name: &str, ctx: &MotionContext<'_>, update: &SignalUpdate) -> MotionEvent {
        if self.error.as_deref() == Some(name) {
            return match update.value.as_bool() {
                Some(true) => MotionEvent::Error(format!("'{}' raised", name)),
                _ => MotionEvent::Ignore,
            };
        }
        if name != self.done {
            return MotionEvent::Ignore;
        }
        match update.value.as_bool() {
            Some(false) => MotionEvent::Progress(None),
            Some(true) if ctx.started => MotionEvent::Complete,
            Some(true) => MotionEvent::Ignore,
            None => MotionEvent::Error(format!(
                "'{}' reported non-boolean value {}",
                name, update.value
            )),
        }
    }
}

/// Completion when a readback settles within `tolerance` of the target.
///
/// Works for enumerated readbacks too: the comparison uses the numeric index,
/// so a tolerance of zero means "exactly this state".
#[derive(Debug, Clone)]
pub struct ReadbackMatches {
    readback: String,
    tolerance: f64,
    done: Option<String>,
}

impl ReadbackMatches {
    /// Completion when `readback` is within `tolerance` of the target.
    pub fn new(readback: impl Into<String>, tolerance: f64) -> Self {
        Self {
            readback: readback.into(),
            tolerance: tolerance.abs(),
            done: None,
        }
    }

    /// Also watch a done flag, used to confirm a stop while cancelling.
    pub fn with_done_signal(mut self, done: impl Into<String>) -> Self {
        self.done = Some(done.into());
        self
    }
}

impl CompletionPolicy for ReadbackMatches {
    fn signals(&self) -> Vec<&str> {
        let mut names = vec![self.readback.as_str()];
        names.extend(self.done.as_deref());
        names
    }

    fn start_position(&self, signals: &SignalTable) -> Option<f64> {
        signals
            .get(&self.readback)
            .and_then(|binding| binding.read().ok())
            .and_then(|value| value.as_f64())
    }

    fn classify(&self, name: &str, ctx: &MotionContext<'_>, update: &SignalUpdate) -> MotionEvent {
        if self.done.as_deref() == Some(name) {
            return match update.value.as_bool() {
                Some(true) if ctx.cancelling && ctx.started => MotionEvent::Complete,
                Some(false) => MotionEvent::Progress(None),
                _ => MotionEvent::Ignore,
            };
        }
        if name != self.readback {
            return MotionEvent::Ignore;
        }
        let (Some(position), Some(target)) = (update.value.as_f64(), ctx.target.as_f64()) else {
            return MotionEvent::Error(format!(
                "cannot compare readback {} with target {}",
                update.value, ctx.target
            ));
        };

        let remaining = (target - position).abs();
        if remaining <= self.tolerance {
            return MotionEvent::Complete;
        }
        let fraction = ctx.start.and_then(|start| {
            let span = (target - start).abs();
            (span > f64::EPSILON).then(|| 1.0 - remaining / span)
        });
        MotionEvent::Progress(fraction)
    }
}
