//! Interlock evaluation
//!
//! An interlock is a named precondition over live signal values that must
//! hold before a device transition is allowed ("beam permitted", "within
//! travel limits"). Rules are stateless and evaluated on demand.
//!
//! # Ordering
//!
//! [`evaluate`] runs rules in declaration order and stops at the first
//! failure. Later rules may rely on earlier ones having passed: a travel-limit
//! check is only meaningful once the position sensor has been validated.
//!
//! # Unreadable signals
//!
//! A predicate that cannot be evaluated (for example because a signal is
//! unreadable) counts as a failing rule whose reason is `SignalUnavailable`.
//! The evaluator itself never fails.

use crate::error::{DeviceError, DeviceResult};
use crate::signal::{SignalTable, SignalValue};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Predicate over the current signal values.
pub type Predicate = Arc<dyn Fn(&InterlockContext<'_>) -> DeviceResult<bool> + Send + Sync>;

/// A named precondition with a human-readable denial message.
#[derive(Clone)]
pub struct InterlockRule {
    name: String,
    message: String,
    predicate: Predicate,
}

impl fmt::Debug for InterlockRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterlockRule")
            .field("name", &self.name)
            .field("message", &self.message)
            .finish()
    }
}

impl InterlockRule {
    /// Rule that reads the named signals and runs `check` against them.
    pub fn new(
        name: impl Into<String>,
        message: impl Into<String>,
        predicate: impl Fn(&InterlockContext<'_>) -> DeviceResult<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Passes while the named signal reads as true (non-zero).
    pub fn signal_true(
        name: impl Into<String>,
        signal: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let signal = signal.into();
        Self::new(name, message, move |ctx| ctx.read_bool(&signal))
    }

    /// Passes while the named signal reads as false (zero).
    pub fn signal_false(
        name: impl Into<String>,
        signal: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let signal = signal.into();
        Self::new(name, message, move |ctx| ctx.read_bool(&signal).map(|v| !v))
    }

    /// Passes while the named signal equals `expected`.
    pub fn signal_equals(
        name: impl Into<String>,
        signal: impl Into<String>,
        expected: SignalValue,
        message: impl Into<String>,
    ) -> Self {
        let signal = signal.into();
        Self::new(name, message, move |ctx| Ok(ctx.read(&signal)? == expected))
    }

    /// Passes while the requested target lies within `[low, high]`.
    ///
    /// With no target (e.g. a fault acknowledgement) the named readback is
    /// checked instead.
    pub fn target_within(
        name: impl Into<String>,
        readback: impl Into<String>,
        low: f64,
        high: f64,
        message: impl Into<String>,
    ) -> Self {
        let readback = readback.into();
        Self::new(name, message, move |ctx| {
            let value = match ctx.target().and_then(SignalValue::as_f64) {
                Some(target) => target,
                None => ctx.read_f64(&readback)?,
            };
            Ok((low..=high).contains(&value))
        })
    }

    /// Rule name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Message reported to operators on denial.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Evaluate this rule alone.
    pub fn check(&self, context: &InterlockContext<'_>) -> InterlockVerdict {
        match (self.predicate)(context) {
            Ok(true) => InterlockVerdict::Permitted,
            Ok(false) => InterlockVerdict::Denied {
                rule: self.name.clone(),
                reason: DeviceError::InterlockDenied {
                    rule: self.name.clone(),
                    message: self.message.clone(),
                },
            },
            Err(err) => InterlockVerdict::Denied {
                rule: self.name.clone(),
                reason: DeviceError::SignalUnavailable(format!(
                    "interlock '{}' could not be evaluated: {}",
                    self.name, err
                )),
            },
        }
    }
}

/// Live signal access handed to predicates.
pub struct InterlockContext<'a> {
    signals: &'a SignalTable,
    target: Option<&'a SignalValue>,
}

impl<'a> InterlockContext<'a> {
    /// View over a device's declared signals.
    pub fn new(signals: &'a SignalTable) -> Self {
        Self {
            signals,
            target: None,
        }
    }

    /// Attach the value a transition is requesting.
    pub fn with_target(mut self, target: &'a SignalValue) -> Self {
        self.target = Some(target);
        self
    }

    /// The requested target value, if this is a transition request.
    pub fn target(&self) -> Option<&'a SignalValue> {
        self.target
    }

    /// Current value of a declared signal.
    pub fn read(&self, name: &str) -> DeviceResult<SignalValue> {
        let binding = self
            .signals
            .get(name)
            .ok_or_else(|| DeviceError::NotFound(format!("signal '{}'", name)))?;
        binding.read().map_err(|err| match err {
            DeviceError::Unreadable(address) => DeviceError::SignalUnavailable(address),
            other => other,
        })
    }

    /// Read a declared signal as a number.
    pub fn read_f64(&self, name: &str) -> DeviceResult<f64> {
        self.read(name)?.as_f64().ok_or_else(|| {
            DeviceError::SignalUnavailable(format!("signal '{}' is not numeric", name))
        })
    }

    /// Read a declared signal as a flag; non-zero is true.
    pub fn read_bool(&self, name: &str) -> DeviceResult<bool> {
        self.read(name)?.as_bool().ok_or_else(|| {
            DeviceError::SignalUnavailable(format!("signal '{}' is not boolean", name))
        })
    }
}

/// Outcome of an interlock evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum InterlockVerdict {
    /// Every rule passed.
    Permitted,
    /// A rule failed.
    Denied {
        /// Name of the failing rule
        rule: String,
        /// The denial, as [`DeviceError::InterlockDenied`]
        reason: DeviceError,
    },
}

impl InterlockVerdict {
    /// Whether every rule passed.
    pub fn is_permitted(&self) -> bool {
        matches!(self, InterlockVerdict::Permitted)
    }

    /// The denial message shown to operators, if denied.
    pub fn denial_message(&self) -> Option<String> {
        match self {
            InterlockVerdict::Permitted => None,
            InterlockVerdict::Denied { reason, .. } => Some(reason.to_string()),
        }
    }

    /// `Ok` when permitted, otherwise [`DeviceError::InterlockDenied`].
    pub fn into_result(self) -> DeviceResult<()> {
        match self {
            InterlockVerdict::Permitted => Ok(()),
            InterlockVerdict::Denied { reason, .. } => Err(reason),
        }
    }
}

/// Run `rules` in order against `context`, stopping at the first denial.
pub fn evaluate(rules: &[InterlockRule], context: &InterlockContext<'_>) -> InterlockVerdict {
    for rule in rules {
        let verdict = rule.check(context);
        trace!(rule = %rule.name, permitted = verdict.is_permitted(), "Interlock evaluated");
        if let InterlockVerdict::Denied { reason, .. } = &verdict {
            debug!(rule = %rule.name, reason = %reason, "Interlock denied");
            return verdict;
        }
    }
    InterlockVerdict::Permitted
}
