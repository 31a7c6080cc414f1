//! Error types for the device engine.
//!
//! This module defines `DeviceError`, the single error taxonomy shared by the
//! Status, Interlock, State Machine and Device Node layers. Using the
//! `thiserror` crate it gives every failure a stable, operator-readable
//! message.
//!
//! ## Error Hierarchy
//!
//! - **Control-system level**: `SignalUnavailable`, `Unreadable` and
//!   `WriteRejected` are transient failures of a bound signal. The engine never
//!   retries them; callers decide.
//! - **Transition level**: `Busy`, `InterlockDenied`, `InvalidTransition` and
//!   `Unsupported` are reported when a request cannot be carried out.
//! - **Hardware level**: `AsynchronousFault` is a fault reported by the device
//!   itself and is terminal for the in-flight Status until acknowledged.
//!   `MotionError` is an error condition reported by the completion signal of
//!   an in-flight transition.
//! - **Contract violations**: `AlreadyResolved` and `InvalidState` flag misuse of
//!   the Status API and always indicate a local bug.
//!
//! `DeviceError` is `Clone` because a copy of it is stored as the failure reason
//! of every Status it terminates.

use crate::device::DeviceState;
use thiserror::Error;

/// Convenience alias for results using the device error type.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Every failure the device engine reports.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The control-system channel is not reachable.
    #[error("Signal unavailable: {0}")]
    SignalUnavailable(String),

    /// The channel exists but has no readable value.
    #[error("Signal '{0}' could not be read")]
    Unreadable(String),

    /// The channel refused a write.
    #[error("Write to signal '{address}' rejected: {reason}")]
    WriteRejected {
        /// Channel address
        address: String,
        /// Why the write was refused
        reason: String,
    },

    /// A transition is already in flight.
    #[error("Device is busy: a transition is already in flight")]
    Busy,

    /// An interlock rule failed; the message is shown to operators verbatim.
    #[error("Interlock '{rule}' denied transition: {message}")]
    InterlockDenied {
        /// Name of the failing rule
        rule: String,
        /// Human-readable denial message
        message: String,
    },

    /// Fault raised by the hardware itself.
    #[error("Asynchronous fault reported by hardware: {0}")]
    AsynchronousFault(String),

    /// Error condition reported by a completion signal while moving.
    #[error("Device reported an error during motion: {0}")]
    MotionError(String),

    /// Operation not available on this device variant.
    #[error("Operation not supported by this device: {0}")]
    Unsupported(String),

    /// A Status was resolved twice.
    #[error("Status is already resolved")]
    AlreadyResolved,

    /// Status API used in the wrong phase.
    #[error("Invalid status state: {0}")]
    InvalidState(String),

    /// The device state does not allow the requested action.
    #[error("Cannot {action} while device is {from}")]
    InvalidTransition {
        /// State the device was in
        from: DeviceState,
        /// What was attempted, e.g. "start a move"
        action: String,
    },

    /// A sibling or root with the same name exists.
    #[error("Child name '{0}' already exists")]
    DuplicateName(String),

    /// Lookup by name or path found nothing.
    #[error("No such device or signal: {0}")]
    NotFound(String),

    /// The operation did not finish in time.
    #[error("Operation '{0}' timed out")]
    Timeout(String),

    /// The operation was stopped on request.
    #[error("Operation '{0}' was cancelled")]
    Cancelled(String),

    /// The device actor is no longer running.
    #[error("Device '{0}' is shut down")]
    Shutdown(String),
}

impl DeviceError {
    /// Returns `true` for errors the caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeviceError::SignalUnavailable(_) | DeviceError::Unreadable(_) | DeviceError::Busy
        )
    }

    /// Returns `true` for Status API contract violations.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            DeviceError::AlreadyResolved | DeviceError::InvalidState(_)
        )
    }
}
