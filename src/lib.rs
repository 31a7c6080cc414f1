//! Device state, interlock and motion-completion engine for beamline hardware.
//!
//! The crate tracks the operational state of control-system devices
//! (positioners, shutters, groups of them), gates transitions behind named
//! interlocks and reports the outcome of every transition through a
//! [`status::Status`] that callers can wait on, chain or aggregate.
//!
//! # Layers
//!
//! - [`signal`]: the contract with the control system (read, write,
//!   subscribe) plus in-memory and derived bindings.
//! - [`status`]: completion objects with success, failure, timeout and
//!   cancellation outcomes.
//! - [`interlock`]: named preconditions evaluated in order.
//! - [`device`]: the per-device state machine actor and the composition tree.
//! - [`registry`]: the explicit set of top-level device trees.
//! - [`sim`]: simulated hardware for tests and the `beamline-sim` binary.

pub mod config;
pub mod device;
pub mod error;
pub mod interlock;
pub mod logging;
pub mod registry;
pub mod signal;
pub mod sim;
pub mod status;

pub use error::{DeviceError, DeviceResult};
