//! Status objects
//!
//! A [`Status`] tracks the outcome of one asynchronous device operation (a
//! move, a configuration change, a fault acknowledgement).
//!
//! # Lifecycle
//!
//! ```text
//!            resolve_success()   ┌──────────────┐
//!        ┌──────────────────────►│ done-success │
//!        │   resolve_failure()   ├──────────────┤
//! ┌──────┴──┐ ─────────────────► │ done-failure │
//! │ pending │  resolve_timeout() ├──────────────┤
//! └──────┬──┘ ─────────────────► │  timed-out   │
//!        │   resolve_cancelled() ├──────────────┤
//!        └──────────────────────►│  cancelled   │
//!                                └──────────────┘
//! ```
//!
//! A Status leaves `pending` exactly once. Any later resolve attempt fails with
//! `AlreadyResolved` and changes nothing.
//!
//! # Aggregation
//!
//! Sub-operations are attached with [`Status::add_child`]. Children are
//! inspected in registration order: the parent succeeds once every child has
//! succeeded, and otherwise takes the phase and reason of the earliest
//! registered child that did not succeed. A later-registered failure that
//! arrives first does not decide the outcome while an earlier child is still
//! pending.
//!
//! # Thread Safety
//!
//! `Status` is a cheap `Arc` handle. Callbacks run on the thread that resolves
//! the Status, after the internal lock has been released.

use crate::error::{DeviceError, DeviceResult};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Phase of a Status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusPhase {
    /// Not yet resolved
    Pending,
    /// Completed normally
    #[serde(rename = "done-success")]
    Success,
    /// Failed with a reason
    #[serde(rename = "done-failure")]
    Failure,
    /// Exceeded its deadline
    TimedOut,
    /// Stopped on request
    Cancelled,
}

impl StatusPhase {
    /// Whether the phase is final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StatusPhase::Pending)
    }

    /// Only `Success` counts as success.
    pub fn is_success(self) -> bool {
        matches!(self, StatusPhase::Success)
    }
}

impl fmt::Display for StatusPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusPhase::Pending => "pending",
            StatusPhase::Success => "done-success",
            StatusPhase::Failure => "done-failure",
            StatusPhase::TimedOut => "timed-out",
            StatusPhase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

type StatusCallback = Box<dyn FnOnce(StatusPhase) + Send>;

/// Handle to the outcome of one asynchronous operation.
#[derive(Clone)]
pub struct Status {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    id: Uuid,
    description: String,
    created_at: DateTime<Utc>,
    state: Mutex<StatusState>,
    resolved: Condvar,
    phase_tx: watch::Sender<StatusPhase>,
}

struct StatusState {
    phase: StatusPhase,
    reason: Option<DeviceError>,
    progress: Option<f64>,
    resolved_at: Option<DateTime<Utc>>,
    children: Vec<Status>,
    callbacks: Vec<StatusCallback>,
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Status")
            .field("id", &self.inner.id)
            .field("description", &self.inner.description)
            .field("phase", &state.phase)
            .field("reason", &state.reason)
            .field("children", &state.children.len())
            .finish()
    }
}

impl Status {
    /// Create a new pending Status.
    pub fn new(description: impl Into<String>) -> Self {
        let (phase_tx, _) = watch::channel(StatusPhase::Pending);
        Self {
            inner: Arc::new(StatusInner {
                id: Uuid::new_v4(),
                description: description.into(),
                created_at: Utc::now(),
                state: Mutex::new(StatusState {
                    phase: StatusPhase::Pending,
                    reason: None,
                    progress: None,
                    resolved_at: None,
                    children: Vec::new(),
                    callbacks: Vec::new(),
                }),
                resolved: Condvar::new(),
                phase_tx,
            }),
        }
    }

    /// Create a Status that is already resolved as a failure.
    pub fn failed(description: impl Into<String>, reason: DeviceError) -> Self {
        let status = Self::new(description);
        // A fresh Status cannot already be resolved.
        let _ = status.resolve_failure(reason);
        status
    }

    /// Create a Status that is already resolved as a success.
    pub fn succeeded(description: impl Into<String>) -> Self {
        let status = Self::new(description);
        let _ = status.resolve_success();
        status
    }

    /// Unique identifier.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// When the status was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Current phase.
    pub fn phase(&self) -> StatusPhase {
        self.inner.state.lock().phase
    }

    /// Failure, timeout or cancellation reason, if any.
    pub fn reason(&self) -> Option<DeviceError> {
        self.inner.state.lock().reason.clone()
    }

    /// Last reported fractional progress, if any.
    pub fn progress(&self) -> Option<f64> {
        self.inner.state.lock().progress
    }

    /// Whether the status left `Pending`.
    pub fn is_done(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Attached sub-operations in registration order.
    pub fn children(&self) -> Vec<Status> {
        self.inner.state.lock().children.clone()
    }

    /// Whether two handles refer to the same Status.
    pub fn same_as(&self, other: &Status) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolve as succeeded.
    pub fn resolve_success(&self) -> DeviceResult<()> {
        self.finish(StatusPhase::Success, None)
    }

    /// Resolve as failed with `reason`.
    pub fn resolve_failure(&self, reason: DeviceError) -> DeviceResult<()> {
        self.finish(StatusPhase::Failure, Some(reason))
    }

    /// Resolve as timed out.
    pub fn resolve_timeout(&self) -> DeviceResult<()> {
        let reason = DeviceError::Timeout(self.inner.description.clone());
        self.finish(StatusPhase::TimedOut, Some(reason))
    }

    /// Resolve as cancelled.
    pub fn resolve_cancelled(&self) -> DeviceResult<()> {
        let reason = DeviceError::Cancelled(self.inner.description.clone());
        self.finish(StatusPhase::Cancelled, Some(reason))
    }

    fn finish(&self, phase: StatusPhase, reason: Option<DeviceError>) -> DeviceResult<()> {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return Err(DeviceError::AlreadyResolved);
            }
            state.phase = phase;
            state.reason = reason;
            state.resolved_at = Some(Utc::now());
            if phase.is_success() {
                state.progress = Some(1.0);
            }
            self.inner.resolved.notify_all();
            std::mem::take(&mut state.callbacks)
        };

        self.inner.phase_tx.send_replace(phase);
        debug!(
            status_id = %self.inner.id,
            operation = %self.inner.description,
            phase = %phase,
            "Status resolved"
        );

        for callback in callbacks {
            callback(phase);
        }
        Ok(())
    }

    /// Record fractional progress (clamped to `0.0..=1.0`) while pending.
    pub fn set_progress(&self, fraction: f64) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        if state.phase.is_terminal() {
            return Err(DeviceError::InvalidState(format!(
                "cannot report progress on {} status",
                state.phase
            )));
        }
        state.progress = Some(fraction.clamp(0.0, 1.0));
        Ok(())
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    /// Attach a sub-operation. Fails with `InvalidState` once this Status is terminal.
    pub fn add_child(&self, child: Status) -> DeviceResult<()> {
        if child.contains(self) {
            return Err(DeviceError::InvalidState(
                "a status cannot be its own descendant".to_string(),
            ));
        }
        {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return Err(DeviceError::InvalidState(format!(
                    "cannot attach a child to {} status",
                    state.phase
                )));
            }
            state.children.push(child.clone());
        }

        // The child only holds a weak handle back to its parent.
        let parent: Weak<StatusInner> = Arc::downgrade(&self.inner);
        child.register_callback(move |_| {
            if let Some(inner) = parent.upgrade() {
                Status { inner }.evaluate_children();
            }
        });
        Ok(())
    }

    /// Whether `other` is this Status or one of its descendants.
    fn contains(&self, other: &Status) -> bool {
        self.same_as(other) || self.children().iter().any(|child| child.contains(other))
    }

    fn evaluate_children(&self) {
        let children = {
            let state = self.inner.state.lock();
            if state.phase.is_terminal() || state.children.is_empty() {
                return;
            }
            state.children.clone()
        };

        for child in &children {
            match child.phase() {
                StatusPhase::Pending => return,
                StatusPhase::Success => continue,
                phase => {
                    let reason = child.reason().unwrap_or_else(|| {
                        DeviceError::InvalidState(child.description().to_string())
                    });
                    let _ = self.finish(phase, Some(reason));
                    return;
                }
            }
        }
        let _ = self.finish(StatusPhase::Success, None);
    }

    // =========================================================================
    // Completion contract
    // =========================================================================

    /// Run `callback` with the terminal phase, exactly once.
    ///
    /// Runs immediately if the Status is already terminal.
    pub fn register_callback(&self, callback: impl FnOnce(StatusPhase) + Send + 'static) {
        let phase = {
            let mut state = self.inner.state.lock();
            if !state.phase.is_terminal() {
                state.callbacks.push(Box::new(callback));
                return;
            }
            state.phase
        };
        callback(phase);
    }

    /// Wait until terminal or until `timeout` elapses.
    ///
    /// If the timeout elapses first the Status itself resolves as timed-out.
    /// Only the calling task is suspended.
    pub async fn wait(&self, timeout: Duration) -> StatusPhase {
        let mut rx = self.inner.phase_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|phase| phase.is_terminal()).await.map(|phase| *phase)
        })
        .await;

        match waited {
            Ok(Ok(phase)) => phase,
            _ => {
                let _ = self.resolve_timeout();
                self.phase()
            }
        }
    }

    /// Blocking form of [`Status::wait`] for callers outside an async runtime.
    pub fn wait_blocking(&self, timeout: Duration) -> StatusPhase {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.inner.state.lock();
            while !state.phase.is_terminal() {
                if self
                    .inner
                    .resolved
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if state.phase.is_terminal() {
                return state.phase;
            }
        }
        let _ = self.resolve_timeout();
        self.phase()
    }

    /// Serializable view for registries and operator panels.
    pub fn snapshot(&self) -> StatusSnapshot {
        let (phase, reason, progress, resolved_at, children) = {
            let state = self.inner.state.lock();
            (
                state.phase,
                state.reason.as_ref().map(ToString::to_string),
                state.progress,
                state.resolved_at,
                state.children.clone(),
            )
        };
        StatusSnapshot {
            id: self.inner.id,
            description: self.inner.description.clone(),
            phase,
            reason,
            progress,
            created_at: self.inner.created_at,
            resolved_at,
            children: children.iter().map(Status::snapshot).collect(),
        }
    }
}

/// Point-in-time view of a Status and its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Unique identifier
    pub id: Uuid,
    /// Human-readable description
    pub description: String,
    /// Resolution phase
    pub phase: StatusPhase,
    /// Failure reason, for failed statuses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Last reported progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Resolution time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Snapshots of child statuses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StatusSnapshot>,
}
