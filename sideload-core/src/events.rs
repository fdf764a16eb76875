//! Status events and the reporting boundary
//!
//! Every observable outcome of a transfer run is a [`StatusEvent`]: a UTC
//! timestamp plus one variant of the closed [`EventKind`] union. Events are
//! handed to an injected [`StatusReporter`] and are fire-and-forget; the
//! engine never waits on, retries, or reacts to event delivery.
//!
//! The serialized form is a flat JSON object with a `type` tag and
//! camelCase fields, stable for downstream consumers.

use crate::device::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// One status event with its emission time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// What happened
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StatusEvent {
    /// Wrap an event kind with the current time
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Device the event concerns, if any
    pub fn device_id(&self) -> Option<&str> {
        self.kind.device_id()
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

/// Everything the transfer engine reports
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    /// A transfer run became active
    #[serde(rename_all = "camelCase")]
    RunStarted {
        /// Files in the staging directory at run start
        staged_files: usize,
    },

    /// The active run was stopped; all transfer state was discarded
    RunStopped,

    /// A device entered the usable state
    #[serde(rename_all = "camelCase")]
    DeviceConnected { device_id: String },

    /// A device left the usable state and was dropped from tracking
    #[serde(rename_all = "camelCase")]
    DeviceLost {
        device_id: String,
        state: ConnectionState,
    },

    /// A pipeline started pushing this device's pending files
    #[serde(rename_all = "camelCase")]
    TransferStarted {
        device_id: String,
        pending_files: usize,
    },

    /// A run was active but the device already has every staged file
    #[serde(rename_all = "camelCase")]
    NothingToPush { device_id: String },

    /// Parsed progress for the file currently being pushed
    #[serde(rename_all = "camelCase")]
    PushProgress {
        device_id: String,
        file: String,
        file_percent: u8,
        files_completed: usize,
        total_files: usize,
        overall_percent: u8,
    },

    /// One file was pushed and verified on the device
    #[serde(rename_all = "camelCase")]
    FilePushed {
        device_id: String,
        file: String,
        files_completed: usize,
        total_files: usize,
        overall_percent: u8,
    },

    /// Terminal: every pending file reached the device
    #[serde(rename_all = "camelCase")]
    DeviceCompleted {
        device_id: String,
        files_pushed: usize,
    },

    /// Terminal: the pipeline ended early
    ///
    /// `reason` distinguishes a failed push from a disconnect and from a
    /// user stop; `file` and `file_percent` describe the in-flight push,
    /// when there was one.
    #[serde(rename_all = "camelCase")]
    DeviceFailed {
        device_id: String,
        file: Option<String>,
        reason: String,
        file_percent: Option<u8>,
    },
}

impl EventKind {
    /// Device the event concerns, if any
    pub fn device_id(&self) -> Option<&str> {
        match self {
            EventKind::RunStarted { .. } | EventKind::RunStopped => None,
            EventKind::DeviceConnected { device_id }
            | EventKind::DeviceLost { device_id, .. }
            | EventKind::TransferStarted { device_id, .. }
            | EventKind::NothingToPush { device_id }
            | EventKind::PushProgress { device_id, .. }
            | EventKind::FilePushed { device_id, .. }
            | EventKind::DeviceCompleted { device_id, .. }
            | EventKind::DeviceFailed { device_id, .. } => Some(device_id),
        }
    }

    /// Check if this is a terminal per-device outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::DeviceCompleted { .. } | EventKind::DeviceFailed { .. }
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::RunStarted { staged_files } => {
                write!(f, "transfer run started, {} file(s) staged", staged_files)
            }
            EventKind::RunStopped => write!(f, "transfer run stopped"),
            EventKind::DeviceConnected { device_id } => {
                write!(f, "device {} connected", device_id)
            }
            EventKind::DeviceLost { device_id, state } => {
                write!(f, "device {} lost ({})", device_id, state)
            }
            EventKind::TransferStarted {
                device_id,
                pending_files,
            } => write!(f, "device {}: pushing {} file(s)", device_id, pending_files),
            EventKind::NothingToPush { device_id } => {
                write!(f, "device {}: nothing to push", device_id)
            }
            EventKind::PushProgress {
                device_id,
                file,
                file_percent,
                overall_percent,
                ..
            } => write!(
                f,
                "device {}: {} {}% (overall {}%)",
                device_id, file, file_percent, overall_percent
            ),
            EventKind::FilePushed {
                device_id,
                file,
                files_completed,
                total_files,
                ..
            } => write!(
                f,
                "device {}: pushed {} ({}/{})",
                device_id, file, files_completed, total_files
            ),
            EventKind::DeviceCompleted {
                device_id,
                files_pushed,
            } => write!(
                f,
                "device {}: completed, {} file(s) pushed",
                device_id, files_pushed
            ),
            EventKind::DeviceFailed {
                device_id,
                file,
                reason,
                ..
            } => match file {
                Some(file) => write!(f, "device {}: failed on {}: {}", device_id, file, reason),
                None => write!(f, "device {}: failed: {}", device_id, reason),
            },
        }
    }
}

/// Callback boundary for status events
///
/// Implementations must not block: the coordinator calls `report` from its
/// pipelines and holds no delivery state. Dropping events is the
/// implementation's prerogative.
pub trait StatusReporter: Send + Sync {
    fn report(&self, event: StatusEvent);
}

/// A reporter that ignores all events
pub struct NullReporter;

impl StatusReporter for NullReporter {
    fn report(&self, _event: StatusEvent) {}
}

/// A function-based reporter
pub struct FnReporter<F>
where
    F: Fn(StatusEvent) + Send + Sync,
{
    f: F,
}

impl<F> FnReporter<F>
where
    F: Fn(StatusEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> StatusReporter for FnReporter<F>
where
    F: Fn(StatusEvent) + Send + Sync,
{
    fn report(&self, event: StatusEvent) {
        (self.f)(event)
    }
}

/// Helper to create an Arc-wrapped reporter from a closure
pub fn reporter<F>(f: F) -> Arc<dyn StatusReporter>
where
    F: Fn(StatusEvent) + Send + Sync + 'static,
{
    Arc::new(FnReporter::new(f))
}
