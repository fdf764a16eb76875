//! Device State Tracking
//!
//! This module provides the per-device state types used by the transfer
//! coordinator: the connection state reported by the device bridge, the
//! local transfer status, and the progress bookkeeping for one device's
//! pipeline.
//!
//! ## Device Lifecycle
//!
//! 1. **Attached**: the bridge reports the device in the `device` state
//! 2. **Transferring**: a run is active and the device has unsent files
//! 3. **Completed/Failed**: the pipeline reached a terminal outcome
//! 4. **Removed**: the bridge reports `offline` or `unauthorized` and the
//!    device leaves the live set

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of an attached device
///
/// The bridge reports a richer set of raw states (`bootloader`, `recovery`,
/// `no permissions`, ...); everything that is neither usable nor an
/// authorization problem collapses to [`ConnectionState::Offline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Attached, authorized, and ready for commands
    Device,
    /// Not usable: unplugged, powered off, or in a non-interactive mode
    Offline,
    /// Attached but this host is not authorized on the device
    Unauthorized,
}

impl ConnectionState {
    /// Collapse a raw bridge state string to the tracked set
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "device" => ConnectionState::Device,
            "unauthorized" => ConnectionState::Unauthorized,
            _ => ConnectionState::Offline,
        }
    }

    /// Check if the device can accept pushes
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Device)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Device => write!(f, "device"),
            ConnectionState::Offline => write!(f, "offline"),
            ConnectionState::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

/// Transfer status of one device within the current run
///
/// Independent of [`ConnectionState`]: a device can be attached and `Idle`,
/// or can keep a `Failed` status while still attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// No pipeline running for this device
    Idle,
    /// A pipeline is pushing files to this device
    Transferring,
    /// The last pipeline pushed every pending file
    Completed,
    /// The last pipeline stopped on a failed push, disconnect, or stop
    Failed,
}

impl TransferStatus {
    /// Check if the status is a terminal pipeline outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Idle => write!(f, "idle"),
            TransferStatus::Transferring => write!(f, "transferring"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of one device's pipeline
///
/// `file_percent` is monotonic within a file: late or duplicated values
/// from the output parser are rejected by [`DeviceProgress::update_percent`]
/// so the visible number never moves backwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProgress {
    /// File currently being pushed
    pub current_file: Option<String>,
    /// Progress through the current file, 0-100
    pub file_percent: u8,
    /// Files already pushed and verified in this pipeline
    pub files_completed: usize,
    /// Pending files when the pipeline started
    pub total_files: usize,
}

impl DeviceProgress {
    /// Fresh progress for a pipeline over `total_files` pending files
    pub fn new(total_files: usize) -> Self {
        Self {
            current_file: None,
            file_percent: 0,
            files_completed: 0,
            total_files,
        }
    }

    /// Begin tracking the next file, resetting the per-file percentage
    pub fn begin_file(&mut self, name: &str) {
        self.current_file = Some(name.to_string());
        self.file_percent = 0;
    }

    /// Apply a parsed percentage, rejecting backwards or duplicate updates
    ///
    /// Returns `true` when the value advanced and should be reported.
    pub fn update_percent(&mut self, percent: u8) -> bool {
        if percent > 100 || percent <= self.file_percent {
            return false;
        }
        self.file_percent = percent;
        true
    }

    /// Record the current file as pushed and verified
    pub fn complete_file(&mut self) {
        self.files_completed += 1;
        self.file_percent = 0;
        self.current_file = None;
    }

    /// Overall pipeline progress, 0-100
    ///
    /// Weighted by file count: `(files_completed * 100 + file_percent) /
    /// total_files`, truncated.
    pub fn overall_percent(&self) -> u8 {
        if self.total_files == 0 {
            return 0;
        }
        let scaled = (self.files_completed * 100 + self.file_percent as usize) / self.total_files;
        scaled.min(100) as u8
    }
}

/// Point-in-time view of one tracked device
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Stable device identifier from the bridge
    pub id: String,
    /// Connection state as last reported
    pub connection: ConnectionState,
    /// Transfer status within the current run
    pub status: TransferStatus,
    /// Pipeline progress, when one is running
    pub progress: Option<DeviceProgress>,
}
