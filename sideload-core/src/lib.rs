//! Staged-file transfer engine for bridge-attached devices
//!
//! This library watches the device bridge for attached devices and pushes a
//! staging directory's files onto each one concurrently, with per-device
//! progress parsed from the bridge's console output and a pluggable status
//! reporting boundary.

pub mod bridge;
pub mod coordinator;
pub mod device;
pub mod events;
pub mod monitor;
pub mod push;
pub mod staging;

mod error;

pub use bridge::{DeviceBridge, DEFAULT_BRIDGE_PROGRAM};
pub use coordinator::TransferCoordinator;
pub use device::{ConnectionState, DeviceProgress, DeviceSnapshot, TransferStatus};
pub use error::{BridgeError, Result};
pub use events::{reporter, EventKind, FnReporter, NullReporter, StatusEvent, StatusReporter};
pub use monitor::{DeviceMonitor, DeviceTransition};
pub use push::{
    BridgePushExecutor, ProcessRegistry, ProgressSender, PushExecutor, PushOutcome,
    DEFAULT_IDLE_TIMEOUT,
};
pub use staging::{destination_for, StagedFile, StagingArea};
