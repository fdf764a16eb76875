//! Error handling for the transfer engine
//!
//! This module provides the error type shared by the staging, monitoring,
//! and coordination layers. Errors are automatically converted from
//! underlying library errors using `thiserror`.
//!
//! Push failures are deliberately **not** errors: a failed push is an
//! expected outcome reported through [`PushOutcome`](crate::PushOutcome)
//! and the status-event stream, so `BridgeError` only covers the cases
//! where an operation could not be carried out at all (the staging
//! directory is unreadable, the bridge binary is missing, the monitor is
//! already running).
//!
//! ## Error Categories
//!
//! ### I/O Errors
//! File system and pipe failures. Automatically converted from
//! `std::io::Error`.
//!
//! ### Bridge Errors
//! The external device-bridge binary could not be started:
//! - `BridgeMissing`: binary not found on `PATH`
//! - `Monitor`: device-stream lifecycle violations
//!
//! ### Staging Errors
//! The staged-file directory is missing or unreadable.

use thiserror::Error;

/// Result type for transfer-engine operations
///
/// Type alias for `Result<T, BridgeError>` used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while monitoring devices or preparing transfers
///
/// # Examples
///
/// ```rust
/// use sideload_core::BridgeError;
///
/// let error = BridgeError::BridgeMissing { program: "adb".to_string() };
/// assert_eq!(
///     error.to_string(),
///     "device bridge 'adb' not found on PATH"
/// );
///
/// let error = BridgeError::Monitor("already running".to_string());
/// assert_eq!(error.to_string(), "device monitor error: already running");
/// ```
#[derive(Error, Debug)]
pub enum BridgeError {
    /// I/O error (file system, pipes, process handles)
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The device-bridge binary was not found
    ///
    /// Raised when spawning the bridge fails with `NotFound`, which almost
    /// always means the platform tools are not installed or not on `PATH`.
    #[error("device bridge '{program}' not found on PATH")]
    BridgeMissing { program: String },

    /// Device-monitor lifecycle error
    ///
    /// Raised when the monitor is started while its tracking stream is
    /// already running.
    #[error("device monitor error: {0}")]
    Monitor(String),

    /// The staging directory is missing or unreadable
    #[error("staging error: {0}")]
    Staging(String),
}

impl BridgeError {
    /// Classify a spawn failure for the bridge binary
    ///
    /// `NotFound` becomes [`BridgeError::BridgeMissing`] so callers can tell
    /// "platform tools not installed" apart from ordinary I/O failures.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sideload_core::BridgeError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let spawn_error = Error::new(ErrorKind::NotFound, "no such file");
    /// let error = BridgeError::from_spawn_error("adb", spawn_error);
    /// assert!(matches!(error, BridgeError::BridgeMissing { .. }));
    /// ```
    pub fn from_spawn_error(program: &str, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            BridgeError::BridgeMissing {
                program: program.to_string(),
            }
        } else {
            BridgeError::Io(error)
        }
    }

    /// Check if this error is recoverable (might succeed on retry)
    ///
    /// A missing bridge binary is permanent until the operator installs it;
    /// everything else is worth retrying.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, BridgeError::BridgeMissing { .. })
    }
}
