//! Device-bridge command construction
//!
//! Thin wrapper over the platform `adb` binary (or a drop-in replacement
//! resolved from configuration). This module only builds
//! `tokio::process::Command` values; spawning, stream handling, and
//! lifetime management belong to the device monitor and the push executor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Default bridge binary, resolved through `PATH`
pub const DEFAULT_BRIDGE_PROGRAM: &str = "adb";

/// Builder for invocations of the external device bridge
#[derive(Debug, Clone)]
pub struct DeviceBridge {
    program: PathBuf,
}

impl DeviceBridge {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Bridge binary path as configured
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Bridge binary name for log and error messages
    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn base(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// `<bridge> track-devices`
    ///
    /// Long-lived; streams one `<identifier>\t<state>` line per device
    /// state change until killed.
    pub fn track_devices(&self) -> Command {
        let mut cmd = self.base();
        cmd.arg("track-devices")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// `<bridge> -s <id> push <local> <remote>`
    ///
    /// Progress markers can appear on either stream depending on the
    /// bridge version, so both are piped.
    pub fn push(&self, device_id: &str, local: &Path, remote: &str) -> Command {
        let mut cmd = self.base();
        cmd.arg("-s")
            .arg(device_id)
            .arg("push")
            .arg(local)
            .arg(remote)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// `<bridge> -s <id> shell ls <remote>`
    ///
    /// Existence check for a pushed file. Old bridge versions exit 0 even
    /// when the path is missing, so callers must also scan the output for
    /// `No such file`.
    pub fn remote_ls(&self, device_id: &str, remote: &str) -> Command {
        let mut cmd = self.base();
        cmd.arg("-s")
            .arg(device_id)
            .arg("shell")
            .arg("ls")
            .arg(remote);
        cmd
    }
}

impl Default for DeviceBridge {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE_PROGRAM)
    }
}
