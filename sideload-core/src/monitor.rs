//! Device monitoring over the bridge's tracking stream
//!
//! A single long-lived `track-devices` child is the source of truth for
//! attached devices. Its stdout emits one `<identifier>\t<state>` line per
//! state change; the monitor parses those lines, drops repeats, and raises
//! [`DeviceTransition`]s on an unbounded channel.
//!
//! The stream ending (bridge restart, killed server) is not fatal: the
//! reader loop finishes, the channel closes, and the monitor can be
//! started again.

use crate::bridge::DeviceBridge;
use crate::device::ConnectionState;
use crate::error::{BridgeError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One observed device state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTransition {
    /// Stable identifier extracted from the tracking line
    pub device_id: String,
    /// Collapsed connection state
    pub state: ConnectionState,
    /// Raw state string as printed by the bridge
    pub raw_state: String,
}

fn serial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Za-z]{10,}$").expect("hardcoded regex"))
}

/// Extract the device id from an identifier token
///
/// The token may carry a numeric length prefix glued on by the stream
/// framing. Leading digits are stripped when at least ten alphanumeric
/// characters remain after them; otherwise the whole token is the id
/// (serials can themselves start with, or consist of, digits).
fn extract_serial(token: &str) -> Option<&str> {
    let tail = token.trim_start_matches(|c: char| c.is_ascii_digit());
    let candidate = if tail.len() >= 10 { tail } else { token };
    serial_re().is_match(candidate).then_some(candidate)
}

/// Parse one tracking line into `(device_id, raw_state)`
///
/// Expected shape is two whitespace-separated columns. Banner and header
/// lines have a different shape and fall out here.
fn parse_track_line(line: &str) -> Option<(String, String)> {
    let mut fields = line.split_whitespace();
    let token = fields.next()?;
    let state = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    let id = extract_serial(token)?.to_string();
    Some((id, state.to_string()))
}

#[derive(Default)]
struct MonitorInner {
    child: Option<Child>,
    task: Option<JoinHandle<()>>,
}

/// Watches the bridge's device-tracking stream
pub struct DeviceMonitor {
    bridge: DeviceBridge,
    inner: Arc<Mutex<MonitorInner>>,
}

impl DeviceMonitor {
    pub fn new(bridge: DeviceBridge) -> Self {
        Self {
            bridge,
            inner: Arc::new(Mutex::new(MonitorInner::default())),
        }
    }

    /// Spawn the tracking child and start raising transitions
    ///
    /// The returned receiver yields transitions until the stream ends or
    /// [`DeviceMonitor::stop`] is called; the channel closing means
    /// "monitoring stopped".
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<DeviceTransition>> {
        let mut inner = self.inner.lock().await;
        if inner.child.is_some() {
            return Err(BridgeError::Monitor("already running".to_string()));
        }

        let mut child = self
            .bridge
            .track_devices()
            .spawn()
            .map_err(|e| BridgeError::from_spawn_error(&self.bridge.program_name(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Monitor("tracking stream has no stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_bridge_stderr(stderr));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.child = Some(child);
        inner.task = Some(tokio::spawn(track_loop(stdout, tx, self.inner.clone())));

        info!("device monitor started ({})", self.bridge.program_name());
        Ok(rx)
    }

    /// Kill the tracking child and wait for the reader loop to finish
    ///
    /// Safe to call when the monitor is not running, and safe to race the
    /// stream's natural end.
    pub async fn stop(&self) {
        let (child, task) = {
            let mut inner = self.inner.lock().await;
            (inner.child.take(), inner.task.take())
        };
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!("tracking process already gone: {}", e);
            }
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("device monitor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.child.is_some()
    }
}

async fn track_loop(
    stdout: ChildStdout,
    tx: mpsc::UnboundedSender<DeviceTransition>,
    inner: Arc<Mutex<MonitorInner>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut last_states: HashMap<String, String> = HashMap::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let (device_id, raw_state) = match parse_track_line(&line) {
                    Some(parsed) => parsed,
                    None => {
                        if !line.trim().is_empty() {
                            debug!("ignoring tracking line: {:?}", line);
                        }
                        continue;
                    }
                };
                // Only a changed raw state is a transition
                if last_states.get(&device_id).map(String::as_str) == Some(raw_state.as_str()) {
                    continue;
                }
                last_states.insert(device_id.clone(), raw_state.clone());

                let state = ConnectionState::from_raw(&raw_state);
                debug!(device = %device_id, raw = %raw_state, %state, "device transition");
                if tx
                    .send(DeviceTransition {
                        device_id,
                        state,
                        raw_state,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                info!("device tracking stream ended");
                break;
            }
            Err(e) => {
                warn!("device tracking stream error: {}", e);
                break;
            }
        }
    }

    // Reap the child unless stop() already took it
    let child = { inner.lock().await.child.take() };
    if let Some(mut child) = child {
        if let Err(e) = child.kill().await {
            debug!("tracking process already gone: {}", e);
        }
    }
    inner.lock().await.task = None;
}

async fn log_bridge_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!("bridge: {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_line() {
        assert_eq!(
            parse_track_line("R58M123ABCD\tdevice"),
            Some(("R58M123ABCD".to_string(), "device".to_string()))
        );
        assert_eq!(
            parse_track_line("R58M123ABCD\tunauthorized"),
            Some(("R58M123ABCD".to_string(), "unauthorized".to_string()))
        );
    }

    #[test]
    fn test_parse_strips_numeric_prefix() {
        // The stream framing can glue a length prefix onto the first token
        assert_eq!(
            parse_track_line("0016R58M123ABCD\tdevice"),
            Some(("R58M123ABCD".to_string(), "device".to_string()))
        );
    }

    #[test]
    fn test_parse_keeps_digit_heavy_identifiers() {
        // All digits: nothing qualifies as a prefix, the token is the id
        assert_eq!(
            parse_track_line("123456789012\toffline"),
            Some(("123456789012".to_string(), "offline".to_string()))
        );
        // Stripping the leading digits would leave too little, so the
        // digits are part of the serial, not a framing prefix
        assert_eq!(
            parse_track_line("0123456789ABCDEF\tdevice"),
            Some(("0123456789ABCDEF".to_string(), "device".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_banner_lines() {
        assert_eq!(parse_track_line("List of devices attached"), None);
        assert_eq!(parse_track_line("* daemon started successfully *"), None);
        assert_eq!(parse_track_line(""), None);
    }

    #[test]
    fn test_parse_rejects_short_identifiers() {
        assert_eq!(parse_track_line("short\tdevice"), None);
        assert_eq!(parse_track_line("123456789\toffline"), None);
    }

    #[test]
    fn test_parse_rejects_extra_columns() {
        assert_eq!(parse_track_line("R58M123ABCD\tdevice extra"), None);
    }
}
