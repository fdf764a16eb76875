//! Push execution against the device bridge
//!
//! One [`PushExecutor::push`] call pushes one file to one device and turns
//! the bridge's noisy console output into discrete progress percentages.
//! Push failures are outcomes, not errors: spawn failures, output timeouts,
//! non-zero exits, kills, and failed on-device verification all come back
//! as `PushOutcome { success: false, .. }` with a diagnostic string.
//!
//! Spawned children are tracked in a [`ProcessRegistry`] keyed by device id
//! so the coordinator can terminate them on stop or disconnect. A kill can
//! race the child's natural exit; whichever side takes the child out of its
//! slot first wins, and the other side treats the empty slot as "already
//! gone".

use crate::bridge::DeviceBridge;
use crate::error::BridgeError;
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Progress values are forwarded as they are parsed, 0-100
pub type ProgressSender = mpsc::UnboundedSender<u8>;

/// Give up on a push that produces no output for this long
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of one push attempt
#[derive(Debug, Clone)]
pub struct PushOutcome {
    /// The file reached the device and was verified there
    pub success: bool,
    /// Diagnostic text for failed attempts
    pub detail: Option<String>,
}

impl PushOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// Pushes one file to one device
///
/// The coordinator only depends on this trait, so the output-parsing and
/// transport strategy can change (or be scripted in tests) without touching
/// the pipeline logic.
#[async_trait]
pub trait PushExecutor: Send + Sync {
    /// Push `source` to `destination` on the device, streaming parsed
    /// progress percentages through `progress`
    async fn push(
        &self,
        device_id: &str,
        source: &Path,
        destination: &str,
        progress: ProgressSender,
    ) -> PushOutcome;

    /// Terminate tracked pushes for one device, returning the killed count
    async fn kill_device(&self, device_id: &str) -> usize;

    /// Terminate every tracked push, returning the killed count
    async fn kill_all(&self) -> usize;
}

type ChildSlot = Arc<Mutex<Option<Child>>>;

/// Kill and reap the child in `slot`, if it is still there
async fn kill_slot(slot: &ChildSlot) -> bool {
    let taken = slot.lock().await.take();
    match taken {
        Some(mut child) => {
            if let Err(e) = child.kill().await {
                debug!("push process already gone: {}", e);
            }
            true
        }
        None => false,
    }
}

/// Live push processes, keyed by device id
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, Vec<ChildSlot>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, device_id: &str, child: Child) -> ChildSlot {
        let slot: ChildSlot = Arc::new(Mutex::new(Some(child)));
        self.inner
            .lock()
            .await
            .entry(device_id.to_string())
            .or_default()
            .push(slot.clone());
        slot
    }

    async fn release(&self, device_id: &str, slot: &ChildSlot) {
        let mut inner = self.inner.lock().await;
        if let Some(slots) = inner.get_mut(device_id) {
            slots.retain(|s| !Arc::ptr_eq(s, slot));
            if slots.is_empty() {
                inner.remove(device_id);
            }
        }
    }

    /// Kill every tracked push for `device_id`
    pub async fn kill_device(&self, device_id: &str) -> usize {
        let slots = self.inner.lock().await.remove(device_id).unwrap_or_default();
        let killed = join_all(slots.iter().map(kill_slot)).await;
        killed.into_iter().filter(|k| *k).count()
    }

    /// Kill every tracked push for every device
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<ChildSlot> = {
            let mut inner = self.inner.lock().await;
            inner.drain().flat_map(|(_, slots)| slots).collect()
        };
        let killed = join_all(drained.iter().map(kill_slot)).await;
        killed.into_iter().filter(|k| *k).count()
    }
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]\d]*(\d{1,3})%\]").expect("hardcoded regex"))
}

fn strip_control(segment: &str) -> String {
    segment.chars().filter(|c| !c.is_control()).collect()
}

/// Extract progress values from one cleaned output segment
///
/// Forwards a value only when it differs from the previously forwarded one;
/// values over 100 come from garbled output and are dropped.
fn scan_progress(clean: &str, last: &mut Option<u8>, out: &mut Vec<u8>) {
    for caps in percent_re().captures_iter(clean) {
        let value = match caps[1].parse::<u8>() {
            Ok(v) if v <= 100 => v,
            _ => continue,
        };
        if *last == Some(value) {
            continue;
        }
        *last = Some(value);
        out.push(value);
    }
}

/// Split accumulated output into complete segments
///
/// The bridge rewrites its progress line with bare carriage returns, so
/// both `\r` and `\n` terminate a segment. A trailing partial segment stays
/// in `buffer` until more output (or EOF) arrives.
fn drain_segments(buffer: &mut String) -> Vec<String> {
    let mut segments = Vec::new();
    while let Some(pos) = buffer.find(['\r', '\n']) {
        let segment: String = buffer.drain(..=pos).collect();
        let segment = segment.trim_end_matches(['\r', '\n']);
        if !segment.is_empty() {
            segments.push(segment.to_string());
        }
    }
    segments
}

/// Forward output segments from one child stream
async fn forward_segments<R>(mut stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = String::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
                for segment in drain_segments(&mut buffer) {
                    if tx.send(segment).is_err() {
                        return;
                    }
                }
            }
        }
    }
    if !buffer.trim().is_empty() {
        let _ = tx.send(buffer);
    }
}

/// Production executor backed by the device-bridge binary
pub struct BridgePushExecutor {
    bridge: DeviceBridge,
    registry: ProcessRegistry,
    idle_timeout: Duration,
}

impl BridgePushExecutor {
    pub fn new(bridge: DeviceBridge) -> Self {
        Self {
            bridge,
            registry: ProcessRegistry::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Check that `remote` exists on the device after a push
    ///
    /// Old bridge versions exit 0 from `shell ls` even for missing paths,
    /// so the output is scanned for `No such file` as well.
    async fn verify_on_device(&self, device_id: &str, remote: &str) -> bool {
        let output = match self.bridge.remote_ls(device_id, remote).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(device = device_id, "existence check failed to run: {}", e);
                return false;
            }
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        output.status.success() && !text.contains("No such file")
    }
}

#[async_trait]
impl PushExecutor for BridgePushExecutor {
    async fn push(
        &self,
        device_id: &str,
        source: &Path,
        destination: &str,
        progress: ProgressSender,
    ) -> PushOutcome {
        debug!(
            device = device_id,
            source = %source.display(),
            destination,
            "spawning bridge push"
        );

        let mut child = match self.bridge.push(device_id, source, destination).spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = BridgeError::from_spawn_error(&self.bridge.program_name(), e);
                warn!(device = device_id, "push spawn failed: {}", error);
                return PushOutcome::failed(format!("push spawn failed: {}", error));
            }
        };

        let (segment_tx, mut segment_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_segments(stdout, segment_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_segments(stderr, segment_tx.clone()));
        }
        drop(segment_tx);

        let slot = self.registry.register(device_id, child).await;

        let mut last_percent = None;
        let mut last_line: Option<String> = None;
        let mut timed_out = false;
        loop {
            match timeout(self.idle_timeout, segment_rx.recv()).await {
                Ok(Some(segment)) => {
                    let clean = strip_control(&segment);
                    let mut changed = Vec::new();
                    scan_progress(&clean, &mut last_percent, &mut changed);
                    for value in changed {
                        let _ = progress.send(value);
                    }
                    // Keep the last non-progress line around for diagnostics
                    if !percent_re().is_match(&clean) && !clean.trim().is_empty() {
                        last_line = Some(clean.trim().to_string());
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(
                device = device_id,
                "push produced no output for {:?}, killing it", self.idle_timeout
            );
            kill_slot(&slot).await;
            self.registry.release(device_id, &slot).await;
            return PushOutcome::failed(format!(
                "no push output for {:?}",
                self.idle_timeout
            ));
        }

        // Streams are closed; reap the child unless a kill beat us to it.
        let taken = slot.lock().await.take();
        self.registry.release(device_id, &slot).await;
        let status = match taken {
            Some(mut child) => match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(device = device_id, "failed to reap push process: {}", e);
                    return PushOutcome::failed(format!("failed to reap push process: {}", e));
                }
            },
            None => return PushOutcome::failed("push terminated"),
        };

        if !status.success() {
            let detail = match last_line {
                Some(line) => format!("push exited with {}: {}", status, line),
                None => format!("push exited with {}", status),
            };
            return PushOutcome::failed(detail);
        }

        if !self.verify_on_device(device_id, destination).await {
            warn!(
                device = device_id,
                destination, "pushed file missing on device"
            );
            return PushOutcome::failed(format!("{} missing on device after push", destination));
        }

        PushOutcome::ok()
    }

    async fn kill_device(&self, device_id: &str) -> usize {
        self.registry.kill_device(device_id).await
    }

    async fn kill_all(&self) -> usize {
        self.registry.kill_all().await
    }
}
