//! Transfer coordination across attached devices
//!
//! The coordinator owns the authoritative device table and the lifecycle of
//! one transfer run at a time. Each usable device gets its own pipeline
//! task pushing that device's pending files strictly in listing order;
//! pipelines for different devices run concurrently and never wait on each
//! other.
//!
//! Every pipeline captures the run id it was spawned under and re-checks
//! it (plus its device's live status) before each push and before each
//! emission. A stop or disconnect flips that state under the write lock,
//! which both silences the rest of the pipeline and guarantees exactly one
//! terminal event per device per run.

use crate::device::{ConnectionState, DeviceProgress, DeviceSnapshot, TransferStatus};
use crate::error::Result;
use crate::events::{EventKind, StatusEvent, StatusReporter};
use crate::monitor::DeviceTransition;
use crate::push::PushExecutor;
use crate::staging::{StagedFile, StagingArea};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct DeviceEntry {
    connection: ConnectionState,
    status: TransferStatus,
    progress: Option<DeviceProgress>,
    /// Identity of the pipeline currently allowed to mutate this entry.
    /// A pipeline whose id no longer matches lost a race with a
    /// disconnect-and-reconnect and must exit without emitting.
    pipeline_id: Option<Uuid>,
    pipeline: Option<JoinHandle<()>>,
}

impl DeviceEntry {
    fn new(connection: ConnectionState) -> Self {
        Self {
            connection,
            status: TransferStatus::Idle,
            progress: None,
            pipeline_id: None,
            pipeline: None,
        }
    }
}

struct RunState {
    run_id: Uuid,
    /// Filenames verified on each device during this run. Keyed by device
    /// id rather than stored in the live entry so that a disconnect within
    /// the run does not cause verified files to be pushed again on
    /// reconnect.
    transferred: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
struct CoordinatorState {
    run: Option<RunState>,
    devices: HashMap<String, DeviceEntry>,
}

struct CoordinatorShared {
    staging: StagingArea,
    executor: Arc<dyn PushExecutor>,
    reporter: Arc<dyn StatusReporter>,
    state: RwLock<CoordinatorState>,
}

impl CoordinatorShared {
    fn emit(&self, kind: EventKind) {
        let event = StatusEvent::now(kind);
        debug!("status: {}", event);
        self.reporter.report(event);
    }
}

/// Drives transfer runs over every attached device
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<CoordinatorShared>,
}

impl TransferCoordinator {
    pub fn new(
        staging: StagingArea,
        executor: Arc<dyn PushExecutor>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorShared {
                staging,
                executor,
                reporter,
                state: RwLock::new(CoordinatorState::default()),
            }),
        }
    }

    /// Activate a transfer run
    ///
    /// No-op when a run is already active. Devices already attached when
    /// the run begins get their pipelines immediately; devices appearing
    /// later are handled by [`TransferCoordinator::on_device_transition`].
    pub async fn start_run(&self) -> Result<()> {
        let staged = self.inner.staging.list().await?;

        {
            let mut state = self.inner.state.write().await;
            if state.run.is_some() {
                debug!("transfer run already active");
                return Ok(());
            }
            let run_id = Uuid::new_v4();
            info!(%run_id, staged = staged.len(), "transfer run started");
            state.run = Some(RunState {
                run_id,
                transferred: HashMap::new(),
            });
        }
        self.inner.emit(EventKind::RunStarted {
            staged_files: staged.len(),
        });

        let connected: Vec<String> = {
            let state = self.inner.state.read().await;
            state
                .devices
                .iter()
                .filter(|(_, entry)| entry.connection.is_usable())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for device_id in connected {
            if let Err(e) = self.start_device_pipeline(&device_id).await {
                warn!(device = %device_id, "failed to start pipeline: {}", e);
            }
        }
        Ok(())
    }

    /// Stop the active run, if any
    ///
    /// Deactivates the run first so racing pipelines and progress updates
    /// go quiet, then terminates every tracked push process, emits one
    /// terminal event per device that was mid-transfer, and finishes with
    /// a single run-stopped event. Idempotent.
    pub async fn stop_run(&self) {
        let (run_id, interrupted, handles) = {
            let mut state = self.inner.state.write().await;
            let run = match state.run.take() {
                Some(run) => run,
                None => {
                    debug!("no active run to stop");
                    return;
                }
            };

            let mut interrupted = Vec::new();
            let mut handles = Vec::new();
            for (device_id, entry) in state.devices.iter_mut() {
                if let Some(handle) = entry.pipeline.take() {
                    handles.push(handle);
                }
                if entry.status == TransferStatus::Transferring {
                    let percent = entry.progress.as_ref().map(|p| p.file_percent);
                    let file = entry.progress.as_ref().and_then(|p| p.current_file.clone());
                    interrupted.push((device_id.clone(), file, percent));
                }
                entry.status = TransferStatus::Idle;
                entry.progress = None;
                entry.pipeline_id = None;
            }
            (run.run_id, interrupted, handles)
        };

        for handle in handles {
            handle.abort();
        }
        let killed = self.inner.executor.kill_all().await;
        info!(
            %run_id,
            killed,
            interrupted = interrupted.len(),
            "transfer run stopped"
        );

        for (device_id, file, percent) in interrupted {
            self.inner.emit(EventKind::DeviceFailed {
                device_id,
                file,
                reason: "run stopped".to_string(),
                file_percent: percent,
            });
        }
        self.inner.emit(EventKind::RunStopped);
    }

    /// Apply one device transition from the monitor
    pub async fn on_device_transition(&self, transition: DeviceTransition) {
        let DeviceTransition {
            device_id,
            state: connection,
            ..
        } = transition;

        if connection.is_usable() {
            let run_active = {
                let mut state = self.inner.state.write().await;
                let entry = state
                    .devices
                    .entry(device_id.clone())
                    .or_insert_with(|| DeviceEntry::new(connection));
                entry.connection = connection;
                state.run.is_some()
            };
            info!(device = %device_id, "device connected");
            self.inner.emit(EventKind::DeviceConnected {
                device_id: device_id.clone(),
            });
            if run_active {
                if let Err(e) = self.start_device_pipeline(&device_id).await {
                    warn!(device = %device_id, "failed to start pipeline: {}", e);
                }
            }
            return;
        }

        // Offline or unauthorized: the device leaves the live set. When a
        // pipeline was mid-push this is its one terminal event; the rest of
        // the pipeline exits silently against the cleared state.
        let in_flight = {
            let mut state = self.inner.state.write().await;
            match state.devices.remove(&device_id) {
                Some(entry) if entry.status == TransferStatus::Transferring => {
                    let percent = entry.progress.as_ref().map(|p| p.file_percent);
                    let file = entry.progress.as_ref().and_then(|p| p.current_file.clone());
                    Some((file, percent))
                }
                Some(_) => None,
                None => {
                    debug!(device = %device_id, "untracked device went {}", connection);
                    return;
                }
            }
        };

        if let Some((file, percent)) = in_flight {
            let killed = self.inner.executor.kill_device(&device_id).await;
            debug!(device = %device_id, killed, "terminated in-flight pushes");
            let reason = match connection {
                ConnectionState::Unauthorized => "device unauthorized".to_string(),
                _ => "device disconnected".to_string(),
            };
            self.inner.emit(EventKind::DeviceFailed {
                device_id: device_id.clone(),
                file,
                reason,
                file_percent: percent,
            });
        }

        info!(device = %device_id, state = %connection, "device lost");
        self.inner.emit(EventKind::DeviceLost {
            device_id,
            state: connection,
        });
    }

    /// Start a pipeline for one device
    ///
    /// Re-reads the staging directory, subtracts what this run already
    /// pushed to the device, and spawns the pipeline task over the
    /// remainder. No-op when no run is active, the device is not usable,
    /// or a pipeline is already running for it.
    pub async fn start_device_pipeline(&self, device_id: &str) -> Result<()> {
        let staged = self.inner.staging.list().await?;

        let kind = {
            let mut state = self.inner.state.write().await;
            let state = &mut *state;

            let run_id = match state.run.as_ref() {
                Some(run) => run.run_id,
                None => {
                    debug!(device = device_id, "no active run, not starting pipeline");
                    return Ok(());
                }
            };

            let pending: Vec<StagedFile> = {
                let done = state
                    .run
                    .as_ref()
                    .and_then(|run| run.transferred.get(device_id));
                staged
                    .into_iter()
                    .filter(|file| done.map_or(true, |set| !set.contains(&file.name)))
                    .collect()
            };

            let entry = match state.devices.get_mut(device_id) {
                Some(entry) if entry.connection.is_usable() => entry,
                _ => {
                    debug!(device = device_id, "device not usable, not starting pipeline");
                    return Ok(());
                }
            };
            if entry.status == TransferStatus::Transferring {
                debug!(device = device_id, "pipeline already running");
                return Ok(());
            }

            if pending.is_empty() {
                entry.status = TransferStatus::Idle;
                entry.progress = None;
                EventKind::NothingToPush {
                    device_id: device_id.to_string(),
                }
            } else {
                let pending_files = pending.len();
                let pipeline_id = Uuid::new_v4();
                entry.status = TransferStatus::Transferring;
                entry.progress = Some(DeviceProgress::new(pending_files));
                entry.pipeline_id = Some(pipeline_id);
                entry.pipeline = Some(tokio::spawn(run_pipeline(
                    self.inner.clone(),
                    device_id.to_string(),
                    run_id,
                    pipeline_id,
                    pending,
                )));
                info!(device = device_id, files = pending_files, "pipeline started");
                EventKind::TransferStarted {
                    device_id: device_id.to_string(),
                    pending_files,
                }
            }
        };

        self.inner.emit(kind);
        Ok(())
    }

    /// Snapshot of every tracked device, in id order
    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        let state = self.inner.state.read().await;
        let mut snapshots: Vec<DeviceSnapshot> = state
            .devices
            .iter()
            .map(|(id, entry)| DeviceSnapshot {
                id: id.clone(),
                connection: entry.connection,
                status: entry.status,
                progress: entry.progress.clone(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.read().await.run.is_some()
    }
}

/// Is this pipeline still the live one for its device and run?
fn live_entry<'a>(
    state: &'a mut CoordinatorState,
    device_id: &str,
    run_id: Uuid,
    pipeline_id: Uuid,
) -> Option<&'a mut DeviceEntry> {
    match state.run.as_ref() {
        Some(run) if run.run_id == run_id => {}
        _ => return None,
    }
    match state.devices.get_mut(device_id) {
        Some(entry)
            if entry.status == TransferStatus::Transferring
                && entry.pipeline_id == Some(pipeline_id) =>
        {
            Some(entry)
        }
        _ => None,
    }
}

enum StepOutcome {
    /// State changed under us; someone else emitted the terminal event
    Silent,
    Continue(EventKind),
    Stop(EventKind),
}

async fn run_pipeline(
    shared: Arc<CoordinatorShared>,
    device_id: String,
    run_id: Uuid,
    pipeline_id: Uuid,
    pending: Vec<StagedFile>,
) {
    let total_files = pending.len();

    for file in pending {
        // Re-check between files: a stop or disconnect silences the rest
        {
            let mut state = shared.state.write().await;
            match live_entry(&mut state, &device_id, run_id, pipeline_id) {
                Some(entry) => {
                    if let Some(progress) = entry.progress.as_mut() {
                        progress.begin_file(&file.name);
                    }
                }
                None => return,
            }
        }

        let destination = file.destination();
        debug!(device = %device_id, file = %file.name, %destination, "pushing file");

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u8>();
        let forward_shared = shared.clone();
        let forward_device = device_id.clone();
        let forward_file = file.name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(percent) = progress_rx.recv().await {
                let kind = {
                    let mut state = forward_shared.state.write().await;
                    match live_entry(&mut state, &forward_device, run_id, pipeline_id) {
                        Some(entry) => entry.progress.as_mut().and_then(|progress| {
                            if progress.update_percent(percent) {
                                Some(EventKind::PushProgress {
                                    device_id: forward_device.clone(),
                                    file: forward_file.clone(),
                                    file_percent: progress.file_percent,
                                    files_completed: progress.files_completed,
                                    total_files: progress.total_files,
                                    overall_percent: progress.overall_percent(),
                                })
                            } else {
                                None
                            }
                        }),
                        None => None,
                    }
                };
                if let Some(kind) = kind {
                    forward_shared.emit(kind);
                }
            }
        });

        let outcome = shared
            .executor
            .push(&device_id, &file.path, &destination, progress_tx)
            .await;
        // Drain all progress before acting on the outcome
        let _ = forwarder.await;

        let step = {
            let mut state = shared.state.write().await;
            let state = &mut *state;
            let run_live = matches!(state.run.as_ref(), Some(run) if run.run_id == run_id);
            if !run_live {
                StepOutcome::Silent
            } else {
                match state.devices.get_mut(&device_id) {
                    Some(entry)
                        if entry.status == TransferStatus::Transferring
                            && entry.pipeline_id == Some(pipeline_id) =>
                    {
                        if outcome.success {
                            if let Some(run) = state.run.as_mut() {
                                run.transferred
                                    .entry(device_id.clone())
                                    .or_default()
                                    .insert(file.name.clone());
                            }
                            let (files_completed, overall_percent) = match entry.progress.as_mut()
                            {
                                Some(progress) => {
                                    progress.complete_file();
                                    (progress.files_completed, progress.overall_percent())
                                }
                                None => (0, 0),
                            };
                            StepOutcome::Continue(EventKind::FilePushed {
                                device_id: device_id.clone(),
                                file: file.name.clone(),
                                files_completed,
                                total_files,
                                overall_percent,
                            })
                        } else {
                            let percent = entry.progress.as_ref().map(|p| p.file_percent);
                            entry.status = TransferStatus::Failed;
                            entry.progress = None;
                            entry.pipeline_id = None;
                            entry.pipeline = None;
                            StepOutcome::Stop(EventKind::DeviceFailed {
                                device_id: device_id.clone(),
                                file: Some(file.name.clone()),
                                reason: outcome
                                    .detail
                                    .unwrap_or_else(|| "push failed".to_string()),
                                file_percent: percent,
                            })
                        }
                    }
                    _ => StepOutcome::Silent,
                }
            }
        };

        match step {
            StepOutcome::Silent => return,
            StepOutcome::Continue(kind) => shared.emit(kind),
            StepOutcome::Stop(kind) => {
                warn!(device = %device_id, file = %file.name, "push failed, stopping pipeline");
                shared.emit(kind);
                return;
            }
        }
    }

    // Every pending file reached the device
    let kind = {
        let mut state = shared.state.write().await;
        match live_entry(&mut state, &device_id, run_id, pipeline_id) {
            Some(entry) => {
                entry.status = TransferStatus::Completed;
                entry.progress = None;
                entry.pipeline_id = None;
                entry.pipeline = None;
                Some(EventKind::DeviceCompleted {
                    device_id: device_id.clone(),
                    files_pushed: total_files,
                })
            }
            None => None,
        }
    };
    if let Some(kind) = kind {
        info!(device = %device_id, files = total_files, "device completed");
        shared.emit(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::reporter;
    use crate::push::{ProgressSender, PushOutcome};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct InstantExecutor;

    #[async_trait]
    impl PushExecutor for InstantExecutor {
        async fn push(
            &self,
            _device_id: &str,
            _source: &Path,
            _destination: &str,
            _progress: ProgressSender,
        ) -> PushOutcome {
            PushOutcome::ok()
        }

        async fn kill_device(&self, _device_id: &str) -> usize {
            0
        }

        async fn kill_all(&self) -> usize {
            0
        }
    }

    fn recording() -> (Arc<dyn StatusReporter>, Arc<Mutex<Vec<StatusEvent>>>) {
        let seen: Arc<Mutex<Vec<StatusEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (reporter(move |event| sink.lock().unwrap().push(event)), seen)
    }

    fn transition(device_id: &str, raw: &str) -> DeviceTransition {
        DeviceTransition {
            device_id: device_id.to_string(),
            state: ConnectionState::from_raw(raw),
            raw_state: raw.to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (reporter, seen) = recording();
        let coordinator = TransferCoordinator::new(
            StagingArea::new(dir.path()),
            Arc::new(InstantExecutor),
            reporter,
        );

        coordinator.start_run().await.unwrap();
        coordinator.start_run().await.unwrap();

        let starts = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::RunStarted { .. }))
            .count();
        assert_eq!(starts, 1);
        assert!(coordinator.is_running().await);
    }

    #[tokio::test]
    async fn test_start_run_fails_without_staging_dir() {
        let (reporter, seen) = recording();
        let coordinator = TransferCoordinator::new(
            StagingArea::new("/nonexistent/sideload-staging"),
            Arc::new(InstantExecutor),
            reporter,
        );

        assert!(coordinator.start_run().await.is_err());
        assert!(!coordinator.is_running().await);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_run_is_noop() {
        let dir = TempDir::new().unwrap();
        let (reporter, seen) = recording();
        let coordinator = TransferCoordinator::new(
            StagingArea::new(dir.path()),
            Arc::new(InstantExecutor),
            reporter,
        );

        coordinator.stop_run().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connected_device_with_empty_staging_goes_idle() {
        let dir = TempDir::new().unwrap();
        let (reporter, seen) = recording();
        let coordinator = TransferCoordinator::new(
            StagingArea::new(dir.path()),
            Arc::new(InstantExecutor),
            reporter,
        );

        coordinator.start_run().await.unwrap();
        coordinator
            .on_device_transition(transition("R58M123ABCD", "device"))
            .await;

        let events = seen.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, EventKind::DeviceConnected { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, EventKind::NothingToPush { .. })));
        drop(events);

        let devices = coordinator.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].status, TransferStatus::Idle);
    }

    #[tokio::test]
    async fn test_untracked_offline_transition_is_ignored() {
        let dir = TempDir::new().unwrap();
        let (reporter, seen) = recording();
        let coordinator = TransferCoordinator::new(
            StagingArea::new(dir.path()),
            Arc::new(InstantExecutor),
            reporter,
        );

        coordinator
            .on_device_transition(transition("R58M123ABCD", "offline"))
            .await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(coordinator.devices().await.is_empty());
    }
}
