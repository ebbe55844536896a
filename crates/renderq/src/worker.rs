//! Worker pool executing render units.
//!
//! A fixed set of threads consumes units from the queue channel; each
//! worker runs one job at a time through the full pipeline (extract,
//! render, register) and guarantees the job ends in a terminal state no
//! matter which step fails. Redelivered units for jobs that already left
//! `Queued` are dropped without spawning anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use tracing::info_span;

use crate::artifacts::ArtifactStore;
use crate::broadcast::{JobProgressEvent, ProgressSink};
use crate::config::FarmConfig;
use crate::error::StoreError;
use crate::jobs::{JobState, JobStore};
use crate::queue::RenderUnit;
use crate::render::progress::DiagnosticKind;
use crate::render::{command, CancelToken, RenderDriver, TerminalOutcome};
use crate::resolver::ArchiveResolver;

/// Live cancellation tokens for jobs currently held by a worker.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, job_id: &str) -> CancelToken {
        let token = CancelToken::new();
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.insert(job_id.to_string(), token.clone());
        token
    }

    fn remove(&self, job_id: &str) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(job_id);
    }

    /// Flags the job's token if a worker currently holds it.
    pub fn cancel(&self, job_id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Runs one render unit end to end against the shared store.
pub struct RenderExecutor {
    resolver: ArchiveResolver,
    driver: RenderDriver,
    artifacts: ArtifactStore,
    store: Arc<JobStore>,
    sink: Arc<dyn ProgressSink>,
    cancels: Arc<CancelRegistry>,
    config: FarmConfig,
}

impl RenderExecutor {
    pub fn new(
        config: FarmConfig,
        store: Arc<JobStore>,
        sink: Arc<dyn ProgressSink>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            resolver: ArchiveResolver::from_config(&config),
            driver: RenderDriver::from_config(&config),
            artifacts: ArtifactStore::from_config(&config),
            store,
            sink,
            cancels,
            config,
        }
    }

    /// Executes a unit. Every outcome lands the job in a terminal state;
    /// units for jobs that already left `Queued` are no-ops.
    pub fn execute(&self, unit: &RenderUnit) {
        let span = info_span!("render_job", job_id = %unit.job_id);
        let _guard = span.enter();

        let record = match self.store.get(&unit.job_id) {
            Ok(record) => record,
            Err(e) => {
                warn!("Dropping unit for unknown job {}: {}", unit.job_id, e);
                return;
            }
        };
        if record.state != JobState::Queued {
            debug!(
                "Ignoring redelivered unit for job {} in state {}",
                unit.job_id, record.state
            );
            return;
        }

        let token = self.cancels.register(&unit.job_id);
        self.run_pipeline(unit, &token);
        self.cancels.remove(&unit.job_id);
    }

    fn run_pipeline(&self, unit: &RenderUnit, token: &CancelToken) {
        let job_id = &unit.job_id;

        if !self.advance(job_id, JobState::Extracting, "extracting scene") {
            return;
        }

        let resolved = match self.resolver.resolve(job_id, &unit.upload_path) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail(job_id, &e.to_string());
                return;
            }
        };
        if let Err(e) = self.store.set_source_path(job_id, &resolved.scene_path) {
            self.fail(job_id, &e.to_string());
            return;
        }

        if token.is_cancelled() {
            self.finish_cancelled(job_id);
            return;
        }
        if !self.advance(job_id, JobState::Rendering, "rendering") {
            return;
        }

        let record = match self.store.get(job_id) {
            Ok(record) => record,
            Err(e) => {
                error!("Job {} vanished mid-pipeline: {}", job_id, e);
                return;
            }
        };
        let output_dir = self.artifacts.job_dir(job_id);
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            self.fail(job_id, &format!("cannot create output dir: {}", e));
            return;
        }

        let spec = command::build(
            &self.config.renderer_binary,
            &resolved.scene_path,
            &output_dir,
            &record.params,
            record.device,
        );

        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&self.sink);
        let progress_job = job_id.clone();
        let on_progress = move |obs: crate::render::driver::ProgressObservation| {
            if let Ok(updated) = store.update_progress(&progress_job, obs.percent, obs.frame) {
                let message = match obs.frame {
                    Some((current, total)) => format!("rendering frame {} of {}", current, total),
                    None => format!("rendering, {}%", obs.percent),
                };
                sink.emit(JobProgressEvent::from_record(&updated, &message));
            }
        };

        match self.driver.run(&spec, &on_progress, token) {
            Ok(TerminalOutcome::Succeeded(paths)) => match self.artifacts.register(job_id, &paths)
            {
                Ok(deliverable) => self.finish_succeeded(job_id, &deliverable),
                Err(e) => self.fail(
                    job_id,
                    &format!("{}: {}", DiagnosticKind::PackagingFailed, e),
                ),
            },
            Ok(TerminalOutcome::Failed(diagnostic)) => self.fail(job_id, &diagnostic.detail()),
            Ok(TerminalOutcome::Cancelled) => self.finish_cancelled(job_id),
            Err(e) => self.fail(job_id, &e.to_string()),
        }
    }

    /// Non-payload transition plus event emission. Returns false when the
    /// job turned terminal underneath us (a concurrent cancel).
    fn advance(&self, job_id: &str, to: JobState, message: &str) -> bool {
        match self.store.transition(job_id, to) {
            Ok(record) => {
                self.sink.emit(JobProgressEvent::from_record(&record, message));
                true
            }
            Err(StoreError::InvalidTransition { .. }) => {
                debug!("Job {} already terminal, skipping {}", job_id, to);
                false
            }
            Err(e) => {
                error!("Transition of job {} to {} failed: {}", job_id, to, e);
                false
            }
        }
    }

    fn finish_succeeded(&self, job_id: &str, deliverable: &std::path::Path) {
        match self.store.mark_succeeded(job_id, deliverable) {
            Ok(record) => {
                info!("Job {} succeeded: {}", job_id, deliverable.display());
                self.sink
                    .emit(JobProgressEvent::from_record(&record, "render complete"));
            }
            Err(e) => warn!("Could not mark job {} succeeded: {}", job_id, e),
        }
    }

    fn finish_cancelled(&self, job_id: &str) {
        match self.store.mark_cancelled(job_id) {
            Ok(record) => {
                info!("Job {} cancelled", job_id);
                self.sink
                    .emit(JobProgressEvent::from_record(&record, "job cancelled"));
            }
            // The facade may have marked it already.
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => warn!("Could not mark job {} cancelled: {}", job_id, e),
        }
    }

    fn fail(&self, job_id: &str, detail: &str) {
        match self.store.mark_failed(job_id, detail) {
            Ok(record) => {
                warn!("Job {} failed: {}", job_id, detail);
                self.sink
                    .emit(JobProgressEvent::from_record(&record, "job failed"));
            }
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => warn!("Could not mark job {} failed: {}", job_id, e),
        }
    }
}

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` threads consuming from `receiver`.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn start(
        executor: Arc<RenderExecutor>,
        receiver: Receiver<RenderUnit>,
        worker_count: usize,
    ) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let unit_rx = receiver.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_executor = Arc::clone(&executor);

            let handle = thread::spawn(move || {
                run_worker(worker_id, unit_rx, shutdown_flag, worker_executor);
            });
            workers.push(handle);
        }

        info!("Started {} render workers", worker_count);
        Self { workers, shutdown }
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    receiver: Receiver<RenderUnit>,
    shutdown: Arc<AtomicBool>,
    executor: Arc<RenderExecutor>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(unit) => {
                debug!("Worker {} picked up job {}", worker_id, unit.job_id);
                executor.execute(&unit);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} unit channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use crate::broadcast::NoopSink;
    use crate::jobs::JobRecord;
    use crate::render::{DeviceBackend, OutputFormat, RenderParams};

    fn params() -> RenderParams {
        RenderParams {
            format: OutputFormat::Png,
            samples: 4,
            width: 64,
            height: 64,
            frame_range: None,
        }
    }

    /// A fake renderer that logs each invocation and emits a minimal
    /// successful still render.
    fn fake_renderer(dir: &Path, invocation_log: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-renderer.sh");
        // The --output argument follows "--output" in the argv.
        let body = format!(
            "#!/bin/sh\n\
             echo run >> '{log}'\n\
             out=''\n\
             prev=''\n\
             for arg in \"$@\"; do\n\
               if [ \"$prev\" = '--output' ]; then out=\"$arg\"; fi\n\
               prev=\"$arg\"\n\
             done\n\
             echo 'Sample 2/4'\n\
             echo 'Sample 4/4'\n\
             touch \"$out\"\n\
             echo \"Saved: '$out'\"\n",
            log = invocation_log.display()
        );
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn test_config(root: &Path, renderer: &Path) -> FarmConfig {
        crate::config::load_config_from_str(&format!(
            r#"{{
                "renderer_binary": "{renderer}",
                "default_device": "cpu",
                "working_dir_root": "{root}/uploads",
                "artifact_dir_root": "{root}/rendered",
                "poll_interval_ms": 20,
                "kill_grace_ms": 500
            }}"#,
            renderer = renderer.display(),
            root = root.display()
        ))
        .unwrap()
    }

    fn executor(config: FarmConfig, store: Arc<JobStore>) -> RenderExecutor {
        RenderExecutor::new(
            config,
            store,
            Arc::new(NoopSink),
            Arc::new(CancelRegistry::new()),
        )
    }

    #[test]
    fn test_execute_runs_job_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("invocations.log");
        let renderer = fake_renderer(dir.path(), &log);

        let upload = dir.path().join("monkey.blend");
        std::fs::write(&upload, b"BLENDER").unwrap();

        let store = Arc::new(JobStore::new());
        let record = store
            .create(JobRecord::new("monkey.blend", params(), DeviceBackend::Cpu))
            .unwrap();

        let exec = executor(test_config(dir.path(), &renderer), Arc::clone(&store));
        exec.execute(&RenderUnit {
            job_id: record.job_id.clone(),
            upload_path: upload,
        });

        let finished = store.get(&record.job_id).unwrap();
        assert_eq!(finished.state, JobState::Succeeded);
        assert_eq!(finished.progress, 100);
        assert!(finished.output_path.as_ref().unwrap().is_file());
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_resolve_failure_lands_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("invocations.log");
        let renderer = fake_renderer(dir.path(), &log);

        let store = Arc::new(JobStore::new());
        let record = store
            .create(JobRecord::new("gone.zip", params(), DeviceBackend::Cpu))
            .unwrap();

        let exec = executor(test_config(dir.path(), &renderer), Arc::clone(&store));
        exec.execute(&RenderUnit {
            job_id: record.job_id.clone(),
            upload_path: dir.path().join("gone.zip"),
        });

        let finished = store.get(&record.job_id).unwrap();
        assert_eq!(finished.state, JobState::Failed);
        assert!(finished.error_detail.is_some());
        // Renderer never ran.
        assert!(!log.exists());
    }

    #[test]
    fn test_redelivered_unit_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("invocations.log");
        let renderer = fake_renderer(dir.path(), &log);

        let upload = dir.path().join("monkey.blend");
        std::fs::write(&upload, b"BLENDER").unwrap();

        let store = Arc::new(JobStore::new());
        let record = store
            .create(JobRecord::new("monkey.blend", params(), DeviceBackend::Cpu))
            .unwrap();

        let exec = executor(test_config(dir.path(), &renderer), Arc::clone(&store));
        let unit = RenderUnit {
            job_id: record.job_id.clone(),
            upload_path: upload,
        };
        exec.execute(&unit);
        // Redelivery of the same unit after success.
        exec.execute(&unit);

        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);
        assert_eq!(
            store.get(&record.job_id).unwrap().state,
            JobState::Succeeded
        );
    }

    #[test]
    fn test_unit_for_unknown_job_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = fake_renderer(dir.path(), &dir.path().join("log"));
        let store = Arc::new(JobStore::new());
        let exec = executor(test_config(dir.path(), &renderer), store);

        exec.execute(&RenderUnit {
            job_id: "no-such-job".to_string(),
            upload_path: dir.path().join("x.blend"),
        });
    }

    #[test]
    fn test_pool_processes_unit_from_channel() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("invocations.log");
        let renderer = fake_renderer(dir.path(), &log);

        let upload = dir.path().join("monkey.blend");
        std::fs::write(&upload, b"BLENDER").unwrap();

        let store = Arc::new(JobStore::new());
        let record = store
            .create(JobRecord::new("monkey.blend", params(), DeviceBackend::Cpu))
            .unwrap();

        let exec = Arc::new(executor(test_config(dir.path(), &renderer), Arc::clone(&store)));
        let (sender, receiver) = crossbeam_channel::bounded(4);
        let pool = WorkerPool::start(exec, receiver, 2);

        sender
            .send(RenderUnit {
                job_id: record.job_id.clone(),
                upload_path: upload,
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let state = store.get(&record.job_id).unwrap().state;
            if state.is_terminal() {
                assert_eq!(state, JobState::Succeeded);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never finished");
            thread::sleep(Duration::from_millis(20));
        }

        pool.shutdown();
        assert!(pool.is_shutdown());
        pool.wait();
    }
}
