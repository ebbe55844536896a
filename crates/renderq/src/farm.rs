//! The embedding surface: one `RenderFarm` owns the store, queue,
//! worker pool and artifact store, and exposes the operations an HTTP
//! or desktop layer calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::artifacts::ArtifactStore;
use crate::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use crate::config::FarmConfig;
use crate::db::Database;
use crate::error::{Result, StoreError};
use crate::jobs::{JobRecord, JobStore};
use crate::queue::{ChannelQueue, QueueState, RenderUnit, TaskQueue};
use crate::render::{DeviceBackend, FrameRange, OutputFormat, RenderParams};
use crate::worker::{CancelRegistry, RenderExecutor, WorkerPool};

/// What a client asks for at submission. Unset knobs fall back to the
/// farm's configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub format: OutputFormat,
    #[serde(default)]
    pub samples: Option<u32>,
    #[serde(default)]
    pub resolution: Option<(u32, u32)>,
    #[serde(default)]
    pub frame_range: Option<FrameRange>,
    #[serde(default)]
    pub device: Option<DeviceBackend>,
}

/// Returned by [`RenderFarm::submit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub execution_handle: String,
}

pub struct RenderFarm {
    config: FarmConfig,
    store: Arc<JobStore>,
    queue: ChannelQueue,
    pool: WorkerPool,
    cancels: Arc<CancelRegistry>,
    artifacts: ArtifactStore,
    broadcaster: JobProgressBroadcaster,
}

impl RenderFarm {
    /// Builds the farm from an already validated config and starts its
    /// worker pool.
    pub fn start(config: FarmConfig) -> Result<Self> {
        let store = match &config.database_path {
            Some(path) => {
                let db = Database::open(path)?;
                Arc::new(JobStore::with_database(db)?)
            }
            None => Arc::new(JobStore::new()),
        };

        let broadcaster = JobProgressBroadcaster::new(256);
        let cancels = Arc::new(CancelRegistry::new());
        let (queue, receiver) = ChannelQueue::new(Arc::clone(&store));

        let executor = Arc::new(RenderExecutor::new(
            config.clone(),
            Arc::clone(&store),
            Arc::new(broadcaster.clone()),
            Arc::clone(&cancels),
        ));
        let pool = WorkerPool::start(executor, receiver, config.worker_count);

        info!(
            "Render farm started with {} workers, renderer {}",
            config.worker_count,
            config.renderer_binary.display()
        );

        Ok(Self {
            artifacts: ArtifactStore::from_config(&config),
            config,
            store,
            queue,
            pool,
            cancels,
            broadcaster,
        })
    }

    /// Validated upload intake: creates the job record, enqueues the
    /// render unit and records its execution handle.
    pub fn submit(&self, upload_path: &Path, request: &RenderRequest) -> Result<SubmitReceipt> {
        let params = self.materialize(request);
        params.validate()?;
        let device = request.device.unwrap_or(self.config.default_device);

        let upload_name = upload_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                StoreError::InvalidRequest(format!(
                    "upload path '{}' has no file name",
                    upload_path.display()
                ))
            })?;

        let record = self
            .store
            .create(JobRecord::new(upload_name, params, device))?;
        let job_id = record.job_id.clone();

        let handle = match self.queue.submit(RenderUnit {
            job_id: job_id.clone(),
            upload_path: upload_path.to_path_buf(),
        }) {
            Ok(handle) => handle,
            Err(e) => {
                // The record must still end terminal.
                let _ = self.store.mark_failed(&job_id, &e.to_string());
                return Err(e.into());
            }
        };
        self.store.set_execution_handle(&job_id, &handle)?;

        self.broadcaster
            .send(JobProgressEvent::from_record(&record, "job queued"));
        info!("Submitted job {} for upload '{}'", job_id, upload_name);

        Ok(SubmitReceipt {
            job_id,
            execution_handle: handle,
        })
    }

    /// Current record snapshot for one job.
    pub fn status(&self, job_id: &str) -> Result<JobRecord> {
        Ok(self.store.get(job_id)?)
    }

    /// All jobs in creation order.
    pub fn list(&self) -> Vec<JobRecord> {
        self.store.list()
    }

    /// Broker-side view of a submitted unit.
    pub fn poll_handle(&self, handle: &str) -> Result<QueueState> {
        Ok(self.queue.poll(handle)?)
    }

    /// Requests cancellation. Jobs a worker currently holds stop
    /// asynchronously via their cancel token; jobs still waiting in the
    /// queue are cancelled immediately.
    pub fn cancel(&self, job_id: &str) -> Result<JobRecord> {
        // Fail fast on unknown ids.
        let _ = self.store.get(job_id)?;

        if self.cancels.cancel(job_id) {
            info!("Cancellation requested for running job {}", job_id);
            return Ok(self.store.get(job_id)?);
        }

        let record = self.store.mark_cancelled(job_id)?;
        self.broadcaster
            .send(JobProgressEvent::from_record(&record, "job cancelled"));
        Ok(record)
    }

    /// Path of the finished deliverable.
    pub fn download(&self, job_id: &str) -> Result<PathBuf> {
        let record = self.store.get(job_id)?;
        Ok(self.artifacts.locate(&record)?)
    }

    /// Removes a job's stored artifacts.
    pub fn purge_artifacts(&self, job_id: &str) -> Result<()> {
        let _ = self.store.get(job_id)?;
        Ok(self.artifacts.purge(job_id)?)
    }

    /// Fails every job stuck non-terminal beyond the configured
    /// staleness window. Callers decide when to run this; nothing is
    /// resubmitted automatically.
    pub fn reap_orphans(&self) -> Vec<JobRecord> {
        let reaped = self
            .store
            .reap_stale(Duration::seconds(self.config.staleness_secs));
        for record in &reaped {
            self.broadcaster
                .send(JobProgressEvent::from_record(record, "job orphaned"));
        }
        reaped
    }

    /// Subscribes to the progress event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.broadcaster.subscribe()
    }

    /// Stops the worker pool and waits for workers to finish their
    /// current jobs.
    pub fn shutdown(self) {
        self.pool.shutdown();
        self.pool.wait();
    }

    fn materialize(&self, request: &RenderRequest) -> RenderParams {
        let (width, height) = request.resolution.unwrap_or(self.config.default_resolution);
        RenderParams {
            format: request.format,
            samples: request.samples.unwrap_or(self.config.default_samples),
            width,
            height,
            frame_range: request.frame_range,
        }
    }
}
