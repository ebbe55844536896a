//! Task queue adapter.
//!
//! `TaskQueue` is the seam a distributed broker would implement; the
//! in-process `ChannelQueue` backs the worker pool over a bounded
//! crossbeam channel and answers `poll` from the job store. Execution
//! handles are opaque strings, one per submission.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::{JobState, JobStore};

/// One unit of render work: everything a worker needs to take a job from
/// upload to terminal state.
#[derive(Debug, Clone)]
pub struct RenderUnit {
    pub job_id: String,
    pub upload_path: PathBuf,
}

/// Broker-side view of a submitted unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Started,
    Success,
    Failure,
    Revoked,
}

impl From<JobState> for QueueState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Queued => QueueState::Pending,
            JobState::Extracting | JobState::Rendering => QueueState::Started,
            JobState::Succeeded => QueueState::Success,
            JobState::Failed => QueueState::Failure,
            JobState::Cancelled => QueueState::Revoked,
        }
    }
}

/// Submission and observation contract for render units.
pub trait TaskQueue: Send + Sync {
    /// Enqueues a unit, returning its execution handle.
    fn submit(&self, unit: RenderUnit) -> Result<String, QueueError>;

    /// Current state of a previously submitted unit.
    fn poll(&self, handle: &str) -> Result<QueueState, QueueError>;
}

/// In-process queue over an unbounded channel, answering polls from the
/// job store. Submission never blocks: concurrency is bounded by the
/// worker pool draining the receiver, not by the channel.
pub struct ChannelQueue {
    sender: Sender<RenderUnit>,
    handles: Mutex<HashMap<String, String>>,
    store: Arc<JobStore>,
}

impl ChannelQueue {
    /// Creates the queue plus the receiver end the worker pool consumes.
    pub fn new(store: Arc<JobStore>) -> (Self, Receiver<RenderUnit>) {
        let (sender, receiver) = unbounded();
        (
            Self {
                sender,
                handles: Mutex::new(HashMap::new()),
                store,
            },
            receiver,
        )
    }
}

impl TaskQueue for ChannelQueue {
    fn submit(&self, unit: RenderUnit) -> Result<String, QueueError> {
        let handle = Uuid::new_v4().to_string();
        let job_id = unit.job_id.clone();

        self.sender.send(unit).map_err(|_| QueueError::Closed)?;

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.insert(handle.clone(), job_id.clone());
        debug!("Submitted job {} as handle {}", job_id, handle);
        Ok(handle)
    }

    fn poll(&self, handle: &str) -> Result<QueueState, QueueError> {
        let job_id = {
            let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles
                .get(handle)
                .cloned()
                .ok_or_else(|| QueueError::UnknownHandle(handle.to_string()))?
        };

        let record = self
            .store
            .get(&job_id)
            .map_err(|_| QueueError::UnknownHandle(handle.to_string()))?;
        Ok(record.state.into())
    }
}
