//! Job progress broadcaster for real-time status streaming.
//!
//! Embedders (an SSE or WebSocket layer, a desktop shell) subscribe to a
//! `tokio::sync::broadcast` channel of serialized events. The worker only
//! talks to the [`ProgressSink`] trait, so tests can swap in `NoopSink`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::jobs::{JobRecord, JobState};

/// Progress event for a render job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    /// Unique job identifier.
    pub job_id: String,
    /// Original upload filename.
    pub upload_name: String,
    /// Lifecycle state at the time of the event.
    pub state: JobState,
    /// Progress percentage, 0 to 100.
    pub progress: u8,
    /// Current frame position within the requested range (animations).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_frame: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u32>,
    /// Human-readable message describing current activity.
    pub message: String,
    /// Timestamp of this event.
    pub timestamp: DateTime<Utc>,
    /// Artifact path (set on success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Error detail (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    /// An event snapshotting the given record.
    pub fn from_record(record: &JobRecord, message: &str) -> Self {
        Self {
            job_id: record.job_id.clone(),
            upload_name: record.upload_name.clone(),
            state: record.state,
            progress: record.progress,
            current_frame: record.current_frame,
            total_frames: record.total_frames,
            message: message.to_string(),
            timestamp: Utc::now(),
            output_path: record.output_path.as_ref().map(|p| p.display().to_string()),
            error: record.error_detail.clone(),
        }
    }
}

/// Consumer seam for progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: JobProgressEvent);
}

/// Discards every event. Used in tests and headless embeddings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: JobProgressEvent) {}
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressSink for JobProgressBroadcaster {
    fn emit(&self, event: JobProgressEvent) {
        self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{DeviceBackend, OutputFormat, RenderParams};

    fn record() -> JobRecord {
        JobRecord::new(
            "scene.zip",
            RenderParams {
                format: OutputFormat::Png,
                samples: 16,
                width: 320,
                height: 240,
                frame_range: None,
            },
            DeviceBackend::Cpu,
        )
    }

    #[test]
    fn test_event_snapshots_record() {
        let mut r = record();
        r.state = JobState::Rendering;
        r.progress = 42;
        r.current_frame = Some(2);
        r.total_frames = Some(5);

        let event = JobProgressEvent::from_record(&r, "rendering frame 2 of 5");
        assert_eq!(event.job_id, r.job_id);
        assert_eq!(event.state, JobState::Rendering);
        assert_eq!(event.progress, 42);
        assert_eq!(event.current_frame, Some(2));
        assert!(event.output_path.is_none());
    }

    #[test]
    fn test_broadcast_reaches_subscriber() {
        let broadcaster = JobProgressBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();

        broadcaster.emit(JobProgressEvent::from_record(&record(), "queued"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.state, JobState::Queued);
        assert_eq!(event.message, "queued");
    }

    #[test]
    fn test_send_without_subscribers_is_fine() {
        let broadcaster = JobProgressBroadcaster::new(4);
        broadcaster.send(JobProgressEvent::from_record(&record(), "queued"));
    }

    #[test]
    fn test_event_serialization_is_camel_case() {
        let event = JobProgressEvent::from_record(&record(), "queued");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"jobId\""));
        assert!(json.contains("\"uploadName\""));
        // Absent optionals are omitted entirely.
        assert!(!json.contains("outputPath"));
        assert!(!json.contains("currentFrame"));
    }
}
