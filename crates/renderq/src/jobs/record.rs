//! The per-job record: lifecycle state plus the immutable render
//! parameters captured at submission.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::job_repo::JobRow;
use crate::render::{DeviceBackend, FrameRange, RenderParams};

/// Lifecycle state of a render job.
///
/// Forward path is `Queued -> Extracting -> Rendering -> Succeeded`.
/// `Failed` is reachable from any non-terminal state (extraction and
/// orphan reaping fail jobs that never rendered), as is `Cancelled`.
/// Terminal states have no exits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Extracting,
    Rendering,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Queued => false,
            JobState::Extracting => *self == JobState::Queued,
            JobState::Rendering => *self == JobState::Extracting,
            JobState::Succeeded => *self == JobState::Rendering,
            JobState::Failed | JobState::Cancelled => true,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Extracting => "extracting",
            JobState::Rendering => "rendering",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for JobState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "extracting" => Ok(JobState::Extracting),
            "rendering" => Ok(JobState::Rendering),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(()),
        }
    }
}

/// Authoritative record for one render job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub upload_name: String,
    pub params: RenderParams,
    pub device: DeviceBackend,
    pub state: JobState,
    /// 0..=100, never regresses.
    pub progress: u8,
    pub current_frame: Option<u32>,
    pub total_frames: Option<u32>,
    /// Resolved scene file inside the job's working directory. Set by
    /// the extraction step.
    pub source_path: Option<PathBuf>,
    /// Deliverable artifact; present exactly when `Succeeded`.
    pub output_path: Option<PathBuf>,
    /// Failure diagnostic; present exactly when `Failed`.
    pub error_detail: Option<String>,
    /// Queue handle, set once at submission.
    pub execution_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh queued record with a v4 job id.
    pub fn new(upload_name: &str, params: RenderParams, device: DeviceBackend) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            upload_name: upload_name.to_string(),
            params,
            device,
            state: JobState::Queued,
            progress: 0,
            current_frame: None,
            total_frames: None,
            source_path: None,
            output_path: None,
            error_detail: None,
            execution_handle: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn to_row(&self) -> JobRow {
        JobRow {
            id: self.job_id.clone(),
            upload_name: self.upload_name.clone(),
            scene_path: self
                .source_path
                .as_ref()
                .map(|p| p.display().to_string()),
            output_format: self.params.format.cli_name().to_string(),
            samples: self.params.samples,
            width: self.params.width,
            height: self.params.height,
            frame_start: self.params.frame_range.map(|r| r.start),
            frame_end: self.params.frame_range.map(|r| r.end),
            device: self.device.to_string(),
            state: self.state.to_string(),
            progress: self.progress,
            current_frame: self.current_frame,
            total_frames: self.total_frames,
            error: self.error_detail.clone(),
            artifact_path: self
                .output_path
                .as_ref()
                .map(|p| p.display().to_string()),
            execution_handle: self.execution_handle.clone(),
            created_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
            completed_at: self.finished_at.map(|t| t.to_rfc3339()),
        }
    }

    /// Rehydrates a persisted row. Returns `None` when enum or timestamp
    /// fields fail to parse; callers log and skip such rows.
    pub fn from_row(row: &JobRow) -> Option<Self> {
        let frame_range = match (row.frame_start, row.frame_end) {
            (Some(start), Some(end)) => Some(FrameRange { start, end }),
            _ => None,
        };

        Some(Self {
            job_id: row.id.clone(),
            upload_name: row.upload_name.clone(),
            params: RenderParams {
                format: crate::render::OutputFormat::from_cli_name(&row.output_format)?,
                samples: row.samples,
                width: row.width,
                height: row.height,
                frame_range,
            },
            device: row.device.parse().ok()?,
            state: row.state.parse().ok()?,
            progress: row.progress,
            current_frame: row.current_frame,
            total_frames: row.total_frames,
            source_path: row.scene_path.as_ref().map(PathBuf::from),
            output_path: row.artifact_path.as_ref().map(PathBuf::from),
            error_detail: row.error.clone(),
            execution_handle: row.execution_handle.clone(),
            created_at: parse_ts(&row.created_at)?,
            started_at: None,
            finished_at: row.completed_at.as_deref().and_then(parse_ts),
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
