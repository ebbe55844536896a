//! Job repository — CRUD operations for the `jobs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub upload_name: String,
    pub scene_path: Option<String>,
    pub output_format: String,
    pub samples: u32,
    pub width: u32,
    pub height: u32,
    pub frame_start: Option<i64>,
    pub frame_end: Option<i64>,
    pub device: String,
    pub state: String,
    pub progress: u8,
    pub current_frame: Option<u32>,
    pub total_frames: Option<u32>,
    pub error: Option<String>,
    pub artifact_path: Option<String>,
    pub execution_handle: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            upload_name: row.get("upload_name")?,
            scene_path: row.get("scene_path")?,
            output_format: row.get("output_format")?,
            samples: row.get("samples")?,
            width: row.get("width")?,
            height: row.get("height")?,
            frame_start: row.get("frame_start")?,
            frame_end: row.get("frame_end")?,
            device: row.get("device")?,
            state: row.get("state")?,
            progress: row.get("progress")?,
            current_frame: row.get("current_frame")?,
            total_frames: row.get("total_frames")?,
            error: row.get("error")?,
            artifact_path: row.get("artifact_path")?,
            execution_handle: row.get("execution_handle")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, upload_name, scene_path, output_format, samples, width,
             height, frame_start, frame_end, device, state, progress, current_frame,
             total_frames, error, artifact_path, execution_handle, created_at, updated_at,
             completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20)",
            params![
                job.id,
                job.upload_name,
                job.scene_path,
                job.output_format,
                job.samples,
                job.width,
                job.height,
                job.frame_start,
                job.frame_end,
                job.device,
                job.state,
                job.progress,
                job.current_frame,
                job.total_frames,
                job.error,
                job.artifact_path,
                job.execution_handle,
                job.created_at,
                job.updated_at,
                job.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Updates an existing job row. All fields except `id` and `created_at`
/// are overwritten.
pub fn update(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET upload_name=?2, scene_path=?3, output_format=?4, samples=?5,
             width=?6, height=?7, frame_start=?8, frame_end=?9, device=?10, state=?11,
             progress=?12, current_frame=?13, total_frames=?14, error=?15, artifact_path=?16,
             execution_handle=?17, updated_at=?18, completed_at=?19
             WHERE id=?1",
            params![
                job.id,
                job.upload_name,
                job.scene_path,
                job.output_format,
                job.samples,
                job.width,
                job.height,
                job.frame_start,
                job.frame_end,
                job.device,
                job.state,
                job.progress,
                job.current_frame,
                job.total_frames,
                job.error,
                job.artifact_path,
                job.execution_handle,
                job.updated_at,
                job.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Lists all jobs in creation order.
pub fn list_all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")?;
        let rows: Vec<JobRow> = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
