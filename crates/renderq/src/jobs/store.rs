//! Authoritative in-memory job store with optional SQLite mirroring.
//!
//! The map lock is held only to look up the per-job handle; all record
//! mutation happens under that job's own mutex, so concurrent updates to
//! different jobs never contend. Persistence failures are logged and do
//! not fail the job path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, Utc};
use log::warn;

use crate::db::{job_repo, Database, DatabaseError};
use crate::error::StoreError;
use crate::jobs::record::{JobRecord, JobState};
use crate::render::progress::DiagnosticKind;

struct Inner {
    jobs: HashMap<String, Arc<Mutex<JobRecord>>>,
    /// Job ids in creation order.
    order: Vec<String>,
}

pub struct JobStore {
    inner: Mutex<Inner>,
    db: Option<Database>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding a record lock leaves the data consistent
    // enough to read; recover instead of propagating poison.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                order: Vec::new(),
            }),
            db: None,
        }
    }

    /// Opens a store mirrored to SQLite, rehydrating any records already
    /// persisted there. Rows that fail to parse are logged and skipped.
    pub fn with_database(db: Database) -> Result<Self, DatabaseError> {
        let mut jobs = HashMap::new();
        let mut order = Vec::new();

        for row in job_repo::list_all(&db)? {
            match JobRecord::from_row(&row) {
                Some(record) => {
                    order.push(record.job_id.clone());
                    jobs.insert(record.job_id.clone(), Arc::new(Mutex::new(record)));
                }
                None => warn!("Skipping unparseable job row '{}'", row.id),
            }
        }

        Ok(Self {
            inner: Mutex::new(Inner { jobs, order }),
            db: Some(db),
        })
    }

    /// Registers a new record. The record's id must be unused.
    pub fn create(&self, record: JobRecord) -> Result<JobRecord, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.jobs.contains_key(&record.job_id) {
            return Err(StoreError::InvalidRequest(format!(
                "job id {} already exists",
                record.job_id
            )));
        }

        inner.order.push(record.job_id.clone());
        inner
            .jobs
            .insert(record.job_id.clone(), Arc::new(Mutex::new(record.clone())));
        drop(inner);

        if let Some(db) = &self.db {
            if let Err(e) = job_repo::insert(db, &record.to_row()) {
                warn!("Failed to persist new job {}: {}", record.job_id, e);
            }
        }

        Ok(record)
    }

    pub fn get(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        let handle = self.handle(job_id)?;
        let record = lock(&handle);
        Ok(record.clone())
    }

    /// All records in creation order.
    pub fn list(&self) -> Vec<JobRecord> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .map(|h| lock(h).clone())
            .collect()
    }

    /// Records the queue handle. A handle is set exactly once.
    pub fn set_execution_handle(&self, job_id: &str, handle: &str) -> Result<(), StoreError> {
        self.with_record(job_id, |record| {
            if record.execution_handle.is_some() {
                return Err(StoreError::InvalidRequest(format!(
                    "execution handle already set for job {}",
                    record.job_id
                )));
            }
            record.execution_handle = Some(handle.to_string());
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Moves a job along the non-payload transitions (`Extracting`,
    /// `Rendering`, `Cancelled`). Succeeded and Failed carry payloads and
    /// have dedicated methods.
    pub fn transition(&self, job_id: &str, to: JobState) -> Result<JobRecord, StoreError> {
        if matches!(to, JobState::Succeeded | JobState::Failed) {
            return Err(StoreError::InvalidRequest(format!(
                "transition to {} requires an outcome payload",
                to
            )));
        }
        self.with_record(job_id, |record| {
            apply_transition(record, to)?;
            Ok(record.clone())
        })
    }

    pub fn mark_succeeded(
        &self,
        job_id: &str,
        output_path: &Path,
    ) -> Result<JobRecord, StoreError> {
        self.with_record(job_id, |record| {
            apply_transition(record, JobState::Succeeded)?;
            record.output_path = Some(output_path.to_path_buf());
            record.progress = 100;
            Ok(record.clone())
        })
    }

    pub fn mark_failed(&self, job_id: &str, error_detail: &str) -> Result<JobRecord, StoreError> {
        self.with_record(job_id, |record| {
            apply_transition(record, JobState::Failed)?;
            record.error_detail = Some(error_detail.to_string());
            Ok(record.clone())
        })
    }

    pub fn mark_cancelled(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        self.transition(job_id, JobState::Cancelled)
    }

    /// Records the resolved scene path once extraction picked it.
    pub fn set_source_path(&self, job_id: &str, source: &Path) -> Result<(), StoreError> {
        self.with_record(job_id, |record| {
            record.source_path = Some(source.to_path_buf());
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Monotonic progress update. Regressing percentages and updates to
    /// terminal jobs are ignored, not errors: late renderer output after
    /// a cancellation is expected.
    pub fn update_progress(
        &self,
        job_id: &str,
        percent: u8,
        frame: Option<(u32, u32)>,
    ) -> Result<JobRecord, StoreError> {
        self.with_record(job_id, |record| {
            if !record.state.is_terminal() && percent >= record.progress {
                record.progress = percent.min(100);
                if let Some((current, total)) = frame {
                    record.current_frame = Some(current);
                    record.total_frames = Some(total);
                }
                record.updated_at = Utc::now();
            }
            Ok(record.clone())
        })
    }

    /// Fails every non-terminal job not updated within `max_age`,
    /// returning the reaped records. No resubmission happens here.
    pub fn reap_stale(&self, max_age: Duration) -> Vec<JobRecord> {
        let cutoff = Utc::now() - max_age;
        let stale_ids: Vec<String> = self
            .list()
            .into_iter()
            .filter(|r| !r.state.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.job_id)
            .collect();

        let mut reaped = Vec::new();
        for job_id in stale_ids {
            let age_secs = max_age.num_seconds();
            let detail = format!(
                "{}: job made no progress for over {}s",
                DiagnosticKind::Orphaned,
                age_secs
            );
            match self.mark_failed(&job_id, &detail) {
                Ok(record) => {
                    warn!("Reaped orphaned job {}", job_id);
                    reaped.push(record);
                }
                // Lost a race with a legitimate terminal transition.
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => warn!("Failed to reap job {}: {}", job_id, e),
            }
        }
        reaped
    }

    fn handle(&self, job_id: &str) -> Result<Arc<Mutex<JobRecord>>, StoreError> {
        let inner = lock(&self.inner);
        inner
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    fn with_record<R>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobRecord) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let handle = self.handle(job_id)?;
        let mut record = lock(&handle);
        let result = f(&mut record)?;

        // Mirror under the record lock so racing updates to one job
        // persist in the same order they applied.
        if let Some(db) = &self.db {
            if let Err(e) = job_repo::update(db, &record.to_row()) {
                warn!("Failed to persist update for job {}: {}", record.job_id, e);
            }
        }
        Ok(result)
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates and applies a state move plus its timestamp side effects.
fn apply_transition(record: &mut JobRecord, to: JobState) -> Result<(), StoreError> {
    if !record.state.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            job_id: record.job_id.clone(),
            from: record.state.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    if to == JobState::Rendering {
        record.started_at = Some(now);
    }
    if to.is_terminal() {
        record.finished_at = Some(now);
    }
    record.state = to;
    record.updated_at = now;
    Ok(())
}
