//! Storage and packaging of finished render outputs.
//!
//! Each job owns a directory under the artifact root. A single produced
//! file is the deliverable as-is; multiple files (image sequences) are
//! packaged into one zip so a download is always exactly one file.
//! Packaging failure is its own failure class, distinct from a render
//! failure: the frames exist, the deliverable does not.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::config::FarmConfig;
use crate::error::ArtifactError;
use crate::jobs::{JobRecord, JobState};

const PACKAGE_NAME: &str = "render_output.zip";

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn from_config(config: &FarmConfig) -> Self {
        Self::new(config.artifact_dir_root.clone())
    }

    /// The directory owned by one job.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Registers the produced files for a job and returns the single
    /// deliverable path. `produced` must be non-empty.
    pub fn register(&self, job_id: &str, produced: &[PathBuf]) -> Result<PathBuf, ArtifactError> {
        let register_err = |reason: String| ArtifactError::Register {
            job_id: job_id.to_string(),
            reason,
        };

        let dir = self.job_dir(job_id);
        std::fs::create_dir_all(&dir).map_err(|e| register_err(e.to_string()))?;

        match produced {
            [] => Err(register_err("no produced files".to_string())),
            [single] => {
                let target = place_file(single, &dir).map_err(|e| register_err(e.to_string()))?;
                info!("Registered artifact for job {}: {}", job_id, target.display());
                Ok(target)
            }
            many => {
                let target = dir.join(PACKAGE_NAME);
                package_zip(many, &target).map_err(|e| register_err(e.to_string()))?;
                info!(
                    "Packaged {} files into {} for job {}",
                    many.len(),
                    target.display(),
                    job_id
                );
                Ok(target)
            }
        }
    }

    /// Looks up the deliverable for a job, based on its current record.
    pub fn locate(&self, record: &JobRecord) -> Result<PathBuf, ArtifactError> {
        match record.state {
            JobState::Succeeded => {
                let path = record
                    .output_path
                    .clone()
                    .ok_or_else(|| ArtifactError::NotFound(record.job_id.clone()))?;
                if path.is_file() {
                    Ok(path)
                } else {
                    // Succeeded but purged or lost on disk.
                    Err(ArtifactError::NotFound(record.job_id.clone()))
                }
            }
            JobState::Failed | JobState::Cancelled => {
                Err(ArtifactError::NotFound(record.job_id.clone()))
            }
            _ => Err(ArtifactError::NotReady(record.job_id.clone())),
        }
    }

    /// Removes a job's artifact directory. Missing directories are fine.
    pub fn purge(&self, job_id: &str) -> Result<(), ArtifactError> {
        let dir = self.job_dir(job_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArtifactError::Purge {
                job_id: job_id.to_string(),
                source: e,
            }),
        }
    }
}

/// Ensures a produced file lives inside the job directory; files already
/// there are left in place.
fn place_file(source: &Path, dir: &Path) -> io::Result<PathBuf> {
    if source.parent() == Some(dir) {
        return Ok(source.to_path_buf());
    }
    let name = source
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
    let target = dir.join(name);
    std::fs::copy(source, &target)?;
    Ok(target)
}

fn package_zip(files: &[PathBuf], target: &Path) -> io::Result<()> {
    let out = File::create(target)?;
    let mut writer = zip::ZipWriter::new(out);
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    for file in files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unnameable frame file"))?;
        writer.start_file(name, options)?;
        let data = std::fs::read(file)?;
        writer.write_all(&data)?;
    }
    writer.finish()?;
    Ok(())
}
