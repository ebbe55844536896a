//! Turns an uploaded scene file or archive into a job-private working
//! directory containing exactly one selected scene file.
//!
//! Supported uploads: a raw `.blend` file, a `.zip` archive, or a
//! `.tar.gz`/`.tgz` archive. The size ceiling is checked against the
//! upload's metadata before any extraction happens. When an archive
//! contains several scene files the lexicographically first path wins.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::{debug, info};
use walkdir::WalkDir;

use crate::config::FarmConfig;
use crate::error::ResolveError;

const SCENE_EXTENSION: &str = "blend";

/// The outcome of resolving an upload: a private working directory and
/// the single scene file selected inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScene {
    pub working_dir: PathBuf,
    pub scene_path: PathBuf,
}

pub struct ArchiveResolver {
    working_dir_root: PathBuf,
    max_archive_bytes: u64,
}

impl ArchiveResolver {
    pub fn new(working_dir_root: PathBuf, max_archive_bytes: u64) -> Self {
        Self {
            working_dir_root,
            max_archive_bytes,
        }
    }

    pub fn from_config(config: &FarmConfig) -> Self {
        Self::new(config.working_dir_root.clone(), config.max_archive_bytes)
    }

    /// Resolves `upload_path` into the working directory for `job_id`.
    pub fn resolve(&self, job_id: &str, upload_path: &Path) -> Result<ResolvedScene, ResolveError> {
        let metadata = std::fs::metadata(upload_path).map_err(|e| ResolveError::ReadUpload {
            path: upload_path.to_path_buf(),
            source: e,
        })?;
        if metadata.len() > self.max_archive_bytes {
            return Err(ResolveError::SizeLimitExceeded {
                actual: metadata.len(),
                limit: self.max_archive_bytes,
            });
        }

        let working_dir = self.working_dir_root.join(job_id);
        std::fs::create_dir_all(&working_dir).map_err(|e| ResolveError::WorkDir {
            path: working_dir.clone(),
            source: e,
        })?;

        match upload_kind(upload_path)? {
            UploadKind::RawScene => self.place_raw_scene(upload_path, &working_dir)?,
            UploadKind::Zip => extract_zip(upload_path, &working_dir)?,
            UploadKind::TarGz => extract_tar_gz(upload_path, &working_dir)?,
        }

        let scene_path = select_scene(&working_dir)?;
        info!(
            "Resolved upload '{}' for job {} to scene {}",
            upload_path.display(),
            job_id,
            scene_path.display()
        );

        Ok(ResolvedScene {
            working_dir,
            scene_path,
        })
    }

    fn place_raw_scene(&self, upload: &Path, working_dir: &Path) -> Result<(), ResolveError> {
        let file_name = upload
            .file_name()
            .ok_or_else(|| ResolveError::UnsupportedFormat(upload.display().to_string()))?;
        let target = working_dir.join(file_name);
        std::fs::copy(upload, &target).map_err(|e| ResolveError::ReadUpload {
            path: upload.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

enum UploadKind {
    RawScene,
    Zip,
    TarGz,
}

fn upload_kind(path: &Path) -> Result<UploadKind, ResolveError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if name.ends_with(".blend") {
        Ok(UploadKind::RawScene)
    } else if name.ends_with(".zip") {
        Ok(UploadKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(UploadKind::TarGz)
    } else {
        Err(ResolveError::UnsupportedFormat(
            path.display().to_string(),
        ))
    }
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), ResolveError> {
    let corrupt = |reason: String| ResolveError::CorruptArchive {
        path: archive_path.to_path_buf(),
        reason,
    };

    let file = File::open(archive_path).map_err(|e| ResolveError::ReadUpload {
        path: archive_path.to_path_buf(),
        source: e,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| corrupt(e.to_string()))?;

        // Entries escaping the destination are dropped, not an error.
        let Some(relative) = entry.enclosed_name() else {
            debug!("Skipping unsafe zip entry '{}'", entry.name());
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| corrupt(e.to_string()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| corrupt(e.to_string()))?;
        }
        let mut out = File::create(&target).map_err(|e| corrupt(e.to_string()))?;
        io::copy(&mut entry, &mut out).map_err(|e| corrupt(e.to_string()))?;
    }

    Ok(())
}

fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<(), ResolveError> {
    let file = File::open(archive_path).map_err(|e| ResolveError::ReadUpload {
        path: archive_path.to_path_buf(),
        source: e,
    })?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .map_err(|e| ResolveError::CorruptArchive {
            path: archive_path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Picks the scene file: lexicographically first `.blend` path under the
/// working directory.
fn select_scene(working_dir: &Path) -> Result<PathBuf, ResolveError> {
    let mut scenes: Vec<PathBuf> = WalkDir::new(working_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(SCENE_EXTENSION))
                .unwrap_or(false)
        })
        .collect();

    scenes.sort();
    scenes.into_iter().next().ok_or(ResolveError::SceneNotFound)
}
