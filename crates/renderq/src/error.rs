use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Archive resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Errors from turning an uploaded file into a renderable scene.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Unsupported upload format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt archive '{path}': {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("No scene file found in upload")]
    SceneNotFound,

    #[error("Upload is {actual} bytes, exceeding the {limit} byte limit")]
    SizeLimitExceeded { actual: u64, limit: u64 },

    #[error("Failed to read upload '{path}': {source}")]
    ReadUpload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare working directory '{path}': {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the render subprocess path. Failures of a renderer that
/// did launch are not errors here: the driver reports them as a
/// `TerminalOutcome` carrying a classified diagnostic.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to spawn renderer '{binary}': {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from job record access and state transitions.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Invalid render request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue is shut down")]
    Closed,

    #[error("Unknown execution handle: {0}")]
    UnknownHandle(String),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact for job {0} is not ready")]
    NotReady(String),

    #[error("No artifact known for job {0}")]
    NotFound(String),

    #[error("Failed to register artifact for job {job_id}: {reason}")]
    Register { job_id: String, reason: String },

    #[error("Failed to purge artifacts for job {job_id}: {source}")]
    Purge {
        job_id: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RenderqError>;
