use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Missing or invalid input. Never retried: the caller has to fix the config.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("dump executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("failed to prepare dump output: {0}")]
    Output(#[source] std::io::Error),

    #[error("failed to start dump process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("dump exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("dump timed out after {0:?}")]
    Timeout(Duration),

    #[error("dump reported success but produced no file at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("dump reported success but {} is empty", .0.display())]
    EmptyOutput(PathBuf),
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive timed out after {0:?}")]
    Timeout(Duration),

    #[error("archive cancelled before it was moved into place")]
    Cancelled,

    #[error("archive worker failed: {0}")]
    Worker(String),
}

impl ArchiveError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ArchiveError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Errors reported by an object storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload to s3://{bucket}/{key} failed: {source}")]
    Storage {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dump failed: {0}")]
    Dump(#[from] DumpError),

    #[error("Archive failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),
}

impl BackupError {
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "ConfigError",
            BackupError::Dump(_) => "DumpError",
            BackupError::Archive(_) => "ArchiveError",
            BackupError::Upload(_) => "UploadError",
        }
    }

    /// Anything but a configuration problem may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackupError::Config(_))
    }
}
