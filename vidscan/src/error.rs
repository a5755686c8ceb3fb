//! Application-wide error types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a job ended in `Failed`.
///
/// Persisted with the job next to its human-readable detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobErrorKind {
    /// The source artifact of a queued job is gone.
    SourceMissing,
    /// Frame extraction tool failed or the source was unreadable.
    ExtractionFailed,
    /// The detection worker could not be started.
    WorkerLaunchFailed,
    /// The detection worker exited unsuccessfully or was killed.
    WorkerExitedNonZero,
    /// The worker's result artifact could not be read or decoded.
    ResultUnreadable,
    /// Terminated on request.
    TerminationRequested,
    /// The engine stopped while the job was in flight.
    Interrupted,
    /// Anything else (filesystem errors while finalizing, etc).
    Internal,
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind}: {message}")]
    Job { kind: JobErrorKind, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job {id} is already {status}")]
    JobTerminal { id: String, status: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn job(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self::Job {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// The job failure kind this error maps to when it ends a pipeline.
    pub fn job_kind(&self) -> JobErrorKind {
        match self {
            Self::Job { kind, .. } => *kind,
            _ => JobErrorKind::Internal,
        }
    }

    /// Message recorded as the job's `errorDetail`.
    pub fn job_detail(&self) -> String {
        match self {
            Self::Job { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
