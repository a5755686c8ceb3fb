//! # Worker Protocol
//!
//! Types shared between the vidscan engine and its detection worker.
//!
//! The worker (a local subprocess or a remote service) reports on standard output
//! using a line-oriented UTF-8 protocol:
//!
//! - `PROGRESS:<integer>` units processed so far in the active stage
//! - `STAGE:<ai|ocr>` switches the active stage
//! - `PREVIEW:<json>` a [`FramePreview`] snapshot of the latest processed frame
//! - `DEBUG:<text>` diagnostics only
//!
//! Any other line is ignored. When the worker exits successfully it leaves a JSON
//! array of [`FrameItems`] at the output path it was given.
//!
//! This crate only parses; it performs no I/O.

use thiserror::Error;

mod artifact;
mod line;

pub use artifact::{FrameItem, FrameItems, FramePreview, OwnershipStatus, parse_result_artifact};
pub use line::{DetectionStage, WorkerLine};

/// Errors produced while decoding worker output.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid progress value: {0:?}")]
    InvalidProgress(String),

    #[error("unknown stage: {0:?}")]
    UnknownStage(String),

    #[error("invalid preview payload: {0}")]
    InvalidPreview(#[source] serde_json::Error),

    #[error("invalid result artifact: {0}")]
    InvalidArtifact(#[source] serde_json::Error),
}
