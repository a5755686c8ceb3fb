//! vidscan library crate.
//!
//! An admission-controlled engine that runs video detection jobs: frames are
//! extracted with ffmpeg, handed to a detection worker, and the results are
//! kept per job on disk.

pub mod admission;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod utils;

pub use config::EngineConfig;
pub use error::{Error, JobErrorKind, Result};
pub use job::{Job, JobStatus, QueueStats};
pub use service::{EngineComponents, JobList, JobService};
