//! Job pipeline.
//!
//! An admitted job moves through `ExtractFrames -> Detect -> Finalize -> Done`,
//! or to `Error` from any step. The pipeline owns no state of its own: every
//! observable effect goes through the job registry.

pub mod extract;
pub mod finalize;
mod orchestrator;

pub use extract::{FfmpegFrameExtractor, FrameExtractor};
pub use finalize::{ResultSummary, WorkPaths};
pub use orchestrator::{
    PipelineOrchestrator, PipelineReport, PipelineState, STAGE_COMPLETED, STAGE_ERROR,
    STAGE_FINALIZING,
};
