//! Two-step worker termination.
//!
//! A stop is first requested gracefully. If the signal cannot be delivered the
//! process is killed right away; otherwise the worker's kill switch is pulled
//! once the grace period is over.

use std::time::Duration;

use strum::Display;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How the first termination step was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopOutcome {
    /// Graceful stop signal delivered.
    Signalled,
    /// Graceful delivery failed; the process was killed instead.
    ForceKilled,
}

/// Ask `pid` to stop, killing it if the graceful signal cannot be delivered.
pub fn request_stop(pid: u32) -> std::io::Result<StopOutcome> {
    match process_utils::send_stop(pid) {
        Ok(()) => Ok(StopOutcome::Signalled),
        Err(e) => {
            debug!(pid, error = %e, "Graceful stop failed, escalating to kill");
            process_utils::force_kill(pid)?;
            Ok(StopOutcome::ForceKilled)
        }
    }
}

/// Cancel `kill` once `grace` has passed.
///
/// The backend that owns the worker's child handle kills it when `kill` fires.
/// A backend that has already reaped its worker no longer listens, so a
/// recycled pid is never signalled.
pub fn escalate_after(kill: CancellationToken, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if !kill.is_cancelled() {
            debug!(grace_ms = grace.as_millis() as u64, "Grace period over, escalating to kill");
            kill.cancel();
        }
    })
}
