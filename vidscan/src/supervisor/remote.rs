//! Detection through the remote detection service.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use worker_protocol::DetectionStage;

use super::{DetectionBackend, DetectionRequest, SupervisorEvent};
use crate::utils::http_client;
use crate::{Error, Result};

#[derive(Debug, Serialize)]
struct DetectPayload<'a> {
    frames_dir: &'a Path,
    output_json: &'a Path,
    total_frames: u64,
    /// Empty when no live preview is wanted.
    preview_file: String,
    model_path: &'a Path,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    success: bool,
    #[serde(default)]
    detected_frames: u64,
    #[serde(default)]
    message: String,
}

/// Posts detection requests to `<base_url>/detect`.
///
/// The service shares the filesystem with the engine and writes the result
/// artifact itself. It does not stream progress, so stage and progress
/// events are reported once the request has completed.
pub struct RemoteDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteDetector {
    pub fn new(base_url: impl AsRef<str>, request_timeout: Duration) -> Self {
        Self {
            client: http_client::build_detection_client(request_timeout),
            endpoint: format!("{}/detect", base_url.as_ref().trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl DetectionBackend for RemoteDetector {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn detect(
        &self,
        request: &DetectionRequest,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<()> {
        let payload = DetectPayload {
            frames_dir: &request.frames_dir,
            output_json: &request.output_json,
            total_frames: request.total_frames,
            preview_file: request
                .preview_file
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            model_path: &request.model_path,
            confidence: request.confidence,
        };

        let _ = events
            .send(SupervisorEvent::StageChanged(DetectionStage::Ai))
            .await;

        let response = self.client.post(&self.endpoint).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "Detection service error ({status}): {body}"
            )));
        }

        let body: DetectResponse = response.json().await?;
        if !body.success {
            return Err(Error::Other(format!(
                "Detection service reported failure: {}",
                body.message
            )));
        }

        info!(
            job_id = %request.job_id,
            detected_frames = body.detected_frames,
            "Detection service completed"
        );

        let total = request.total_frames;
        for event in [
            SupervisorEvent::Progress(total),
            SupervisorEvent::StageChanged(DetectionStage::Ocr),
            SupervisorEvent::Progress(total),
        ] {
            let _ = events.send(event).await;
        }
        Ok(())
    }
}
