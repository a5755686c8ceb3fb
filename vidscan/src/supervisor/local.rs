//! Detection in a local subprocess.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use worker_protocol::WorkerLine;

use super::{DetectionBackend, DetectionRequest, SupervisorEvent};
use crate::error::JobErrorKind;
use crate::utils::lines::LossyLines;
use crate::{Error, Result};

/// Stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 40;

/// Runs the detector script with the configured interpreter.
pub struct LocalDetector {
    program: String,
    script: PathBuf,
}

impl LocalDetector {
    pub fn new(program: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
        }
    }

    fn command(&self, request: &DetectionRequest) -> tokio::process::Command {
        let mut cmd = process_utils::tokio_command(&self.program);
        cmd.arg(&self.script)
            .arg("--model")
            .arg(&request.model_path)
            .arg("--frames-dir")
            .arg(&request.frames_dir)
            .arg("--output-json")
            .arg(&request.output_json)
            .arg("--confidence")
            .arg(request.confidence.to_string())
            .arg("--total-frames")
            .arg(request.total_frames.to_string())
            .arg("--fps")
            .arg(request.fps.to_string());

        if let Some(preview) = &request.preview_file {
            cmd.arg("--preview-file").arg(preview);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DetectionBackend for LocalDetector {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn detect(
        &self,
        request: &DetectionRequest,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<()> {
        let mut child = self.command(request).spawn().map_err(|e| {
            Error::job(
                JobErrorKind::WorkerLaunchFailed,
                format!("failed to start {} {}: {e}", self.program, self.script.display()),
            )
        })?;

        let pid = child.id();
        info!(job_id = %request.job_id, pid, "Detection worker started");
        if let Some(pid) = pid {
            let _ = events.send(SupervisorEvent::ProcessStarted(pid)).await;
        }

        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(stderr_tail(stderr)));

        let killed = match child.stdout.take() {
            Some(stdout) => tokio::select! {
                () = forward_output(stdout, &request.job_id, &events) => false,
                () = request.kill.cancelled() => true,
            },
            None => false,
        };
        let exited = if killed {
            None
        } else {
            tokio::select! {
                status = child.wait() => Some(status),
                () = request.kill.cancelled() => None,
            }
        };
        let status = match exited {
            Some(status) => status,
            None => {
                warn!(job_id = %request.job_id, pid, "Killing detection worker");
                if let Err(e) = child.start_kill() {
                    warn!(job_id = %request.job_id, error = %e, "Failed to kill detection worker");
                }
                child.wait().await
            }
        }
        .map_err(|e| {
            Error::job(
                JobErrorKind::WorkerExitedNonZero,
                format!("failed to wait for detection worker: {e}"),
            )
        })?;

        let stderr = match stderr_task {
            // Descendants of a killed worker may keep stderr open.
            Some(task) if request.kill.is_cancelled() => {
                task.abort();
                String::new()
            }
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let message = if stderr.trim().is_empty() {
                format!("Detection script exited with {status}")
            } else {
                stderr
            };
            return Err(Error::job(JobErrorKind::WorkerExitedNonZero, message));
        }

        debug!(job_id = %request.job_id, "Detection worker finished");
        Ok(())
    }
}

/// Parse worker stdout until EOF and relay protocol events.
async fn forward_output<R: AsyncRead + Unpin>(
    reader: R,
    job_id: &str,
    events: &mpsc::Sender<SupervisorEvent>,
) {
    let mut lines = LossyLines::new(BufReader::new(reader));
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(job_id, error = %e, "Error reading detection worker output");
                break;
            }
        };
        match WorkerLine::parse(&line) {
            Ok(Some(WorkerLine::Progress(units))) => {
                let _ = events.send(SupervisorEvent::Progress(units)).await;
            }
            Ok(Some(WorkerLine::Stage(stage))) => {
                debug!(job_id, stage = %stage, "Worker stage changed");
                let _ = events.send(SupervisorEvent::StageChanged(stage)).await;
            }
            Ok(Some(WorkerLine::Preview(preview))) => {
                let _ = events.send(SupervisorEvent::Preview(preview)).await;
            }
            Ok(Some(WorkerLine::Debug(text))) => {
                debug!(job_id, "worker: {}", text);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(job_id, error = %e, "Malformed worker line ignored");
            }
        }
    }
}

/// Drain `reader`, keeping only the last lines.
async fn stderr_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = LossyLines::new(BufReader::new(reader));
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("worker stderr: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Error reading detection worker stderr");
                break;
            }
        }
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Writes `body` as a shell script. The script sees the detector arguments in `$@`.
    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("detector.sh");
        let prelude = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --output-json) OUT="$2"; shift 2 ;;
    --total-frames) TOTAL="$2"; shift 2 ;;
    *) shift ;;
  esac
done
"#;
        std::fs::write(&path, format!("{prelude}\n{body}\n")).unwrap();
        path
    }

    fn request(dir: &TempDir) -> DetectionRequest {
        DetectionRequest {
            job_id: "job-1".to_string(),
            frames_dir: dir.path().join("raw"),
            output_json: dir.path().join("items.json"),
            preview_file: Some(dir.path().join("live-preview.jpg")),
            total_frames: 2,
            model_path: PathBuf::from("best.pt"),
            confidence: 0.5,
            fps: 7.0,
            kill: CancellationToken::new(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn streams_protocol_events() {
        let dir = tempfile::tempdir().unwrap();
        let detector = LocalDetector::new(
            "sh",
            script(
                dir.path(),
                r#"
echo "Loading model"
echo "STAGE:ai"
echo "PROGRESS:1"
echo "PROGRESS:$TOTAL"
echo "DEBUG:something"
echo "PROGRESS:oops"
echo 'PREVIEW:{"frameIndex":2,"items":[{"name":"Fade"}]}'
echo "STAGE:ocr"
echo "PROGRESS:2"
echo '[{"frameIndex":2,"items":[{"name":"Fade"}]}]' > "$OUT"
"#,
            ),
        );

        let (tx, rx) = mpsc::channel(64);
        let request = request(&dir);
        let (result, events) = tokio::join!(detector.detect(&request, tx), collect(rx));
        result.unwrap();

        assert!(matches!(events[0], SupervisorEvent::ProcessStarted(_)));
        assert_eq!(
            &events[1..],
            &[
                SupervisorEvent::StageChanged(worker_protocol::DetectionStage::Ai),
                SupervisorEvent::Progress(1),
                SupervisorEvent::Progress(2),
                SupervisorEvent::Preview(worker_protocol::FramePreview {
                    frame_index: 2,
                    items: vec![worker_protocol::FrameItem::new("Fade")],
                    processing_time: None,
                    video_time: None,
                }),
                SupervisorEvent::StageChanged(worker_protocol::DetectionStage::Ocr),
                SupervisorEvent::Progress(2),
            ]
        );
        assert!(request.output_json.exists());
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let detector = LocalDetector::new(
            "sh",
            script(dir.path(), "echo 'CUDA out of memory' >&2\nexit 3"),
        );

        let (tx, _rx) = mpsc::channel(64);
        let err = detector.detect(&request(&dir), tx).await.unwrap_err();
        assert_eq!(err.job_kind(), JobErrorKind::WorkerExitedNonZero);
        assert_eq!(err.job_detail(), "CUDA out of memory");
    }

    #[tokio::test]
    async fn silent_failure_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let detector = LocalDetector::new("sh", script(dir.path(), "exit 1"));

        let (tx, _rx) = mpsc::channel(64);
        let err = detector.detect(&request(&dir), tx).await.unwrap_err();
        assert!(err.job_detail().starts_with("Detection script exited with"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let detector = LocalDetector::new("/nonexistent/python-vidscan", "detector.py");

        let (tx, _rx) = mpsc::channel(64);
        let err = detector.detect(&request(&dir), tx).await.unwrap_err();
        assert_eq!(err.job_kind(), JobErrorKind::WorkerLaunchFailed);
    }

    #[tokio::test]
    async fn stderr_tail_is_bounded() {
        let input = (0..100).map(|i| format!("line {i}\n")).collect::<String>();
        let tail = stderr_tail(input.as_bytes()).await;
        let lines: Vec<_> = tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.last(), Some(&"line 99"));
    }

    #[tokio::test]
    async fn undecodable_output_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let detector = LocalDetector::new(
            "sh",
            script(
                dir.path(),
                r#"
echo "STAGE:ai"
printf 'garbage \377\376 line\n'
i=0
while [ $i -lt 2000 ]; do echo "PROGRESS:1"; i=$((i+1)); done
echo '[]' > "$OUT"
"#,
            ),
        );

        let (tx, rx) = mpsc::channel(4096);
        let request = request(&dir);
        let (result, events) = tokio::join!(detector.detect(&request, tx), collect(rx));
        result.unwrap();

        let progress = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Progress(1)))
            .count();
        assert_eq!(progress, 2000);
    }

    #[tokio::test]
    async fn kill_switch_stops_a_worker_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let detector = LocalDetector::new(
            "sh",
            script(dir.path(), "trap '' TERM\necho STAGE:ai\nsleep 30"),
        );

        let (tx, mut rx) = mpsc::channel(64);
        let request = request(&dir);
        let kill = request.kill.clone();
        let pull = async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, SupervisorEvent::StageChanged(_)) {
                    kill.cancel();
                }
            }
        };

        let run = async { tokio::join!(detector.detect(&request, tx), pull).0 };
        let err = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.job_kind(), JobErrorKind::WorkerExitedNonZero);
        assert!(err.job_detail().contains("exited with"));
    }

    #[tokio::test]
    async fn stderr_tail_survives_invalid_utf8() {
        let tail = stderr_tail(&b"first\n\xff\xfe\nlast\n"[..]).await;
        let lines: Vec<_> = tail.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "last");
    }
}
