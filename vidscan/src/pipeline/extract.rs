//! Frame extraction.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::JobErrorKind;
use crate::utils::lines::LossyLines;
use crate::{Error, Result};

/// File name pattern of extracted frames.
pub const FRAME_PATTERN: &str = "frame-%04d.png";

const STDERR_TAIL_LINES: usize = 20;

/// Splits a video into still frames.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Write frames of `source` into `out_dir`.
    ///
    /// Completion fractions in `0..=1` may be sent on `progress`; sends may be
    /// dropped when the receiver lags.
    async fn extract(&self, source: &Path, out_dir: &Path, progress: mpsc::Sender<f64>)
    -> Result<()>;
}

/// [`FrameExtractor`] that runs ffmpeg with a fixed sampling rate.
#[derive(Debug, Clone)]
pub struct FfmpegFrameExtractor {
    ffmpeg_path: String,
    fps: f64,
}

impl FfmpegFrameExtractor {
    pub fn new(ffmpeg_path: impl Into<String>, fps: f64) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            fps,
        }
    }

    fn build_args(&self, source: &Path, out_dir: &Path) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            source.display().to_string(),
            "-vf".to_string(),
            format!("fps={}", self.fps),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
            out_dir.join(FRAME_PATTERN).display().to_string(),
        ]
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract(
        &self,
        source: &Path,
        out_dir: &Path,
        progress: mpsc::Sender<f64>,
    ) -> Result<()> {
        let args = self.build_args(source, out_dir);
        debug!(ffmpeg = %self.ffmpeg_path, ?args, "Starting frame extraction");

        let mut child = process_utils::tokio_command(&self.ffmpeg_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::job(
                    JobErrorKind::ExtractionFailed,
                    format!("failed to start {}: {e}", self.ffmpeg_path),
                )
            })?;

        let (duration_tx, duration_rx) = watch::channel(None);
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(scan_stderr(stderr, duration_tx)));

        if let Some(stdout) = child.stdout.take() {
            track_progress(stdout, duration_rx, &progress).await;
        }

        let status = child.wait().await.map_err(|e| {
            Error::job(
                JobErrorKind::ExtractionFailed,
                format!("failed to wait for ffmpeg: {e}"),
            )
        })?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let message = if stderr.trim().is_empty() {
                format!("ffmpeg exited with {status}")
            } else {
                stderr
            };
            return Err(Error::job(JobErrorKind::ExtractionFailed, message));
        }

        info!(source = %source.display(), fps = self.fps, "Frames extracted");
        Ok(())
    }
}

/// Read ffmpeg's `-progress` output and report the fraction of the input
/// duration processed so far.
async fn track_progress<R: AsyncRead + Unpin>(
    reader: R,
    duration: watch::Receiver<Option<f64>>,
    progress: &mpsc::Sender<f64>,
) {
    let mut lines = LossyLines::new(BufReader::new(reader));
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Error reading ffmpeg progress output");
                break;
            }
        };
        let fraction = if line.trim() == "progress=end" {
            Some(1.0)
        } else {
            parse_out_time(&line)
                .zip(*duration.borrow())
                .filter(|(_, total)| *total > 0.0)
                .map(|(done, total)| (done / total).min(1.0))
        };
        if let Some(fraction) = fraction {
            let _ = progress.try_send(fraction);
        }
    }
}

/// Publish the input duration and keep the tail of stderr for error messages.
async fn scan_stderr<R: AsyncRead + Unpin>(
    reader: R,
    duration: watch::Sender<Option<f64>>,
) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = LossyLines::new(BufReader::new(reader));
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Error reading ffmpeg stderr");
                break;
            }
        };
        if duration.borrow().is_none() {
            if let Some(secs) = parse_duration(&line) {
                duration.send_replace(Some(secs));
            }
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// Parse time string (HH:MM:SS.ms) to seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse the input duration from a stderr line such as
/// `  Duration: 00:01:02.50, start: 0.000000, bitrate: 1205 kb/s`.
pub fn parse_duration(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?;
    let value = rest.split(',').next()?.trim();
    parse_time(value)
}

/// Parse `out_time_us=<micros>` (or the misnamed `out_time_ms`) into seconds.
pub fn parse_out_time(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    if key != "out_time_us" && key != "out_time_ms" {
        return None;
    }
    let micros: i64 = value.trim().parse().ok()?;
    (micros >= 0).then(|| micros as f64 / 1_000_000.0)
}

/// Extracted frame images in `dir`, sorted by name.
pub async fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io_path("reading", dir, e))?;

    let mut frames = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading", dir, e))?
    {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("png") || e.eq_ignore_ascii_case("jpg"));
        if is_image {
            frames.push(path);
        }
    }

    frames.sort();
    Ok(frames)
}

/// Keep every even-indexed frame (0, 2, 4, ...) and delete the rest.
///
/// Returns the frames that were kept.
pub async fn decimate(frames: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut kept = Vec::with_capacity(frames.len().div_ceil(2));
    for (index, frame) in frames.into_iter().enumerate() {
        if index % 2 == 0 {
            kept.push(frame);
        } else {
            tokio::fs::remove_file(&frame)
                .await
                .map_err(|e| Error::io_path("removing", &frame, e))?;
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("00:00:10.50", Some(10.5))]
    #[case("01:30:00.00", Some(5400.0))]
    #[case("invalid", None)]
    fn parses_time(#[case] input: &str, #[case] expected: Option<f64>) {
        assert_eq!(parse_time(input), expected);
    }

    #[rstest]
    #[case("  Duration: 00:01:02.50, start: 0.000000, bitrate: 1205 kb/s", Some(62.5))]
    #[case("  Duration: N/A, start: 0.000000", None)]
    #[case("Stream #0:0: Video: h264", None)]
    fn parses_duration(#[case] line: &str, #[case] expected: Option<f64>) {
        assert_eq!(parse_duration(line), expected);
    }

    #[rstest]
    #[case("out_time_us=2500000", Some(2.5))]
    #[case("out_time_ms=1000000", Some(1.0))]
    #[case("out_time_us=N/A", None)]
    #[case("out_time_us=-9223372036854775807", None)]
    #[case("frame=12", None)]
    fn parses_out_time(#[case] line: &str, #[case] expected: Option<f64>) {
        assert_eq!(parse_out_time(line), expected);
    }

    #[test]
    fn args_sample_at_configured_rate() {
        let extractor = FfmpegFrameExtractor::new("ffmpeg", 7.0);
        let args = extractor.build_args(Path::new("/up/a.mp4"), Path::new("/frames/v/raw"));
        assert!(args.windows(2).any(|w| w == ["-vf", "fps=7"]));
        assert_eq!(args.last().unwrap(), "/frames/v/raw/frame-%04d.png");
    }

    #[tokio::test]
    async fn progress_is_relative_to_duration() {
        let (_tx, duration) = watch::channel(Some(10.0));
        let (progress_tx, mut progress_rx) = mpsc::channel(16);

        let output = b"frame=3\nout_time_us=2500000\nprogress=continue\nout_time_us=20000000\nprogress=end\n";
        track_progress(&output[..], duration, &progress_tx).await;
        drop(progress_tx);

        let mut seen = Vec::new();
        while let Some(f) = progress_rx.recv().await {
            seen.push(f);
        }
        assert_eq!(seen, vec![0.25, 1.0, 1.0]);
    }

    #[tokio::test]
    async fn stderr_scan_publishes_duration() {
        let (tx, rx) = watch::channel(None);
        let stderr = b"Input #0, mov\n  Duration: 00:00:04.00, start: 0.0\nerror line\n";
        let tail = scan_stderr(&stderr[..], tx).await;
        assert_eq!(*rx.borrow(), Some(4.0));
        assert!(tail.ends_with("error line"));
    }

    #[tokio::test]
    async fn undecodable_lines_do_not_stop_scanning() {
        let (tx, rx) = watch::channel(None);
        let stderr = b"Metadata: title \xE9t\xE9
  Duration: 00:00:08.00, start: 0.0
";
        scan_stderr(&stderr[..], tx).await;
        assert_eq!(*rx.borrow(), Some(8.0));

        let (_tx, duration) = watch::channel(Some(8.0));
        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let output = b"\xFF\xFE
out_time_us=2000000
";
        track_progress(&output[..], duration, &progress_tx).await;
        assert_eq!(progress_rx.recv().await, Some(0.25));
    }

    #[tokio::test]
    async fn decimation_keeps_even_indexed_frames() {
        let dir = tempfile::tempdir().unwrap();
        for i in 1..=5 {
            tokio::fs::write(dir.path().join(format!("frame-{i:04}.png")), b"")
                .await
                .unwrap();
        }
        tokio::fs::write(dir.path().join("notes.txt"), b"").await.unwrap();

        let frames = list_frames(dir.path()).await.unwrap();
        assert_eq!(frames.len(), 5);

        let kept = decimate(frames).await.unwrap();
        let names: Vec<_> = kept
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["frame-0001.png", "frame-0003.png", "frame-0005.png"]);
        assert_eq!(list_frames(dir.path()).await.unwrap(), kept);
    }

    #[tokio::test]
    async fn missing_binary_is_an_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FfmpegFrameExtractor::new("/nonexistent/ffmpeg-vidscan", 7.0);
        let (tx, _rx) = mpsc::channel(4);

        let err = extractor
            .extract(&dir.path().join("a.mp4"), dir.path(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.job_kind(), JobErrorKind::ExtractionFailed);
    }
}
