//! ffmpeg-backed media capability.
//!
//! Shells out to `ffmpeg` per operation and derives percent progress
//! from `-progress pipe:1` key=value output against a duration probed
//! with `ffprobe`. When the total duration is unknown (concatenation)
//! progress falls back to coarse milestones.

use super::{CancelToken, MediaTransform, ProgressSink};
use crate::error::TransformError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

pub struct FfmpegTransform {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegTransform {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Media duration in seconds, if ffprobe can tell.
    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }

    /// Run ffmpeg with progress relayed to `sink`. The final 100 report
    /// is the dispatcher's to make; this caps at 99.
    async fn run(
        &self,
        args: Vec<String>,
        total_secs: Option<f64>,
        status: &str,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError> {
        if cancel.is_cancelled() {
            return Err(TransformError::Cancelled);
        }

        tracing::debug!(ffmpeg = %self.ffmpeg, ?args, "Spawning ffmpeg");

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransformError::Capability("ffmpeg stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        // Drain stderr concurrently so a chatty failure can't block the pipe.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        while let Some(line) = lines.next_line().await? {
            if cancel.is_cancelled() {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(TransformError::Cancelled);
            }
            if let Some(percent) = percent_from_progress_line(&line, total_secs) {
                sink.report(percent, status);
            }
        }

        let status_code = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if status_code.success() {
            return Ok(());
        }

        let cause = last_stderr_line(&stderr_text)
            .unwrap_or_else(|| format!("ffmpeg exited with {status_code}"));
        Err(TransformError::Capability(cause))
    }
}

#[async_trait]
impl MediaTransform for FfmpegTransform {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError> {
        sink.report(1, "Starting conversion");
        let total = self.probe_duration(input).await;
        self.run(convert_args(input, output), total, "Converting", sink, cancel)
            .await
    }

    async fn extract_audio(
        &self,
        input: &Path,
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError> {
        sink.report(1, "Extracting audio");
        let total = self.probe_duration(input).await;
        self.run(
            extract_audio_args(input, output),
            total,
            "Extracting audio",
            sink,
            cancel,
        )
        .await
    }

    async fn trim(
        &self,
        input: &Path,
        output: &Path,
        start: f64,
        end: f64,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError> {
        sink.report(1, "Cutting");
        // Progress timestamps restart at zero after -ss, so the span is
        // the effective total.
        let total = (end - start).max(0.0);
        let total = (total > 0.0).then_some(total);
        self.run(trim_args(input, output, start, end), total, "Cutting", sink, cancel)
            .await
    }

    async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError> {
        sink.report(1, "Preparing merge");

        // concat demuxer wants a list file.
        let list_path = output.with_extension("concat.txt");
        let mut list = String::new();
        for input in inputs {
            list.push_str(&format!("file '{}'\n", input.display()));
        }
        tokio::fs::write(&list_path, list).await?;

        let mut total = Some(0.0);
        for input in inputs {
            match (total, self.probe_duration(input).await) {
                (Some(acc), Some(d)) => total = Some(acc + d),
                _ => total = None,
            }
        }

        sink.report(10, "Merging");
        let result = self
            .run(
                concat_args(&list_path, output),
                total.filter(|t| *t > 0.0),
                "Merging",
                sink,
                cancel,
            )
            .await;

        let _ = tokio::fs::remove_file(&list_path).await;
        result
    }

    async fn overlay_audio(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError> {
        sink.report(1, "Merging audio and video");
        let total = self.probe_duration(video).await;
        self.run(
            overlay_audio_args(video, audio, output),
            total,
            "Merging audio and video",
            sink,
            cancel,
        )
        .await
    }
}

/// Flags shared by every invocation: overwrite, quiet, machine progress.
fn base_args() -> Vec<String> {
    vec![
        "-y".into(),
        "-nostats".into(),
        "-loglevel".into(),
        "error".into(),
        "-progress".into(),
        "pipe:1".into(),
    ]
}

fn convert_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".into(), input.display().to_string()]);
    args.push(output.display().to_string());
    args
}

fn extract_audio_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "-i".into(),
        input.display().to_string(),
        "-vn".into(),
    ]);
    args.push(output.display().to_string());
    args
}

fn trim_args(input: &Path, output: &Path, start: f64, end: f64) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "-i".into(),
        input.display().to_string(),
        "-ss".into(),
        format!("{start}"),
        "-to".into(),
        format!("{end}"),
    ]);
    args.push(output.display().to_string());
    args
}

fn concat_args(list: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.display().to_string(),
        "-c".into(),
        "copy".into(),
    ]);
    args.push(output.display().to_string());
    args
}

fn overlay_audio_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "-i".into(),
        video.display().to_string(),
        "-i".into(),
        audio.display().to_string(),
        "-map".into(),
        "0:v".into(),
        "-map".into(),
        "1:a".into(),
        "-c:v".into(),
        "copy".into(),
        "-shortest".into(),
    ]);
    args.push(output.display().to_string());
    args
}

/// Parse one `-progress pipe:1` line into a percent against `total_secs`.
///
/// ffmpeg emits `out_time_ms=<microseconds>` (the name lies; the unit is
/// microseconds). With no known total, `progress=end` maps to 95 as a
/// coarse "almost there" milestone and other lines report nothing.
fn percent_from_progress_line(line: &str, total_secs: Option<f64>) -> Option<u8> {
    if let Some(value) = line.strip_prefix("out_time_ms=") {
        let total = total_secs?;
        let micros: i64 = value.trim().parse().ok()?;
        if micros < 0 || total <= 0.0 {
            return None;
        }
        let done = micros as f64 / 1_000_000.0;
        let percent = (done / total * 100.0).floor();
        // 100 is reserved for the terminal success report.
        return Some((percent as u8).min(99));
    }
    if line.trim() == "progress=end" && total_secs.is_none() {
        return Some(95);
    }
    None
}

fn last_stderr_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .next_back()
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_from_out_time_ms() {
        // 30s of a 60s file.
        assert_eq!(
            percent_from_progress_line("out_time_ms=30000000", Some(60.0)),
            Some(50)
        );
        // Start of file.
        assert_eq!(
            percent_from_progress_line("out_time_ms=0", Some(60.0)),
            Some(0)
        );
        // Past the probed total still caps below 100.
        assert_eq!(
            percent_from_progress_line("out_time_ms=70000000", Some(60.0)),
            Some(99)
        );
    }

    #[test]
    fn percent_ignores_unrelated_lines() {
        assert_eq!(percent_from_progress_line("frame=100", Some(60.0)), None);
        assert_eq!(percent_from_progress_line("speed=2.0x", Some(60.0)), None);
        assert_eq!(
            percent_from_progress_line("out_time_ms=garbage", Some(60.0)),
            None
        );
    }

    #[test]
    fn percent_without_total_uses_end_milestone() {
        assert_eq!(percent_from_progress_line("out_time_ms=5000000", None), None);
        assert_eq!(percent_from_progress_line("progress=end", None), Some(95));
        // With a known total, progress=end is redundant.
        assert_eq!(percent_from_progress_line("progress=end", Some(10.0)), None);
    }

    #[test]
    fn percent_rejects_negative_time() {
        assert_eq!(
            percent_from_progress_line("out_time_ms=-1", Some(60.0)),
            None
        );
    }

    #[test]
    fn convert_args_shape() {
        let args = convert_args(Path::new("/in/a.mp4"), Path::new("/out/a.avi"));
        assert_eq!(args.first().unwrap(), "-y");
        assert!(args.contains(&"-progress".to_string()));
        assert!(args.contains(&"/in/a.mp4".to_string()));
        assert_eq!(args.last().unwrap(), "/out/a.avi");
    }

    #[test]
    fn extract_audio_args_drop_video() {
        let args = extract_audio_args(Path::new("a.mp4"), Path::new("a.mp3"));
        assert!(args.contains(&"-vn".to_string()));
        assert_eq!(args.last().unwrap(), "a.mp3");
    }

    #[test]
    fn trim_args_carry_bounds() {
        let args = trim_args(Path::new("a.mp4"), Path::new("cut.mp4"), 10.0, 30.5);
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        assert_eq!(args[ss + 1], "10");
        let to = args.iter().position(|a| a == "-to").unwrap();
        assert_eq!(args[to + 1], "30.5");
    }

    #[test]
    fn concat_args_use_demuxer() {
        let args = concat_args(Path::new("list.txt"), Path::new("out.mp4"));
        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "concat");
        assert!(args.contains(&"copy".to_string()));
    }

    #[test]
    fn overlay_args_map_streams() {
        let args = overlay_audio_args(
            Path::new("v.mp4"),
            Path::new("a.mp3"),
            Path::new("out.mp4"),
        );
        assert!(args.contains(&"0:v".to_string()));
        assert!(args.contains(&"1:a".to_string()));
        assert!(args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn last_stderr_line_picks_the_cause() {
        let stderr = "warning: something\n\n/in/a.mp4: Invalid data found\n";
        assert_eq!(
            last_stderr_line(stderr).unwrap(),
            "/in/a.mp4: Invalid data found"
        );
        assert!(last_stderr_line("").is_none());
    }
}
