//! Media transforms.
//!
//! The media capability is a trait seam: the bot talks to
//! [`MediaTransform`], production wires in [`ffmpeg::FfmpegTransform`],
//! tests wire in a mock. The [`Dispatcher`] owns the per-user
//! serialization, progress bookkeeping, and input cleanup around a call.

pub mod dispatcher;
pub mod ffmpeg;

pub use dispatcher::Dispatcher;
pub use ffmpeg::FfmpegTransform;

use crate::error::TransformError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One user-requested media operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Re-encode the staged video into another container format.
    Convert { format: String },
    /// Extract the audio track into the given format.
    ExtractAudio { format: String },
    /// Cut out the `[start, end]` span, seconds.
    Split { start: f64, end: f64 },
    /// Concatenate every file in the merge queue, in order.
    MergeMany,
    /// Overlay an audio file on the staged video.
    MergeVideoAudio,
    /// Copy the staged file under a new display name. No media work.
    Rename { new_name: String },
}

impl Operation {
    /// Short label used in progress and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Convert { .. } => "convert",
            Self::ExtractAudio { .. } => "extract audio",
            Self::Split { .. } => "split",
            Self::MergeMany => "merge",
            Self::MergeVideoAudio => "merge video and audio",
            Self::Rename { .. } => "rename",
        }
    }
}

/// Receives progress reports during a transform. Reports are advisory
/// and best-effort; implementations must never fail the operation.
pub trait ProgressSink: Send + Sync {
    /// `percent` is 0..=100; `status` is a short human-readable phrase.
    fn report(&self, percent: u8, status: &str);
}

/// Cancellation hook checked by the capability between progress reports.
/// Nothing in the current UI sets it; it exists so a future abort button
/// only has to flip the flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The external media capability. Each call writes exactly one output
/// file at `output` or fails; partial outputs are the implementation's
/// problem to clean up. Progress percent must be non-decreasing and
/// reach 100 only via the dispatcher, which emits the terminal report.
#[async_trait]
pub trait MediaTransform: Send + Sync {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError>;

    async fn extract_audio(
        &self,
        input: &Path,
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError>;

    async fn trim(
        &self,
        input: &Path,
        output: &Path,
        start: f64,
        end: f64,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError>;

    async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError>;

    async fn overlay_audio(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), TransformError>;
}
