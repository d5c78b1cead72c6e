//! Transform dispatcher.
//!
//! One `dispatch` call = one user-visible operation: acquire the user's
//! transform lock, reset the progress epoch, invoke the capability,
//! delete the consumed inputs, hand back exactly one output artifact or
//! a failure. No retries; retrying is the caller's decision and nobody
//! makes it.

use super::{CancelToken, MediaTransform, Operation, ProgressSink};
use crate::error::TransformError;
use crate::session::SessionStore;
use crate::staging::{ArtifactRef, MediaKind, StagingArea};
use std::path::Path;
use std::sync::Arc;

pub struct Dispatcher {
    store: Arc<SessionStore>,
    staging: Arc<StagingArea>,
    transform: Arc<dyn MediaTransform>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        staging: Arc<StagingArea>,
        transform: Arc<dyn MediaTransform>,
    ) -> Self {
        Self {
            store,
            staging,
            transform,
        }
    }

    /// Run one operation over the given staged inputs.
    ///
    /// Serialized per user: a second call for the same user blocks until
    /// the first finishes. The staged single input stays on disk so the
    /// user can run further operations on it; only multi-input flows
    /// consume files (the whole merge queue, and the overlay audio).
    /// On success the single output artifact is returned and becomes the
    /// caller's to deliver and then delete.
    pub async fn dispatch(
        &self,
        user_id: i64,
        operation: Operation,
        inputs: Vec<ArtifactRef>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Result<ArtifactRef, TransformError> {
        let lock = self.store.lock_handle(user_id);
        let _guard = lock.lock().await;

        self.store.begin_operation(user_id);
        let sink = MonotoneSink::new(self.store.clone(), user_id, sink);

        tracing::info!(user_id, operation = operation.label(), inputs = inputs.len(), "Dispatching transform");

        let result = self.run(user_id, &operation, &inputs, &sink, &cancel).await;

        // Consumed inputs are deleted whether the transform succeeded or
        // not; the queue was already drained and the audio has no further
        // use. The staged input survives until superseded or evicted.
        for input in consumed_inputs(&operation, &inputs) {
            self.staging.delete(input).await;
        }

        match &result {
            Ok(artifact) => {
                sink.terminal(100, "Done");
                tracing::info!(user_id, output = %artifact.path.display(), "Transform finished");
            }
            Err(e) => {
                tracing::error!(user_id, operation = operation.label(), "Transform failed: {e}");
            }
        }
        result
    }

    async fn run(
        &self,
        user_id: i64,
        operation: &Operation,
        inputs: &[ArtifactRef],
        sink: &MonotoneSink,
        cancel: &CancelToken,
    ) -> Result<ArtifactRef, TransformError> {
        match operation {
            Operation::Convert { format } => {
                let input = single_input(inputs)?;
                let name = format!("converted_{}.{format}", stem_of(&input.display_name));
                let output = self.staging.output_path(user_id, &name);
                self.transform
                    .convert(&input.path, &output, sink, cancel)
                    .await?;
                Ok(self.output_artifact(output, name, MediaKind::Video))
            }
            Operation::ExtractAudio { format } => {
                let input = single_input(inputs)?;
                let name = format!("audio_{}.{format}", stem_of(&input.display_name));
                let output = self.staging.output_path(user_id, &name);
                self.transform
                    .extract_audio(&input.path, &output, sink, cancel)
                    .await?;
                Ok(self.output_artifact(output, name, MediaKind::Audio))
            }
            Operation::Split { start, end } => {
                let input = single_input(inputs)?;
                let name = format!("split_{}", input.display_name);
                let output = self.staging.output_path(user_id, &name);
                self.transform
                    .trim(&input.path, &output, *start, *end, sink, cancel)
                    .await?;
                Ok(self.output_artifact(output, name, input.kind))
            }
            Operation::MergeMany => {
                if inputs.len() < 2 {
                    return Err(TransformError::BadInputs(format!(
                        "merge needs at least two inputs, got {}",
                        inputs.len()
                    )));
                }
                let paths: Vec<_> = inputs.iter().map(|a| a.path.clone()).collect();
                let name = "merged_video.mp4".to_string();
                let output = self.staging.output_path(user_id, &name);
                self.transform
                    .concatenate(&paths, &output, sink, cancel)
                    .await?;
                Ok(self.output_artifact(output, name, MediaKind::Video))
            }
            Operation::MergeVideoAudio => {
                let (video, audio) = video_audio_pair(inputs)?;
                let name = format!("merged_av_{}", video.display_name);
                let output = self.staging.output_path(user_id, &name);
                self.transform
                    .overlay_audio(&video.path, &audio.path, &output, sink, cancel)
                    .await?;
                Ok(self.output_artifact(output, name, MediaKind::Video))
            }
            Operation::Rename { new_name } => {
                let input = single_input(inputs)?;
                sink.report(50, "Renaming");
                let output = self.staging.output_path(user_id, new_name);
                tokio::fs::copy(&input.path, &output).await?;
                Ok(self.output_artifact(output, new_name.clone(), input.kind))
            }
        }
    }

    fn output_artifact(
        &self,
        path: std::path::PathBuf,
        display_name: String,
        kind: MediaKind,
    ) -> ArtifactRef {
        ArtifactRef {
            path,
            display_name,
            kind,
        }
    }
}

/// Inputs whose files the dispatch owns and must clean up.
fn consumed_inputs<'a>(operation: &Operation, inputs: &'a [ArtifactRef]) -> Vec<&'a ArtifactRef> {
    match operation {
        Operation::MergeMany => inputs.iter().collect(),
        Operation::MergeVideoAudio => inputs.iter().filter(|a| a.kind == MediaKind::Audio).collect(),
        _ => Vec::new(),
    }
}

fn single_input(inputs: &[ArtifactRef]) -> Result<&ArtifactRef, TransformError> {
    match inputs {
        [one] => Ok(one),
        other => Err(TransformError::BadInputs(format!(
            "expected one input, got {}",
            other.len()
        ))),
    }
}

fn video_audio_pair(inputs: &[ArtifactRef]) -> Result<(&ArtifactRef, &ArtifactRef), TransformError> {
    match inputs {
        [video, audio] if video.kind == MediaKind::Video && audio.kind == MediaKind::Audio => {
            Ok((video, audio))
        }
        _ => Err(TransformError::BadInputs(
            "expected a video input followed by an audio input".into(),
        )),
    }
}

fn stem_of(display_name: &str) -> &str {
    Path::new(display_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(display_name)
}

/// Progress sink wrapper the dispatcher puts in front of the caller's
/// sink: capability reports are clamped non-decreasing, capped at 99,
/// and mirrored into the session store. The terminal 100 is only ever
/// emitted by the dispatcher on success, so a failed operation never
/// shows 100.
struct MonotoneSink {
    store: Arc<SessionStore>,
    user_id: i64,
    inner: Arc<dyn ProgressSink>,
    high_water: std::sync::atomic::AtomicU8,
}

impl MonotoneSink {
    fn new(store: Arc<SessionStore>, user_id: i64, inner: Arc<dyn ProgressSink>) -> Self {
        Self {
            store,
            user_id,
            inner,
            high_water: std::sync::atomic::AtomicU8::new(0),
        }
    }

    fn terminal(&self, percent: u8, status: &str) {
        self.store.record_progress(self.user_id, percent, status);
        self.inner.report(percent, status);
    }
}

impl ProgressSink for MonotoneSink {
    fn report(&self, percent: u8, status: &str) {
        use std::sync::atomic::Ordering;
        let capped = percent.min(99);
        let clamped = self.high_water.fetch_max(capped, Ordering::SeqCst).max(capped);
        self.store.record_progress(self.user_id, clamped, status);
        self.inner.report(clamped, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::CancelToken;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Capability double that records calls and writes a marker output.
    struct MockTransform {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockTransform {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        async fn record(
            &self,
            call: String,
            output: &Path,
            sink: &dyn ProgressSink,
        ) -> Result<(), TransformError> {
            self.calls.lock().unwrap().push(call);
            sink.report(50, "halfway");
            if self.fail {
                return Err(TransformError::Capability("boom".into()));
            }
            tokio::fs::write(output, b"output").await?;
            Ok(())
        }
    }

    #[async_trait]
    impl MediaTransform for MockTransform {
        async fn convert(
            &self,
            input: &Path,
            output: &Path,
            sink: &dyn ProgressSink,
            _cancel: &CancelToken,
        ) -> Result<(), TransformError> {
            self.record(format!("convert:{}", input.display()), output, sink)
                .await
        }

        async fn extract_audio(
            &self,
            input: &Path,
            output: &Path,
            sink: &dyn ProgressSink,
            _cancel: &CancelToken,
        ) -> Result<(), TransformError> {
            self.record(format!("extract:{}", input.display()), output, sink)
                .await
        }

        async fn trim(
            &self,
            input: &Path,
            output: &Path,
            start: f64,
            end: f64,
            sink: &dyn ProgressSink,
            _cancel: &CancelToken,
        ) -> Result<(), TransformError> {
            self.record(
                format!("trim:{}:{start}:{end}", input.display()),
                output,
                sink,
            )
            .await
        }

        async fn concatenate(
            &self,
            inputs: &[PathBuf],
            output: &Path,
            sink: &dyn ProgressSink,
            _cancel: &CancelToken,
        ) -> Result<(), TransformError> {
            let joined: Vec<_> = inputs.iter().map(|p| p.display().to_string()).collect();
            self.record(format!("concat:{}", joined.join(",")), output, sink)
                .await
        }

        async fn overlay_audio(
            &self,
            video: &Path,
            audio: &Path,
            output: &Path,
            sink: &dyn ProgressSink,
            _cancel: &CancelToken,
        ) -> Result<(), TransformError> {
            self.record(
                format!("overlay:{}:{}", video.display(), audio.display()),
                output,
                sink,
            )
            .await
        }
    }

    /// Sink double that records every report.
    struct RecordingSink(Mutex<Vec<(u8, String)>>);

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn reports(&self) -> Vec<(u8, String)> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ProgressSink for RecordingSink {
        fn report(&self, percent: u8, status: &str) {
            self.0.lock().unwrap().push((percent, status.to_string()));
        }
    }

    async fn setup(
        transform: MockTransform,
    ) -> (tempfile::TempDir, Arc<SessionStore>, Arc<StagingArea>, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(
            StagingArea::new(
                dir.path().to_path_buf(),
                vec!["mp4".into()],
                vec!["mp3".into()],
            )
            .await
            .unwrap(),
        );
        let store = Arc::new(SessionStore::new());
        let dispatcher = Dispatcher::new(store.clone(), staging.clone(), Arc::new(transform));
        (dir, store, staging, dispatcher)
    }

    async fn staged(staging: &StagingArea, user: i64, name: &str, kind: MediaKind) -> ArtifactRef {
        staging.save(user, name, kind, b"input").await.unwrap()
    }

    #[tokio::test]
    async fn convert_produces_named_output_and_keeps_input() {
        let (_dir, _store, staging, dispatcher) = setup(MockTransform::new()).await;
        let input = staged(&staging, 1, "clip.mp4", MediaKind::Video).await;
        let input_path = input.path.clone();
        let sink = RecordingSink::new();

        let out = dispatcher
            .dispatch(
                1,
                Operation::Convert { format: "avi".into() },
                vec![input],
                sink.clone(),
                CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.display_name, "converted_clip.avi");
        assert!(out.path.exists());
        // The staged file stays available for further operations.
        assert!(input_path.exists());
    }

    #[tokio::test]
    async fn success_ends_at_exactly_100() {
        let (_dir, store, staging, dispatcher) = setup(MockTransform::new()).await;
        let input = staged(&staging, 1, "clip.mp4", MediaKind::Video).await;
        let sink = RecordingSink::new();

        dispatcher
            .dispatch(
                1,
                Operation::Convert { format: "avi".into() },
                vec![input],
                sink.clone(),
                CancelToken::new(),
            )
            .await
            .unwrap();

        let reports = sink.reports();
        assert_eq!(reports.last().unwrap().0, 100);
        let percents: Vec<u8> = reports.iter().map(|(p, _)| *p).collect();
        let mut sorted = percents.clone();
        sorted.sort_unstable();
        assert_eq!(percents, sorted, "progress must be non-decreasing");
        assert_eq!(store.progress(1).percent, 100);
    }

    #[tokio::test]
    async fn failure_never_reports_100() {
        let (_dir, store, staging, dispatcher) = setup(MockTransform::failing()).await;
        let input = staged(&staging, 1, "clip.mp4", MediaKind::Video).await;
        let input_path = input.path.clone();
        let sink = RecordingSink::new();

        let result = dispatcher
            .dispatch(
                1,
                Operation::Convert { format: "avi".into() },
                vec![input],
                sink.clone(),
                CancelToken::new(),
            )
            .await;

        assert!(matches!(result, Err(TransformError::Capability(_))));
        assert!(sink.reports().iter().all(|(p, _)| *p < 100));
        assert!(store.progress(1).percent < 100);
        assert!(input_path.exists(), "a failed run must not eat the staged file");
    }

    #[tokio::test]
    async fn merge_receives_inputs_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(
            StagingArea::new(dir.path().to_path_buf(), vec!["mp4".into()], vec![])
                .await
                .unwrap(),
        );
        let transform = Arc::new(MockTransform::new());
        let dispatcher = Dispatcher::new(
            Arc::new(SessionStore::new()),
            staging.clone(),
            transform.clone(),
        );

        let a = staged(&staging, 1, "a.mp4", MediaKind::Video).await;
        let b = staged(&staging, 1, "b.mp4", MediaKind::Video).await;
        let c = staged(&staging, 1, "c.mp4", MediaKind::Video).await;
        let expected = format!(
            "concat:{},{},{}",
            a.path.display(),
            b.path.display(),
            c.path.display()
        );
        let queued_paths = [a.path.clone(), b.path.clone(), c.path.clone()];

        let out = dispatcher
            .dispatch(
                1,
                Operation::MergeMany,
                vec![a, b, c],
                RecordingSink::new(),
                CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.display_name, "merged_video.mp4");
        assert_eq!(transform.calls.lock().unwrap().as_slice(), &[expected]);
        // Queue files are consumed by the merge.
        assert!(queued_paths.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn merge_with_one_input_is_rejected() {
        let (_dir, _store, staging, dispatcher) = setup(MockTransform::new()).await;
        let a = staged(&staging, 1, "a.mp4", MediaKind::Video).await;

        let result = dispatcher
            .dispatch(
                1,
                Operation::MergeMany,
                vec![a],
                RecordingSink::new(),
                CancelToken::new(),
            )
            .await;
        assert!(matches!(result, Err(TransformError::BadInputs(_))));
    }

    #[tokio::test]
    async fn overlay_requires_video_then_audio() {
        let (_dir, _store, staging, dispatcher) = setup(MockTransform::new()).await;
        let video = staged(&staging, 1, "v.mp4", MediaKind::Video).await;
        let audio = staged(&staging, 1, "a.mp3", MediaKind::Audio).await;

        // Wrong order is a bad dispatch.
        let result = dispatcher
            .dispatch(
                1,
                Operation::MergeVideoAudio,
                vec![audio.clone(), video.clone()],
                RecordingSink::new(),
                CancelToken::new(),
            )
            .await;
        assert!(matches!(result, Err(TransformError::BadInputs(_))));

        // Right order works. Re-stage the audio; a dispatch cleans it up.
        let video = staged(&staging, 1, "v.mp4", MediaKind::Video).await;
        let audio = staged(&staging, 1, "a.mp3", MediaKind::Audio).await;
        let video_path = video.path.clone();
        let audio_path = audio.path.clone();
        let out = dispatcher
            .dispatch(
                1,
                Operation::MergeVideoAudio,
                vec![video, audio],
                RecordingSink::new(),
                CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.display_name, "merged_av_v.mp4");
        // The audio is consumed; the staged video stays.
        assert!(!audio_path.exists());
        assert!(video_path.exists());
    }

    #[tokio::test]
    async fn rename_copies_under_new_name() {
        let (_dir, _store, staging, dispatcher) = setup(MockTransform::new()).await;
        let input = staged(&staging, 1, "old.mp4", MediaKind::Video).await;

        let out = dispatcher
            .dispatch(
                1,
                Operation::Rename { new_name: "new.mp4".into() },
                vec![input],
                RecordingSink::new(),
                CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.display_name, "new.mp4");
        assert_eq!(tokio::fs::read(&out.path).await.unwrap(), b"input");
    }

    #[tokio::test]
    async fn split_passes_bounds_through() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(
            StagingArea::new(dir.path().to_path_buf(), vec!["mp4".into()], vec![])
                .await
                .unwrap(),
        );
        let input = staged(&staging, 1, "clip.mp4", MediaKind::Video).await;
        let input_path = input.path.display().to_string();

        let transform = Arc::new(MockTransform::new());
        let dispatcher = Dispatcher::new(
            Arc::new(SessionStore::new()),
            staging.clone(),
            transform.clone(),
        );
        dispatcher
            .dispatch(
                1,
                Operation::Split { start: 10.0, end: 30.0 },
                vec![input],
                RecordingSink::new(),
                CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            transform.calls.lock().unwrap().as_slice(),
            &[format!("trim:{input_path}:10:30")]
        );
    }
}
