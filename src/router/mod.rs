//! Command router.
//!
//! Maps inbound chat events onto the per-user state machine and the one
//! applicable handler. Every multi-step flow starts from a menu
//! selection in `Idle` and falls back to `Idle` after one operation,
//! successful or not; text-driven states are single-shot and reset even
//! when the text fails to parse.

use crate::channels::{
    audio_format_menu, main_menu, merge_menu, video_format_menu, Event, EventKind, Presenter,
    ProgressReporter,
};
use crate::error::InputError;
use crate::session::{SessionStore, UserState};
use crate::staging::{ArtifactRef, MediaKind, StagingArea};
use crate::transform::{CancelToken, Dispatcher, Operation};
use std::sync::Arc;
use std::time::Duration;

const WELCOME: &str = "🎬 Welcome to clipbot!\n\n\
I can convert videos between formats, merge multiple videos, extract \
audio, split videos, merge video with audio, and rename files.\n\n\
Send me a video or audio file to get started!";

/// Inline-button payload grammar. The strings are a stable contract.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload<'a> {
    MainMenu,
    ConvertMenu,
    AudioMenu,
    MergeMenu,
    AvMergeMenu,
    SplitMenu,
    Rename,
    Format(&'a str),
    Audio(&'a str),
    ProcessMerge,
    AddMoreMerge,
    Unknown,
}

fn parse_payload(data: &str) -> Payload<'_> {
    match data {
        "main_menu" => Payload::MainMenu,
        "convert_menu" => Payload::ConvertMenu,
        "audio_menu" => Payload::AudioMenu,
        "merge_menu" => Payload::MergeMenu,
        "av_merge_menu" => Payload::AvMergeMenu,
        "split_menu" => Payload::SplitMenu,
        "rename" => Payload::Rename,
        "process_merge" => Payload::ProcessMerge,
        "add_more_merge" => Payload::AddMoreMerge,
        other => {
            if let Some(ext) = other.strip_prefix("format_") {
                Payload::Format(ext)
            } else if let Some(ext) = other.strip_prefix("audio_") {
                Payload::Audio(ext)
            } else {
                Payload::Unknown
            }
        }
    }
}

/// Parse split times: two whitespace-separated floats. `start <= end`
/// is assumed, not validated.
pub fn parse_split_times(text: &str) -> Result<(f64, f64), InputError> {
    let bad = || InputError::BadSplitTimes(text.to_string());
    let mut parts = text.split_whitespace();
    let (Some(first), Some(second), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(bad());
    };
    let start: f64 = first.parse().map_err(|_| bad())?;
    let end: f64 = second.parse().map_err(|_| bad())?;
    Ok((start, end))
}

/// Validate a rename target: one token, no separators, with extension.
pub fn validate_file_name(text: &str) -> Result<String, InputError> {
    let name = text.trim();
    let bad = || InputError::BadFileName(text.to_string());
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(bad());
    }
    if name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(bad());
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Ok(name.to_string()),
        _ => Err(bad()),
    }
}

pub struct Router {
    store: Arc<SessionStore>,
    staging: Arc<StagingArea>,
    dispatcher: Arc<Dispatcher>,
    presenter: Arc<dyn Presenter>,
    video_extensions: Vec<String>,
    audio_extensions: Vec<String>,
    progress_throttle: Duration,
}

impl Router {
    pub fn new(
        store: Arc<SessionStore>,
        staging: Arc<StagingArea>,
        dispatcher: Arc<Dispatcher>,
        presenter: Arc<dyn Presenter>,
        video_extensions: Vec<String>,
        audio_extensions: Vec<String>,
        progress_throttle: Duration,
    ) -> Self {
        Self {
            store,
            staging,
            dispatcher,
            presenter,
            video_extensions,
            audio_extensions,
            progress_throttle,
        }
    }

    /// Route one inbound event. Never returns an error to the transport;
    /// everything user-facing ends in exactly one terminal message.
    pub async fn handle(&self, event: Event) {
        let Event {
            user_id,
            chat_id,
            kind,
        } = event;

        match kind {
            EventKind::Command(cmd) => self.handle_command(&chat_id, &cmd).await,
            EventKind::Callback { query_id, data, .. } => {
                self.handle_callback(user_id, &chat_id, &query_id, &data)
                    .await;
            }
            EventKind::Text(text) => self.handle_text(user_id, &chat_id, &text).await,
            EventKind::Upload { artifact } => {
                self.handle_upload(user_id, &chat_id, artifact).await;
            }
        }
    }

    async fn handle_command(&self, chat_id: &str, command: &str) {
        let text = match command {
            "start" => WELCOME,
            _ => "Send me a video or audio file, then pick an operation.",
        };
        if let Err(e) = self.presenter.send_menu(chat_id, text, main_menu()).await {
            tracing::error!("Failed to send menu: {e}");
        }
    }

    async fn handle_callback(&self, user_id: i64, chat_id: &str, query_id: &str, data: &str) {
        self.presenter.ack_callback(query_id, None).await;

        match parse_payload(data) {
            Payload::MainMenu => {
                self.leave_merge_mode(user_id).await;
                self.store.set_state(user_id, UserState::Idle);
                let _ = self
                    .presenter
                    .send_menu(chat_id, "What would you like to do?", main_menu())
                    .await;
            }
            Payload::ConvertMenu => {
                if self.require_staged(user_id, chat_id).await.is_some() {
                    let _ = self
                        .presenter
                        .send_menu(
                            chat_id,
                            "Pick the target format:",
                            video_format_menu(&self.video_extensions),
                        )
                        .await;
                }
            }
            Payload::AudioMenu => {
                if self.require_staged(user_id, chat_id).await.is_some() {
                    let _ = self
                        .presenter
                        .send_menu(
                            chat_id,
                            "Pick the audio format:",
                            audio_format_menu(&self.audio_extensions),
                        )
                        .await;
                }
            }
            Payload::MergeMenu => {
                // Entering merge mode clears any leftover queue, then the
                // staged input (if any) seeds the new queue.
                self.leave_merge_mode(user_id).await;
                if let Some(staged) = self.store.take_staged(user_id) {
                    self.store.enqueue(user_id, staged);
                }
                self.store.set_state(user_id, UserState::AwaitingMergeFiles);
                let queued = self.store.queue_len(user_id);
                let _ = self
                    .presenter
                    .send_menu(
                        chat_id,
                        &format!(
                            "Merge mode: {queued} file(s) queued. Send more files, \
                             then press Process merge."
                        ),
                        merge_menu(),
                    )
                    .await;
            }
            Payload::AvMergeMenu => {
                let Some(staged) = self.require_staged(user_id, chat_id).await else {
                    return;
                };
                if staged.kind != MediaKind::Video {
                    self.input_error(
                        user_id,
                        chat_id,
                        &InputError::WrongMediaKind {
                            expected: "video",
                            got: staged.kind.as_str(),
                        },
                    )
                    .await;
                    return;
                }
                self.store.set_state(user_id, UserState::AwaitingAudioMerge);
                let _ = self
                    .presenter
                    .send_text(chat_id, "Send the audio file to merge with your video.")
                    .await;
            }
            Payload::SplitMenu => {
                if self.require_staged(user_id, chat_id).await.is_some() {
                    self.store.set_state(user_id, UserState::AwaitingSplitTimes);
                    let _ = self
                        .presenter
                        .send_text(
                            chat_id,
                            "Send start and end times in seconds, e.g. \"10 30\".",
                        )
                        .await;
                }
            }
            Payload::Rename => {
                if self.require_staged(user_id, chat_id).await.is_some() {
                    self.store.set_state(user_id, UserState::AwaitingNewName);
                    let _ = self
                        .presenter
                        .send_text(chat_id, "Send the new file name, e.g. \"holiday.mp4\".")
                        .await;
                }
            }
            Payload::Format(ext) => {
                self.handle_format_choice(user_id, chat_id, ext, false).await;
            }
            Payload::Audio(ext) => {
                self.handle_format_choice(user_id, chat_id, ext, true).await;
            }
            Payload::ProcessMerge => {
                self.store.set_state(user_id, UserState::Idle);
                let inputs = self.store.dequeue_all(user_id);
                if inputs.len() < 2 {
                    let n = inputs.len();
                    for input in &inputs {
                        self.staging.delete(input).await;
                    }
                    self.input_error(user_id, chat_id, &InputError::QueueTooShort(n))
                        .await;
                    return;
                }
                self.run_operation(user_id, chat_id, Operation::MergeMany, inputs)
                    .await;
            }
            Payload::AddMoreMerge => {
                let _ = self.presenter.send_text(chat_id, "Send the next file.").await;
            }
            Payload::Unknown => {
                tracing::warn!(user_id, data, "Unknown callback payload");
            }
        }
    }

    async fn handle_format_choice(
        &self,
        user_id: i64,
        chat_id: &str,
        ext: &str,
        audio: bool,
    ) {
        let allowed = if audio {
            &self.audio_extensions
        } else {
            &self.video_extensions
        };
        if !allowed.iter().any(|e| e == ext) {
            self.input_error(
                user_id,
                chat_id,
                &InputError::UnsupportedExtension(ext.to_string()),
            )
            .await;
            return;
        }

        let Some(input) = self.require_staged(user_id, chat_id).await else {
            return;
        };
        self.store.set_state(user_id, UserState::Idle);
        let operation = if audio {
            Operation::ExtractAudio { format: ext.to_string() }
        } else {
            Operation::Convert { format: ext.to_string() }
        };
        self.run_operation(user_id, chat_id, operation, vec![input])
            .await;
    }

    async fn handle_text(&self, user_id: i64, chat_id: &str, text: &str) {
        match self.store.state(user_id) {
            UserState::AwaitingSplitTimes => {
                // Single-shot: the state resets no matter how parsing goes.
                self.store.set_state(user_id, UserState::Idle);
                let (start, end) = match parse_split_times(text) {
                    Ok(bounds) => bounds,
                    Err(e) => {
                        self.input_error(user_id, chat_id, &e).await;
                        return;
                    }
                };
                let Some(input) = self.require_staged(user_id, chat_id).await else {
                    return;
                };
                self.run_operation(
                    user_id,
                    chat_id,
                    Operation::Split { start, end },
                    vec![input],
                )
                .await;
            }
            UserState::AwaitingNewName => {
                self.store.set_state(user_id, UserState::Idle);
                let new_name = match validate_file_name(text) {
                    Ok(name) => name,
                    Err(e) => {
                        self.input_error(user_id, chat_id, &e).await;
                        return;
                    }
                };
                let Some(input) = self.require_staged(user_id, chat_id).await else {
                    return;
                };
                self.run_operation(
                    user_id,
                    chat_id,
                    Operation::Rename { new_name },
                    vec![input],
                )
                .await;
            }
            _ => {
                let _ = self
                    .presenter
                    .send_menu(
                        chat_id,
                        "Send me a video or audio file, or pick an operation:",
                        main_menu(),
                    )
                    .await;
            }
        }
    }

    /// Route a file already streamed into the staging area by the
    /// channel (extension and size were checked before download).
    async fn handle_upload(&self, user_id: i64, chat_id: &str, artifact: ArtifactRef) {
        match self.store.state(user_id) {
            UserState::AwaitingMergeFiles => {
                let queued = self.store.enqueue(user_id, artifact);
                let _ = self
                    .presenter
                    .send_menu(
                        chat_id,
                        &format!("✅ Added. {queued} file(s) queued."),
                        merge_menu(),
                    )
                    .await;
            }
            UserState::AwaitingAudioMerge => {
                self.store.set_state(user_id, UserState::Idle);
                if artifact.kind != MediaKind::Audio {
                    // Nothing references the rejected file.
                    self.staging.delete(&artifact).await;
                    self.report_input_error(
                        chat_id,
                        &InputError::WrongMediaKind {
                            expected: "audio",
                            got: artifact.kind.as_str(),
                        },
                    )
                    .await;
                    return;
                }
                let Some(video) = self.store.staged(user_id) else {
                    self.staging.delete(&artifact).await;
                    self.input_error(user_id, chat_id, &InputError::NoStagedInput)
                        .await;
                    return;
                };
                self.run_operation(
                    user_id,
                    chat_id,
                    Operation::MergeVideoAudio,
                    vec![video, artifact],
                )
                .await;
            }
            _ => {
                // Outside a multi-step flow an upload becomes the current
                // staged input, superseding the previous one.
                self.store.set_state(user_id, UserState::Idle);
                if let Some(old) = self.store.stage(user_id, artifact) {
                    // Supersedure does not delete implicitly; this is the
                    // one place the old file dies.
                    self.staging.delete(&old).await;
                }
                let _ = self
                    .presenter
                    .send_menu(
                        chat_id,
                        "✅ File received! What would you like to do with it?",
                        main_menu(),
                    )
                    .await;
            }
        }
    }

    /// Dispatch one operation and deliver its single terminal message.
    async fn run_operation(
        &self,
        user_id: i64,
        chat_id: &str,
        operation: Operation,
        inputs: Vec<ArtifactRef>,
    ) {
        let reporter = ProgressReporter::spawn(
            self.presenter.clone(),
            chat_id.to_string(),
            self.progress_throttle,
        );

        let result = self
            .dispatcher
            .dispatch(user_id, operation, inputs, reporter, CancelToken::new())
            .await;

        match result {
            Ok(artifact) => {
                if let Err(e) = self
                    .presenter
                    .send_artifact(chat_id, &artifact, "✅ Done!")
                    .await
                {
                    tracing::error!(user_id, "Failed to deliver result: {e}");
                    let _ = self
                        .presenter
                        .send_text(chat_id, "❌ The result could not be delivered.")
                        .await;
                }
                // Delivered or not, the output does not outlive the attempt.
                self.staging.delete(&artifact).await;
            }
            Err(e) => {
                tracing::error!(user_id, "Operation failed: {e}");
                let _ = self
                    .presenter
                    .send_text(
                        chat_id,
                        "❌ The operation failed. Try again, or send another file.",
                    )
                    .await;
            }
        }
    }

    /// Staged input or a graceful error with reset to `Idle`.
    async fn require_staged(&self, user_id: i64, chat_id: &str) -> Option<ArtifactRef> {
        match self.store.staged(user_id) {
            Some(artifact) => Some(artifact),
            None => {
                self.input_error(user_id, chat_id, &InputError::NoStagedInput)
                    .await;
                None
            }
        }
    }

    /// Report an input error and reset the state machine.
    async fn input_error(&self, user_id: i64, chat_id: &str, error: &InputError) {
        self.store.set_state(user_id, UserState::Idle);
        self.report_input_error(chat_id, error).await;
    }

    async fn report_input_error(&self, chat_id: &str, error: &InputError) {
        tracing::debug!("Input error: {error}");
        let _ = self
            .presenter
            .send_text(chat_id, &format!("❌ {}", error.user_message()))
            .await;
    }

    /// Drop the merge queue and its files.
    async fn leave_merge_mode(&self, user_id: i64) {
        for artifact in self.store.clear_queue(user_id) {
            self.staging.delete(&artifact).await;
        }
    }
}
