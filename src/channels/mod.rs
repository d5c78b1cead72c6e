//! Chat transport types and the presenter seam.
//!
//! The Telegram channel turns Bot API updates into [`Event`]s; the
//! router talks back through the [`Presenter`] trait so it can be unit
//! tested against a recording double. Progress feedback edits a single
//! message per operation, throttled, and every edit failure is
//! swallowed: progress is best-effort and must never abort the
//! underlying transform.

pub mod telegram;

pub use telegram::{CallbackQuery, TelegramChannel, TelegramPresenter};

use crate::staging::ArtifactRef;
use crate::transform::ProgressSink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// ============================================================================
// Inbound events
// ============================================================================

/// One inbound chat event, already correlated to a user.
#[derive(Debug, Clone)]
pub struct Event {
    pub user_id: i64,
    pub chat_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// Slash command without the leading `/`.
    Command(String),
    /// Inline button press with its opaque payload.
    Callback {
        query_id: String,
        message_id: i64,
        data: String,
    },
    /// Free-text message.
    Text(String),
    /// File upload, already streamed into the staging area.
    Upload { artifact: ArtifactRef },
}

// ============================================================================
// Inline keyboards
// ============================================================================

/// A single inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

pub type Keyboard = Vec<Vec<InlineButton>>;

/// Main menu: the six operations.
pub fn main_menu() -> Keyboard {
    vec![
        vec![
            InlineButton::new("Video Converter", "convert_menu"),
            InlineButton::new("Video Merge", "merge_menu"),
        ],
        vec![
            InlineButton::new("Video Rename", "rename"),
            InlineButton::new("Video and Audio Merge", "av_merge_menu"),
        ],
        vec![
            InlineButton::new("Video Split", "split_menu"),
            InlineButton::new("Video to Audio", "audio_menu"),
        ],
    ]
}

/// Target-format menu for conversion, one button per configured extension.
pub fn video_format_menu(extensions: &[String]) -> Keyboard {
    format_menu(extensions, "format_")
}

/// Target-format menu for audio extraction.
pub fn audio_format_menu(extensions: &[String]) -> Keyboard {
    format_menu(extensions, "audio_")
}

fn format_menu(extensions: &[String], prefix: &str) -> Keyboard {
    let mut rows: Vec<Vec<InlineButton>> = extensions
        .chunks(2)
        .map(|pair| {
            pair.iter()
                .map(|ext| InlineButton::new(ext.to_uppercase(), format!("{prefix}{ext}")))
                .collect()
        })
        .collect();
    rows.push(vec![InlineButton::new("🔙 Back", "main_menu")]);
    rows
}

/// Controls shown while collecting merge files.
pub fn merge_menu() -> Keyboard {
    vec![
        vec![
            InlineButton::new("➕ Add more", "add_more_merge"),
            InlineButton::new("▶️ Process merge", "process_merge"),
        ],
        vec![InlineButton::new("🔙 Main menu", "main_menu")],
    ]
}

// ============================================================================
// Presenter
// ============================================================================

/// Outbound side of the chat transport, as the router sees it.
#[async_trait]
pub trait Presenter: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;

    async fn send_menu(&self, chat_id: &str, text: &str, keyboard: Keyboard)
        -> anyhow::Result<()>;

    /// Deliver a result file with its suggested display name and caption.
    async fn send_artifact(
        &self,
        chat_id: &str,
        artifact: &ArtifactRef,
        caption: &str,
    ) -> anyhow::Result<()>;

    /// Acknowledge a button press (clears the client-side spinner).
    /// Best-effort; failures are the implementation's to swallow.
    async fn ack_callback(&self, query_id: &str, text: Option<&str>);

    /// Send the initial progress message; `None` when the send failed.
    async fn begin_progress(&self, chat_id: &str, text: &str) -> Option<i64>;

    /// Edit a previously sent progress message. Best-effort: the message
    /// may have been deleted or aged out, and that must not matter.
    async fn update_progress(&self, chat_id: &str, message_id: i64, text: &str);
}

// ============================================================================
// Progress reporter
// ============================================================================

/// Bridges the synchronous [`ProgressSink`] the capability calls into
/// async, throttled message edits. One reporter per operation; the edit
/// task exits when the last sender clone is dropped.
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<(u8, String)>,
}

impl ProgressReporter {
    pub fn spawn(
        presenter: Arc<dyn Presenter>,
        chat_id: String,
        throttle: Duration,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u8, String)>();

        tokio::spawn(async move {
            let mut message_id: Option<i64> = None;
            let mut last_edit: Option<Instant> = None;

            while let Some((percent, status)) = rx.recv().await {
                let text = format!("⏳ {status}: {percent}%");
                match message_id {
                    None => {
                        message_id = presenter.begin_progress(&chat_id, &text).await;
                        last_edit = Some(Instant::now());
                    }
                    Some(id) => {
                        let due = last_edit.map_or(true, |t| t.elapsed() >= throttle);
                        // Terminal report always goes out.
                        if due || percent >= 100 {
                            presenter.update_progress(&chat_id, id, &text).await;
                            last_edit = Some(Instant::now());
                        }
                    }
                }
            }
        });

        Arc::new(Self { tx })
    }
}

impl ProgressSink for ProgressReporter {
    fn report(&self, percent: u8, status: &str) {
        // Receiver gone means the bot is shutting down; nothing to do.
        let _ = self.tx.send((percent, status.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn main_menu_covers_all_payloads() {
        let payloads: Vec<_> = main_menu()
            .into_iter()
            .flatten()
            .map(|b| b.callback_data)
            .collect();
        for expected in [
            "convert_menu",
            "merge_menu",
            "rename",
            "av_merge_menu",
            "split_menu",
            "audio_menu",
        ] {
            assert!(payloads.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn format_menus_prefix_payloads() {
        let exts = vec!["mp4".to_string(), "avi".to_string(), "mkv".to_string()];
        let menu = video_format_menu(&exts);
        let buttons: Vec<_> = menu.into_iter().flatten().collect();
        assert!(buttons
            .iter()
            .any(|b| b.callback_data == "format_mp4" && b.text == "MP4"));
        assert!(buttons.iter().any(|b| b.callback_data == "format_mkv"));
        assert_eq!(buttons.last().unwrap().callback_data, "main_menu");

        let audio = audio_format_menu(&["mp3".to_string()]);
        let buttons: Vec<_> = audio.into_iter().flatten().collect();
        assert!(buttons.iter().any(|b| b.callback_data == "audio_mp3"));
    }

    #[test]
    fn merge_menu_has_process_and_add_more() {
        let payloads: Vec<_> = merge_menu()
            .into_iter()
            .flatten()
            .map(|b| b.callback_data)
            .collect();
        assert!(payloads.contains(&"process_merge".to_string()));
        assert!(payloads.contains(&"add_more_merge".to_string()));
        assert!(payloads.contains(&"main_menu".to_string()));
    }

    /// Presenter double recording progress calls.
    struct RecordingPresenter {
        begins: Mutex<Vec<String>>,
        updates: Mutex<Vec<(i64, String)>>,
    }

    impl RecordingPresenter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                begins: Mutex::new(Vec::new()),
                updates: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Presenter for RecordingPresenter {
        async fn send_text(&self, _chat_id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_menu(
            &self,
            _chat_id: &str,
            _text: &str,
            _keyboard: Keyboard,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_artifact(
            &self,
            _chat_id: &str,
            _artifact: &ArtifactRef,
            _caption: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn ack_callback(&self, _query_id: &str, _text: Option<&str>) {}

        async fn begin_progress(&self, _chat_id: &str, text: &str) -> Option<i64> {
            self.begins.lock().unwrap().push(text.to_string());
            Some(7)
        }

        async fn update_progress(&self, _chat_id: &str, message_id: i64, text: &str) {
            self.updates
                .lock()
                .unwrap()
                .push((message_id, text.to_string()));
        }
    }

    #[tokio::test]
    async fn reporter_sends_one_message_then_edits() {
        let presenter = RecordingPresenter::new();
        let reporter = ProgressReporter::spawn(
            presenter.clone(),
            "chat".to_string(),
            Duration::ZERO,
        );

        reporter.report(10, "working");
        reporter.report(60, "working");
        reporter.report(100, "Done");
        drop(reporter);

        // Let the edit task drain.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(presenter.begins.lock().unwrap().len(), 1);
        let updates = presenter.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|(id, _)| *id == 7));
        assert!(updates.last().unwrap().1.contains("100%"));
    }

    #[tokio::test]
    async fn reporter_throttles_intermediate_edits() {
        let presenter = RecordingPresenter::new();
        let reporter = ProgressReporter::spawn(
            presenter.clone(),
            "chat".to_string(),
            Duration::from_secs(60),
        );

        reporter.report(1, "start");
        for percent in 2..50 {
            reporter.report(percent, "working");
        }
        reporter.report(100, "Done");
        drop(reporter);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(presenter.begins.lock().unwrap().len(), 1);
        // Everything between the first message and the terminal report
        // falls inside the throttle window.
        let updates = presenter.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.contains("100%"));
    }
}
