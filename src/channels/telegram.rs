//! Telegram channel: long-polls the Bot API for updates.
//!
//! Inbound: text, slash commands, inline-button callback queries, and
//! video/audio/document uploads. Uploads are checked (extension, size)
//! before download, then streamed straight into the staging area so a
//! large file never sits in memory. Outbound: messages, inline
//! keyboards, message edits, and result files sent as video/audio
//! according to media kind.

use super::{Event, EventKind, Keyboard, Presenter};
use crate::error::InputError;
use crate::staging::{ArtifactRef, MediaKind, StagingArea};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Callback query received when a user clicks an inline button.
#[derive(Debug, Clone)]
pub struct CallbackQuery {
    pub id: String,
    pub from_user_id: i64,
    pub chat_id: String,
    pub message_id: i64,
    pub data: String,
}

pub struct TelegramChannel {
    bot_token: String,
    client: reqwest::Client,
    max_upload_bytes: u64,
    staging: Arc<StagingArea>,
}

impl TelegramChannel {
    pub fn new(bot_token: String, max_upload_bytes: u64, staging: Arc<StagingArea>) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            max_upload_bytes,
            staging,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot_token, file_path
        )
    }

    /// Check an announced upload before downloading anything.
    fn check_upload(&self, file_name: &str, file_size: u64) -> Result<MediaKind, InputError> {
        let Some(kind) = self.staging.classify(file_name) else {
            let ext = Path::new(file_name)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("?")
                .to_string();
            return Err(InputError::UnsupportedExtension(ext));
        };
        if file_size > self.max_upload_bytes {
            return Err(InputError::TooLarge {
                size: file_size,
                limit: self.max_upload_bytes,
            });
        }
        Ok(kind)
    }

    /// Download a file from Telegram by its `file_id`, streaming it into
    /// the staging area chunk by chunk. A failed download leaves nothing
    /// behind.
    async fn download_to_staging(
        &self,
        file_id: &str,
        user_id: i64,
        file_name: &str,
        kind: MediaKind,
    ) -> anyhow::Result<ArtifactRef> {
        // Step 1: resolve the file path via getFile.
        let url = self.api_url("getFile");
        let body = serde_json::json!({ "file_id": file_id });

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let err = resp.text().await?;
            anyhow::bail!("Telegram getFile failed: {err}");
        }

        let data: serde_json::Value = resp.json().await?;
        let file_path = data
            .get("result")
            .and_then(|r| r.get("file_path"))
            .and_then(|p| p.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing file_path in getFile response"))?;

        // Step 2: stream to disk.
        let file_resp = self.client.get(self.file_url(file_path)).send().await?;
        if !file_resp.status().is_success() {
            anyhow::bail!(
                "Failed to download file from Telegram: {}",
                file_resp.status()
            );
        }

        let (artifact, mut file) = self.staging.create(user_id, file_name, kind).await?;
        let mut stream = file_resp.bytes_stream();
        let write = async {
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
            anyhow::Ok(())
        };
        if let Err(e) = write.await {
            self.staging.delete(&artifact).await;
            return Err(e);
        }
        Ok(artifact)
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = resp.text().await?;
            anyhow::bail!("Telegram sendMessage failed: {err}");
        }
        Ok(())
    }

    /// Send a message with inline keyboard buttons.
    ///
    /// Returns the `message_id` of the sent message (for later editing).
    pub async fn send_with_inline_keyboard(
        &self,
        chat_id: &str,
        text: &str,
        buttons: Keyboard,
    ) -> anyhow::Result<i64> {
        let keyboard: Vec<Vec<serde_json::Value>> = buttons
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|btn| {
                        serde_json::json!({
                            "text": btn.text,
                            "callback_data": btn.callback_data
                        })
                    })
                    .collect()
            })
            .collect();

        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": { "inline_keyboard": keyboard }
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = resp.text().await?;
            anyhow::bail!("Telegram sendMessage with keyboard failed: {err}");
        }

        let data: serde_json::Value = resp.json().await?;
        data.get("result")
            .and_then(|r| r.get("message_id"))
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("Missing message_id in response"))
    }

    /// Edit the text of an existing message.
    pub async fn edit_message_text(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
    ) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });

        let resp = self
            .client
            .post(self.api_url("editMessageText"))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = resp.text().await?;
            anyhow::bail!("Telegram editMessageText failed: {err}");
        }
        Ok(())
    }

    /// Answer a callback query (removes the loading spinner).
    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut body = serde_json::json!({ "callback_query_id": callback_query_id });
        if let Some(t) = text {
            body["text"] = serde_json::Value::String(t.to_string());
        }

        let resp = self
            .client
            .post(self.api_url("answerCallbackQuery"))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = resp.text().await?;
            anyhow::bail!("Telegram answerCallbackQuery failed: {err}");
        }
        Ok(())
    }

    /// Send a result file, choosing the API method by media kind.
    pub async fn send_file(
        &self,
        chat_id: &str,
        artifact: &ArtifactRef,
        caption: Option<&str>,
    ) -> anyhow::Result<()> {
        let method = match artifact.kind {
            MediaKind::Video => "sendVideo",
            MediaKind::Audio => "sendAudio",
        };
        let field = match artifact.kind {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        };

        let file_bytes = tokio::fs::read(&artifact.path).await?;
        let part = Part::bytes(file_bytes).file_name(artifact.display_name.clone());

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), part);
        if let Some(cap) = caption {
            form = form.text("caption", cap.to_string());
        }

        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = resp.text().await?;
            anyhow::bail!("Telegram {method} failed: {err}");
        }

        tracing::info!("Telegram file sent to {chat_id}: {}", artifact.display_name);
        Ok(())
    }

    /// Long-poll `getUpdates` and emit router events until `tx` closes.
    pub async fn listen(&self, tx: mpsc::Sender<Event>) -> anyhow::Result<()> {
        let mut offset: i64 = 0;

        tracing::info!("Telegram channel listening for updates...");

        loop {
            let body = serde_json::json!({
                "offset": offset,
                "timeout": 30,
                "allowed_updates": ["message", "callback_query"],
            });

            let resp = match self
                .client
                .post(self.api_url("getUpdates"))
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Telegram poll error: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let data: serde_json::Value = match resp.json().await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("Telegram parse error: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if let Some(results) = data.get("result").and_then(serde_json::Value::as_array) {
                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(event) = self.event_from_update(update).await else {
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Turn one update into a router event, downloading uploads.
    /// Unsupported update shapes are skipped.
    async fn event_from_update(&self, update: &serde_json::Value) -> Option<Event> {
        if let Some(callback) = update.get("callback_query") {
            let query = parse_callback_query(callback)?;
            return Some(Event {
                user_id: query.from_user_id,
                chat_id: query.chat_id.clone(),
                kind: EventKind::Callback {
                    query_id: query.id,
                    message_id: query.message_id,
                    data: query.data,
                },
            });
        }

        let message = update.get("message")?;
        let chat_id = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(serde_json::Value::as_i64)?
            .to_string();
        let user_id = message
            .get("from")
            .and_then(|f| f.get("id"))
            .and_then(serde_json::Value::as_i64)?;

        if let Some(text) = message.get("text").and_then(|v| v.as_str()) {
            let kind = match text.strip_prefix('/') {
                Some(cmd) => EventKind::Command(cmd.to_string()),
                None => EventKind::Text(text.to_string()),
            };
            return Some(Event {
                user_id,
                chat_id,
                kind,
            });
        }

        // Video, audio or document upload. Extension and size are checked
        // against the announced metadata before a byte is downloaded.
        let (file_id, file_name, file_size) = parse_media_attachment(message)?;
        let kind = match self.check_upload(&file_name, file_size) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!(user_id, file_name, file_size, "Rejecting upload: {e}");
                let _ = self
                    .send_message(&chat_id, &format!("❌ {}", e.user_message()))
                    .await;
                return None;
            }
        };

        let artifact = match self
            .download_to_staging(&file_id, user_id, &file_name, kind)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::error!("Failed to download upload: {e}");
                let _ = self
                    .send_message(&chat_id, "Unable to download the file, please try again.")
                    .await;
                return None;
            }
        };

        Some(Event {
            user_id,
            chat_id,
            kind: EventKind::Upload { artifact },
        })
    }
}

/// Extract `(file_id, file_name, size)` from a video/audio/document message.
fn parse_media_attachment(message: &serde_json::Value) -> Option<(String, String, u64)> {
    let (attachment, default_ext) = if let Some(v) = message.get("video") {
        (v, "mp4")
    } else if let Some(a) = message.get("audio") {
        (a, "mp3")
    } else if let Some(d) = message.get("document") {
        (d, "")
    } else {
        return None;
    };

    let file_id = attachment.get("file_id")?.as_str()?.to_string();
    let file_size = attachment
        .get("file_size")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let file_name = attachment
        .get("file_name")
        .and_then(|n| n.as_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| {
            let unique = attachment
                .get("file_unique_id")
                .and_then(|u| u.as_str())
                .unwrap_or("upload");
            if default_ext.is_empty() {
                unique.to_string()
            } else {
                format!("{unique}.{default_ext}")
            }
        });

    Some((file_id, file_name, file_size))
}

/// Parse a `callback_query` JSON object.
fn parse_callback_query(callback: &serde_json::Value) -> Option<CallbackQuery> {
    let id = callback.get("id")?.as_str()?.to_string();
    let data = callback.get("data")?.as_str()?.to_string();
    let from_user_id = callback.get("from")?.get("id")?.as_i64()?;

    let message = callback.get("message")?;
    let chat_id = message.get("chat")?.get("id")?.as_i64()?.to_string();
    let message_id = message.get("message_id")?.as_i64()?;

    Some(CallbackQuery {
        id,
        from_user_id,
        chat_id,
        message_id,
        data,
    })
}

// ============================================================================
// Presenter implementation
// ============================================================================

/// Presenter backed by the Telegram channel. Progress edits and callback
/// acks are fire-and-forget: errors are logged at debug and discarded.
pub struct TelegramPresenter {
    channel: Arc<TelegramChannel>,
}

impl TelegramPresenter {
    pub fn new(channel: Arc<TelegramChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Presenter for TelegramPresenter {
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        self.channel.send_message(chat_id, text).await
    }

    async fn send_menu(
        &self,
        chat_id: &str,
        text: &str,
        keyboard: Keyboard,
    ) -> anyhow::Result<()> {
        self.channel
            .send_with_inline_keyboard(chat_id, text, keyboard)
            .await?;
        Ok(())
    }

    async fn send_artifact(
        &self,
        chat_id: &str,
        artifact: &ArtifactRef,
        caption: &str,
    ) -> anyhow::Result<()> {
        self.channel.send_file(chat_id, artifact, Some(caption)).await
    }

    async fn ack_callback(&self, query_id: &str, text: Option<&str>) {
        if let Err(e) = self.channel.answer_callback_query(query_id, text).await {
            tracing::debug!("answerCallbackQuery failed (ignored): {e}");
        }
    }

    async fn begin_progress(&self, chat_id: &str, text: &str) -> Option<i64> {
        match self
            .channel
            .send_with_inline_keyboard(chat_id, text, Vec::new())
            .await
        {
            Ok(message_id) => Some(message_id),
            Err(e) => {
                tracing::debug!("Progress message send failed (ignored): {e}");
                None
            }
        }
    }

    async fn update_progress(&self, chat_id: &str, message_id: i64, text: &str) {
        if let Err(e) = self
            .channel
            .edit_message_text(chat_id, message_id, text)
            .await
        {
            // The message may be deleted or too old to edit; progress is
            // best-effort and the transform keeps running.
            tracing::debug!("Progress edit failed (ignored): {e}");
        }
    }
}
