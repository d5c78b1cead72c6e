//! Staging area for temporary media artifacts.
//!
//! Every uploaded file and every produced output lives here until it is
//! delivered or superseded. Names embed the user id and a fresh UUID so
//! concurrent users never collide. Deletion is best-effort and
//! idempotent: cleanup may race a restart, so a missing file is a no-op.

use crate::error::TransformError;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Kind of media an artifact holds, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Reference to one file tracked by the staging area.
///
/// `display_name` is what the user sees (original upload name or the
/// suggested output name); `path` is the collision-free on-disk location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub display_name: String,
    pub kind: MediaKind,
}

/// Filesystem-backed staging area, partitioned by user id + UUID naming.
pub struct StagingArea {
    dir: PathBuf,
    video_exts: Vec<String>,
    audio_exts: Vec<String>,
}

impl StagingArea {
    /// Create the staging area, making the directory if needed.
    pub async fn new(
        dir: PathBuf,
        video_exts: Vec<String>,
        audio_exts: Vec<String>,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            video_exts,
            audio_exts,
        })
    }

    /// Classify a file name by extension, or `None` if unsupported.
    pub fn classify(&self, file_name: &str) -> Option<MediaKind> {
        let ext = extension_of(file_name)?;
        if self.video_exts.iter().any(|e| e == &ext) {
            Some(MediaKind::Video)
        } else if self.audio_exts.iter().any(|e| e == &ext) {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }

    /// Persist uploaded bytes under a collision-free name.
    pub async fn save(
        &self,
        user_id: i64,
        file_name: &str,
        kind: MediaKind,
        bytes: &[u8],
    ) -> Result<ArtifactRef, TransformError> {
        let path = self.unique_path(user_id, file_name);
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(user_id, path = %path.display(), size = bytes.len(), "Staged artifact");
        Ok(ArtifactRef {
            path,
            display_name: file_name.to_string(),
            kind,
        })
    }

    /// Open a fresh collision-free file for incremental writes, for
    /// streamed downloads that must not be buffered in memory. The
    /// returned reference is valid once the caller finishes writing; on
    /// a failed write the caller deletes it.
    pub async fn create(
        &self,
        user_id: i64,
        file_name: &str,
        kind: MediaKind,
    ) -> Result<(ArtifactRef, tokio::fs::File), TransformError> {
        let path = self.unique_path(user_id, file_name);
        let file = tokio::fs::File::create(&path).await?;
        tracing::debug!(user_id, path = %path.display(), "Created staging file for stream");
        Ok((
            ArtifactRef {
                path,
                display_name: file_name.to_string(),
                kind,
            },
            file,
        ))
    }

    /// Read an artifact back. Byte-identical to what was saved.
    pub async fn open(&self, artifact: &ArtifactRef) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&artifact.path).await
    }

    /// Remove an artifact. Already-gone files are fine.
    pub async fn delete(&self, artifact: &ArtifactRef) {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => tracing::debug!(path = %artifact.path.display(), "Deleted artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %artifact.path.display(), "Failed to delete artifact: {e}");
            }
        }
    }

    /// Collision-free location for a transform to write its output into.
    pub fn output_path(&self, user_id: i64, display_name: &str) -> PathBuf {
        self.unique_path(user_id, display_name)
    }

    /// The directory artifacts live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn unique_path(&self, user_id: i64, file_name: &str) -> PathBuf {
        let token = Uuid::new_v4();
        self.dir
            .join(format!("{user_id}_{token}_{}", sanitize_file_name(file_name)))
    }
}

/// Lowercased extension without the dot, if any.
fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// Strip path separators and control characters from a user-supplied name.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0') && !c.is_control())
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn area() -> (tempfile::TempDir, StagingArea) {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(
            dir.path().to_path_buf(),
            vec!["mp4".into(), "mkv".into()],
            vec!["mp3".into(), "wav".into()],
        )
        .await
        .unwrap();
        (dir, staging)
    }

    #[tokio::test]
    async fn save_open_round_trip() {
        let (_dir, staging) = area().await;
        let content = b"not really a video".to_vec();

        let artifact = staging
            .save(42, "clip.mp4", MediaKind::Video, &content)
            .await
            .unwrap();
        let read_back = staging.open(&artifact).await.unwrap();

        assert_eq!(read_back, content);
        assert_eq!(artifact.display_name, "clip.mp4");
        assert_eq!(artifact.kind, MediaKind::Video);
    }

    #[tokio::test]
    async fn repeated_saves_never_collide() {
        let (_dir, staging) = area().await;

        let a = staging.save(1, "x.mp4", MediaKind::Video, b"a").await.unwrap();
        let b = staging.save(1, "x.mp4", MediaKind::Video, b"b").await.unwrap();

        assert_ne!(a.path, b.path);
        assert_eq!(staging.open(&a).await.unwrap(), b"a");
        assert_eq!(staging.open(&b).await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn create_supports_incremental_writes() {
        use tokio::io::AsyncWriteExt;

        let (_dir, staging) = area().await;
        let (artifact, mut file) = staging
            .create(9, "stream.mp4", MediaKind::Video)
            .await
            .unwrap();

        file.write_all(b"chunk-one ").await.unwrap();
        file.write_all(b"chunk-two").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert_eq!(artifact.display_name, "stream.mp4");
        assert_eq!(staging.open(&artifact).await.unwrap(), b"chunk-one chunk-two");
    }

    #[tokio::test]
    async fn names_embed_user_id() {
        let (_dir, staging) = area().await;
        let artifact = staging.save(77, "x.mp4", MediaKind::Video, b"a").await.unwrap();
        let name = artifact.path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("77_"));
        assert!(name.ends_with("x.mp4"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, staging) = area().await;
        let artifact = staging.save(1, "x.mp4", MediaKind::Video, b"a").await.unwrap();

        staging.delete(&artifact).await;
        assert!(!artifact.path.exists());

        // Second delete of the same reference: no panic, no error surfaced.
        staging.delete(&artifact).await;

        // Never-existing reference is also fine.
        let ghost = ArtifactRef {
            path: staging.dir().join("never_there.mp4"),
            display_name: "never_there.mp4".into(),
            kind: MediaKind::Video,
        };
        staging.delete(&ghost).await;
    }

    #[tokio::test]
    async fn classify_by_extension() {
        let (_dir, staging) = area().await;
        assert_eq!(staging.classify("a.mp4"), Some(MediaKind::Video));
        assert_eq!(staging.classify("a.MKV"), Some(MediaKind::Video));
        assert_eq!(staging.classify("a.mp3"), Some(MediaKind::Audio));
        assert_eq!(staging.classify("song.wav"), Some(MediaKind::Audio));
        assert_eq!(staging.classify("a.exe"), None);
        assert_eq!(staging.classify("noext"), None);
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_file_name("a\\b.mp4"), "ab.mp4");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("clip.mp4"), "clip.mp4");
    }
}
