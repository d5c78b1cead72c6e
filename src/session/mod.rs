//! Per-user session store.
//!
//! One `Session` per user id: the conversational state (what the bot is
//! waiting for next), the currently staged file, the merge queue, the
//! last reported progress, and a mutex that serializes transforms for
//! that user. Sessions are created lazily on first touch and swept after
//! a period of inactivity; there is no persistence.

use crate::staging::ArtifactRef;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// What the bot is waiting for next from a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserState {
    /// Nothing pending; menu selections and uploads are accepted.
    #[default]
    Idle,
    /// Collecting files for a multi-file merge.
    AwaitingMergeFiles,
    /// Waiting for the audio file to overlay on the staged video.
    AwaitingAudioMerge,
    /// Waiting for a "start end" text message.
    AwaitingSplitTimes,
    /// Waiting for a new file name.
    AwaitingNewName,
}

/// Last reported progress for a user's in-flight operation. Advisory
/// only; the percent never goes backwards within one operation.
#[derive(Debug, Clone)]
pub struct Progress {
    pub percent: u8,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            percent: 0,
            status: "Idle".to_string(),
            updated_at: Utc::now(),
        }
    }
}

struct Session {
    state: UserState,
    staged: Option<ArtifactRef>,
    merge_queue: Vec<ArtifactRef>,
    progress: Progress,
    /// Held for the duration of one in-flight transform. Lives inside the
    /// session entry so it is evicted together with it.
    transform_lock: Arc<Mutex<()>>,
    last_seen: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            state: UserState::Idle,
            staged: None,
            merge_queue: Vec::new(),
            progress: Progress::default(),
            transform_lock: Arc::new(Mutex::new(())),
            last_seen: Instant::now(),
        }
    }
}

/// Process-wide map from user id to session. All mutation goes through
/// these operations; each one is atomic per user (the map shard lock is
/// held for the whole read-modify-write).
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<i64, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; an unseen user reads as `Idle` without creating an entry.
    pub fn state(&self, user_id: i64) -> UserState {
        self.sessions
            .get(&user_id)
            .map_or(UserState::Idle, |s| s.state)
    }

    /// Overwrite the state. No transition validation here; callers only
    /// request transitions from the routing table.
    pub fn set_state(&self, user_id: i64, state: UserState) {
        self.with_session(user_id, |s| s.state = state);
    }

    /// Replace the staged input, returning the superseded artifact so the
    /// caller can delete its file. Staging never deletes implicitly.
    pub fn stage(&self, user_id: i64, artifact: ArtifactRef) -> Option<ArtifactRef> {
        self.with_session(user_id, |s| s.staged.replace(artifact))
    }

    /// Clone of the staged input, if any.
    pub fn staged(&self, user_id: i64) -> Option<ArtifactRef> {
        self.sessions
            .get(&user_id)
            .and_then(|s| s.staged.clone())
    }

    /// Remove and return the staged input.
    pub fn take_staged(&self, user_id: i64) -> Option<ArtifactRef> {
        self.with_session(user_id, |s| s.staged.take())
    }

    /// Append to the merge queue, returning the new queue length.
    pub fn enqueue(&self, user_id: i64, artifact: ArtifactRef) -> usize {
        self.with_session(user_id, |s| {
            s.merge_queue.push(artifact);
            s.merge_queue.len()
        })
    }

    pub fn queue_len(&self, user_id: i64) -> usize {
        self.sessions
            .get(&user_id)
            .map_or(0, |s| s.merge_queue.len())
    }

    /// Drain the merge queue in enqueue order.
    pub fn dequeue_all(&self, user_id: i64) -> Vec<ArtifactRef> {
        self.with_session(user_id, |s| std::mem::take(&mut s.merge_queue))
    }

    /// Empty the merge queue, returning what was dropped for cleanup.
    pub fn clear_queue(&self, user_id: i64) -> Vec<ArtifactRef> {
        self.dequeue_all(user_id)
    }

    /// The per-user transform mutex. A second acquire while held blocks
    /// until the first releases; same-user requests serialize.
    pub fn lock_handle(&self, user_id: i64) -> Arc<Mutex<()>> {
        self.with_session(user_id, |s| s.transform_lock.clone())
    }

    /// Reset the progress tracker at the start of an operation.
    pub fn begin_operation(&self, user_id: i64) {
        self.with_session(user_id, |s| {
            s.progress = Progress {
                percent: 0,
                status: "Starting".to_string(),
                updated_at: Utc::now(),
            };
        });
    }

    /// Record reported progress. A stale lower percent updates the status
    /// text and timestamp but never lowers the stored percent.
    pub fn record_progress(&self, user_id: i64, percent: u8, status: &str) {
        self.with_session(user_id, |s| {
            s.progress = Progress {
                percent: percent.clamp(0, 100).max(s.progress.percent),
                status: status.to_string(),
                updated_at: Utc::now(),
            };
        });
    }

    pub fn progress(&self, user_id: i64) -> Progress {
        self.sessions
            .get(&user_id)
            .map_or_else(Progress::default, |s| s.progress.clone())
    }

    /// Evict sessions idle for longer than `ttl`. Sessions whose transform
    /// lock is currently held are skipped. Returns the staged and queued
    /// artifacts of evicted sessions so the caller can delete their files.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<ArtifactRef> {
        let mut orphaned = Vec::new();
        self.sessions.retain(|user_id, session| {
            if session.last_seen.elapsed() < ttl {
                return true;
            }
            if session.transform_lock.try_lock().is_err() {
                // In-flight transform; let the next sweep get it.
                return true;
            }
            tracing::info!(user_id, "Evicting idle session");
            orphaned.extend(session.staged.take());
            orphaned.append(&mut session.merge_queue);
            false
        });
        orphaned
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn with_session<R>(&self, user_id: i64, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut entry = self.sessions.entry(user_id).or_insert_with(Session::new);
        entry.last_seen = Instant::now();
        f(&mut entry)
    }
}
