//! clipbot - Telegram bot for quick media edits.
//!
//! A user uploads a video or audio file, then picks an operation from an
//! inline-keyboard menu: format conversion, audio extraction, trimming,
//! multi-file concatenation, video+audio overlay, or rename. The actual
//! media work is delegated to ffmpeg; this crate owns the conversational
//! state machine, the staging area for temporary files, and the dispatch
//! of transforms with progress feedback.
//!
//! ## Architecture
//!
//! ```text
//! Telegram ──getUpdates──▶ TelegramChannel ──Event──▶ Router
//!                                                       │
//!                              SessionStore ◀── state ──┤
//!                              StagingArea  ◀── files ──┤
//!                                                       ▼
//! User ◀── send/edit ◀── Presenter ◀── progress ── Dispatcher ──▶ ffmpeg
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod bot;
pub mod channels;
pub mod config;
pub mod error;
pub mod logging;
pub mod router;
pub mod session;
pub mod staging;
pub mod transform;

// Re-export commonly used types
pub use channels::{Event, EventKind, Presenter, ProgressReporter, TelegramChannel};
pub use config::Config;
pub use error::{InputError, TransformError};
pub use router::Router;
pub use session::{SessionStore, UserState};
pub use staging::{ArtifactRef, MediaKind, StagingArea};
pub use transform::{CancelToken, Dispatcher, MediaTransform, Operation, ProgressSink};
