//! Error types for clipbot.

use thiserror::Error;

/// A problem with what the user sent. Always reported back with a
/// corrective message; never fatal, never retried.
#[derive(Error, Debug)]
pub enum InputError {
    /// File extension is not in the configured video or audio sets.
    #[error("unsupported file extension: .{0}")]
    UnsupportedExtension(String),

    /// An operation that needs a staged file was requested without one.
    #[error("no file staged")]
    NoStagedInput,

    /// Split times could not be parsed as two numbers.
    #[error("could not parse split times from: {0}")]
    BadSplitTimes(String),

    /// The new file name is empty or contains path separators.
    #[error("invalid file name: {0}")]
    BadFileName(String),

    /// Upload exceeds the configured size ceiling.
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    /// Merge was requested with fewer than two queued files.
    #[error("merge needs at least two files, queue has {0}")]
    QueueTooShort(usize),

    /// The uploaded file is not the media kind the flow expects.
    #[error("expected {expected} file, got {got}")]
    WrongMediaKind {
        expected: &'static str,
        got: &'static str,
    },
}

impl InputError {
    /// Corrective message shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnsupportedExtension(ext) => {
                format!("Unsupported file format: .{ext}. Send a supported video or audio file.")
            }
            Self::NoStagedInput => {
                "No file to work on yet. Send me a video or audio file first.".to_string()
            }
            Self::BadSplitTimes(text) => format!(
                "Could not read split times from \"{text}\". \
                 Send start and end in seconds, e.g. \"10 30\"."
            ),
            Self::BadFileName(name) => format!(
                "\"{name}\" is not a usable file name. \
                 Send a single name with extension, e.g. \"holiday.mp4\"."
            ),
            Self::TooLarge { size, limit } => format!(
                "File is too large ({} MB, limit {} MB).",
                size / (1024 * 1024),
                limit / (1024 * 1024)
            ),
            Self::QueueTooShort(n) => {
                format!("Merge needs at least two files, you have {n}. Send more files first.")
            }
            Self::WrongMediaKind { expected, .. } => {
                format!("That flow expects a {expected} file. Send one, or go back to the main menu.")
            }
        }
    }
}

/// A failure of the media capability or the staging filesystem.
/// Caught at the dispatcher boundary; the user sees one generic
/// failure notice, the cause goes to the log.
#[derive(Error, Debug)]
pub enum TransformError {
    /// The underlying media operation failed.
    #[error("media operation failed: {0}")]
    Capability(String),

    /// Staging or output I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The dispatcher was handed inputs that don't fit the operation.
    #[error("bad dispatch inputs: {0}")]
    BadInputs(String),
}
