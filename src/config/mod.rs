//! Configuration.
//!
//! Loaded from `config.toml` in the platform config directory (or a path
//! given on the command line), with environment overrides on top. Every
//! field has a serde default so a token-only file is enough to run.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Platform config directory for clipbot (`~/.config/clipbot` on Linux).
pub fn config_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "clipbot")
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".clipbot"))
}

fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Telegram bot token from @BotFather.
    #[serde(default)]
    pub bot_token: String,

    /// Maximum accepted upload size in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Video extensions accepted for staging (lowercase, no dot).
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,

    /// Audio extensions accepted for staging (lowercase, no dot).
    #[serde(default = "default_audio_extensions")]
    pub audio_extensions: Vec<String>,

    /// Directory for staged uploads and produced outputs. `~` expands.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,

    /// Seconds of inactivity after which an idle session is evicted.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Minimum milliseconds between progress-message edits per operation.
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,

    /// Path of the ffmpeg binary.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Path of the ffprobe binary.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    /// Base log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_max_upload_bytes() -> u64 {
    500 * 1024 * 1024 // 500 MiB
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "avi", "mov", "mkv", "wmv"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_audio_extensions() -> Vec<String> {
    ["mp3", "wav", "aac", "m4a"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_temp_dir() -> String {
    "~/.cache/clipbot/files".to_string()
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_progress_throttle_ms() -> u64 {
    1000
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            max_upload_bytes: default_max_upload_bytes(),
            video_extensions: default_video_extensions(),
            audio_extensions: default_audio_extensions(),
            temp_dir: default_temp_dir(),
            session_ttl_secs: default_session_ttl_secs(),
            progress_throttle_ms: default_progress_throttle_ms(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Load from the default config path; missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load and apply environment overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables take priority over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("CLIPBOT_BOT_TOKEN") {
            self.bot_token = token;
        }
        if let Ok(dir) = std::env::var("CLIPBOT_TEMP_DIR") {
            self.temp_dir = dir;
        }
        if let Ok(level) = std::env::var("CLIPBOT_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(bytes) = std::env::var("CLIPBOT_MAX_UPLOAD_BYTES") {
            if let Ok(parsed) = bytes.parse() {
                self.max_upload_bytes = parsed;
            }
        }
    }

    /// The temp dir with `~` and `$VAR` expanded.
    pub fn expanded_temp_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::full(&self.temp_dir).map_or_else(
            |_| self.temp_dir.clone(),
            |expanded| expanded.into_owned(),
        ))
    }

    /// Reject configs the bot cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.bot_token.trim().is_empty() {
            bail!("bot_token is not set (config file or CLIPBOT_BOT_TOKEN)");
        }
        if self.max_upload_bytes == 0 {
            bail!("max_upload_bytes must be greater than zero");
        }
        if self.video_extensions.is_empty() && self.audio_extensions.is_empty() {
            bail!("no supported extensions configured");
        }
        Ok(())
    }
}
