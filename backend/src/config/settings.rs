//! Settings data structures

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Lowest accepted concurrency ceiling
pub const MIN_CONCURRENT_DOWNLOADS: usize = 1;

/// Highest accepted concurrency ceiling
pub const MAX_CONCURRENT_DOWNLOADS: usize = 10;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    pub server: ServerSettings,

    /// Queue and process behaviour
    pub downloads: DownloadSettings,

    /// External tool locations
    #[serde(default)]
    pub tools: ToolSettings,

    /// Category to destination folder mappings
    pub categories: HashMap<String, CategoryConfig>,

    /// Download history recording
    #[serde(default)]
    pub history: HistorySettings,
}

impl Settings {
    /// Resolve the output directory for a category, falling back to the
    /// `video` category and finally the current directory.
    pub fn destination_for(&self, category: Option<&str>) -> PathBuf {
        category
            .and_then(|c| self.categories.get(c))
            .or_else(|| self.categories.get("video"))
            .map(|c| c.destination.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl Default for Settings {
    fn default() -> Self {
        let downloads_dir = dirs::download_dir().unwrap_or_else(|| PathBuf::from("./downloads"));

        let mut categories = HashMap::new();

        categories.insert(
            "video".to_string(),
            CategoryConfig {
                name: "Video".to_string(),
                destination: dirs::video_dir().unwrap_or_else(|| downloads_dir.clone()),
            },
        );

        categories.insert(
            "audio".to_string(),
            CategoryConfig {
                name: "Audio".to_string(),
                destination: dirs::audio_dir().unwrap_or_else(|| downloads_dir.clone()),
            },
        );

        Self {
            server: ServerSettings::default(),
            downloads: DownloadSettings::default(),
            tools: ToolSettings::default(),
            categories,
            history: HistorySettings::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8788,
        }
    }
}

/// Queue and process behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Maximum number of items downloading at once
    pub max_concurrent: usize,

    /// How long a process gets to exit after a graceful stop before it is killed
    pub stop_grace_ms: u64,

    /// yt-dlp output template, relative to the category destination
    pub output_template: String,

    /// Automatic retry policy
    #[serde(default)]
    pub retry: RetrySettings,
}

impl DownloadSettings {
    /// The concurrency ceiling clamped to the accepted range
    pub fn concurrency_limit(&self) -> usize {
        clamp_concurrency(self.max_concurrent)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            stop_grace_ms: 3000,
            output_template: "%(title)s [%(id)s].%(ext)s".to_string(),
            retry: RetrySettings::default(),
        }
    }
}

/// Clamp a requested concurrency ceiling into `MIN..=MAX`
pub fn clamp_concurrency(n: usize) -> usize {
    n.clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS)
}

/// Automatic retry policy. Zero means failed items wait for a manual retry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_automatic_retries: u32,
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// yt-dlp executable, looked up on PATH when not absolute
    pub ytdlp_path: PathBuf,

    /// ffmpeg location handed to yt-dlp
    pub ffmpeg_path: Option<PathBuf>,

    /// Extra arguments appended to every yt-dlp invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            ytdlp_path: PathBuf::from("yt-dlp"),
            ffmpeg_path: None,
            extra_args: Vec::new(),
        }
    }
}

/// Configuration for a download category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Display name for the category
    pub name: String,

    /// Destination folder for downloads of this category
    pub destination: PathBuf,
}

/// History recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySettings {
    /// When false (privacy mode) completed downloads are not recorded
    pub enabled: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}
