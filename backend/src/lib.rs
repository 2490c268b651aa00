//! Media Downloader - a download queue for yt-dlp and ffmpeg
//!
//! The queue admits submissions in order, runs at most a configurable number
//! of tool processes at once and tracks each item through
//! waiting, downloading, paused, completed and failed. A small HTTP and
//! WebSocket API exposes it to local front ends.

pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod process;
pub mod server;

use crate::config::SharedSettings;
use crate::db::History;
use crate::download::DownloadQueue;
use std::path::PathBuf;

pub use error::{Error, Result};

/// Application state shared across all components
pub struct AppState {
    pub settings: SharedSettings,
    pub queue: DownloadQueue,
    pub history: History,
    /// Where settings changes are written; `None` keeps them in memory
    pub config_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(settings: SharedSettings, queue: DownloadQueue, history: History) -> Self {
        Self {
            settings,
            queue,
            history,
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }
}
