//! Download item and its lifecycle

use crate::download::progress::ProgressSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Reason shown for a failure that carried no text of its own
pub const DEFAULT_FAILURE_MESSAGE: &str = "process exited with error";

/// Opaque, stable item identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a download item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Waiting,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user wants out of the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

/// Requested format. Unset fields are left to the tool's automatic selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormatSelection {
    #[serde(default)]
    pub kind: MediaKind,

    /// Explicit tool format expression, e.g. `137+140`
    pub format_id: Option<String>,

    /// Output container or audio codec, e.g. `mp4`, `mkv`, `mp3`
    pub container: Option<String>,

    /// Maximum video height in pixels
    pub max_height: Option<u32>,
}

impl FormatSelection {
    pub fn audio(codec: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Audio,
            container: Some(codec.into()),
            ..Self::default()
        }
    }
}

/// Byte size of the media, exact once the tool reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteSize {
    pub bytes: u64,
    pub estimated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The tool could not be spawned; no process ever existed
    StartFailure,
    /// The tool ran and exited with an error
    RuntimeFailure,
}

/// Failure attached to a `failed` item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: FailureKind,
    pub message: String,
}

impl ItemError {
    /// Build an error; blank messages become [`DEFAULT_FAILURE_MESSAGE`]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            DEFAULT_FAILURE_MESSAGE.to_string()
        } else {
            message.trim().to_string()
        };
        Self { kind, message }
    }

    pub fn start(message: impl Into<String>) -> Self {
        Self::new(FailureKind::StartFailure, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RuntimeFailure, message)
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// An action that is not valid in the item's current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} an item that is {from}")]
pub struct TransitionError {
    pub from: DownloadState,
    pub action: &'static str,
}

/// One submitted download and its tracked state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: ItemId,
    pub url: String,
    pub format: Option<FormatSelection>,
    /// Directory the tool writes into
    pub output_dir: PathBuf,
    /// Final file, once the tool names it
    pub output_file: Option<PathBuf>,
    /// Zero-based position in the queue order
    pub position: usize,
    pub state: DownloadState,
    /// 0-100, never decreasing within one attempt
    pub progress: f64,
    /// Bytes per second
    pub speed: Option<u64>,
    /// Seconds remaining
    pub eta: Option<u64>,
    pub size: Option<ByteSize>,
    pub error: Option<ItemError>,
    pub retry_count: u32,
    /// Number of times the item has been dispatched
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadItem {
    pub fn new(url: String, format: Option<FormatSelection>, output_dir: PathBuf) -> Self {
        Self {
            id: ItemId::new(),
            url,
            format,
            output_dir,
            output_file: None,
            position: 0,
            state: DownloadState::Waiting,
            progress: 0.0,
            speed: None,
            eta: None,
            size: None,
            error: None,
            retry_count: 0,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn reject(&self, action: &'static str) -> TransitionError {
        TransitionError {
            from: self.state,
            action,
        }
    }

    /// `waiting -> downloading`. Returns the new attempt number.
    pub fn dispatch(&mut self) -> Result<u32, TransitionError> {
        if self.state != DownloadState::Waiting {
            return Err(self.reject("dispatch"));
        }
        self.state = DownloadState::Downloading;
        self.attempt += 1;
        self.started_at = Some(Utc::now());
        self.speed = None;
        self.eta = None;
        Ok(self.attempt)
    }

    /// `downloading | waiting -> paused`. Progress is kept so the item does
    /// not visually regress when resumed.
    pub fn pause(&mut self) -> Result<(), TransitionError> {
        match self.state {
            DownloadState::Downloading | DownloadState::Waiting => {
                self.state = DownloadState::Paused;
                self.speed = None;
                self.eta = None;
                Ok(())
            }
            _ => Err(self.reject("pause")),
        }
    }

    /// `paused -> waiting`
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        if self.state != DownloadState::Paused {
            return Err(self.reject("resume"));
        }
        self.state = DownloadState::Waiting;
        Ok(())
    }

    /// `downloading -> completed`
    pub fn complete(&mut self, output_file: Option<PathBuf>) -> Result<(), TransitionError> {
        if self.state != DownloadState::Downloading {
            return Err(self.reject("complete"));
        }
        self.state = DownloadState::Completed;
        self.progress = 100.0;
        self.speed = None;
        self.eta = Some(0);
        if let Some(size) = self.size.as_mut() {
            size.estimated = false;
        }
        if output_file.is_some() {
            self.output_file = output_file;
        }
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `downloading -> failed`
    pub fn fail(&mut self, error: ItemError) -> Result<(), TransitionError> {
        if self.state != DownloadState::Downloading {
            return Err(self.reject("fail"));
        }
        self.state = DownloadState::Failed;
        self.speed = None;
        self.eta = None;
        self.error = Some(error);
        Ok(())
    }

    /// `failed -> waiting`: clears the error, zeroes progress and counts the retry
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        if self.state != DownloadState::Failed {
            return Err(self.reject("retry"));
        }
        self.state = DownloadState::Waiting;
        self.error = None;
        self.progress = 0.0;
        self.speed = None;
        self.eta = None;
        self.retry_count += 1;
        Ok(())
    }

    /// Apply a progress sample. `percent` must already be made monotonic by
    /// the caller's tracker; it is ignored if it would move backwards.
    /// Only meaningful while downloading; returns whether anything changed.
    pub fn apply_progress(&mut self, percent: Option<f64>, sample: &ProgressSample) -> bool {
        if self.state != DownloadState::Downloading {
            return false;
        }
        if let Some(percent) = percent {
            if percent > self.progress {
                self.progress = percent.clamp(0.0, 100.0);
            }
        }
        self.speed = sample.speed;
        self.eta = sample.eta;
        if let Some(bytes) = sample.total_bytes {
            self.size = Some(ByteSize {
                bytes,
                estimated: sample.estimated_total,
            });
        }
        true
    }

    /// Record the file the tool is writing
    pub fn set_output_file(&mut self, path: PathBuf) {
        if self.state == DownloadState::Downloading {
            self.output_file = Some(path);
        }
    }
}
