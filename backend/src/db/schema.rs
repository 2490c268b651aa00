//! History schema types

use crate::download::CompletionEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub(super) const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS history (
        id TEXT PRIMARY KEY,
        url TEXT NOT NULL,
        output_file TEXT,
        size_bytes INTEGER,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        completed_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_history_completed_at ON history(completed_at);
"#;

/// A finished download as stored in the history table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub url: String,
    pub output_file: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl From<&CompletionEvent> for HistoryRecord {
    fn from(event: &CompletionEvent) -> Self {
        Self {
            id: event.id.to_string(),
            url: event.url.clone(),
            output_file: event.output_file.clone(),
            size_bytes: event.size_bytes,
            duration_ms: event.duration_ms,
            completed_at: event.completed_at,
        }
    }
}
