//! Download history persisted in SQLite

mod schema;

pub use schema::*;

use crate::config::SharedSettings;
use crate::download::{CompletionEvent, QueueEvent};
use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// SQLite-backed record of completed downloads
#[derive(Clone)]
pub struct History {
    conn: Arc<Mutex<Connection>>,
}

impl History {
    /// Open the history database in the config directory
    pub fn open_default() -> Result<Self> {
        Self::open(&Self::db_path())
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn db_path() -> PathBuf {
        crate::config::config_dir().join("history.db")
    }

    /// Store a completion. Recording the same item twice keeps the latest.
    pub fn record(&self, event: &CompletionEvent) -> Result<()> {
        let record = HistoryRecord::from(event);
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT OR REPLACE INTO history (
                id, url, output_file, size_bytes, duration_ms, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                record.id,
                record.url,
                record
                    .output_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                record.size_bytes,
                record.duration_ms,
                record.completed_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Most recent completions first
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"
            SELECT id, url, output_file, size_bytes, duration_ms, completed_at
            FROM history
            ORDER BY completed_at DESC
            LIMIT ?1
            "#,
        )?;

        let records = stmt
            .query_map([limit as i64], |row| {
                let completed_at = row.get::<_, String>(5)?;
                Ok(HistoryRecord {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    output_file: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
                    size_bytes: row.get(3)?,
                    duration_ms: row.get(4)?,
                    completed_at: chrono::DateTime::parse_from_rfc3339(&completed_at)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                        })?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    /// Delete all history. Returns the number of rows removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM history", [])?)
    }
}

/// Record completions from the queue until the channel closes. Nothing is
/// written while history is disabled in settings.
pub fn spawn_recorder(
    history: History,
    mut events: broadcast::Receiver<QueueEvent>,
    settings: SharedSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Completed { completion }) => {
                    if !settings.read().history.enabled {
                        debug!("History disabled, not recording {}", completion.id);
                        continue;
                    }
                    if let Err(e) = history.record(&completion) {
                        warn!("Failed to record {} in history: {}", completion.id, e);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("History recorder lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("History recorder stopped");
    })
}
