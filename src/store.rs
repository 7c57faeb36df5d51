//! Durable scan state.
//!
//! The whole [`ScanState`] is one JSON document under a fixed key in a SQLite
//! `kv_store` table. Writes replace the document inside a transaction, so a
//! reader never sees a half-written state.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

use crate::types::{ContactAggregate, ScanState};

/// Fixed store identifier for the scan state document.
pub const STATE_KEY: &str = "email_response_tracker";

/// File name of the pre-SQLite JSON tracker file.
pub const LEGACY_FILE_NAME: &str = "email_response_data.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create store directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Stored state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Legacy import failed: {0}")]
    Legacy(String),
}

/// Persistence for the singleton scan state.
pub trait StateStore: Send + Sync {
    /// Stored state, or an empty state when nothing has been saved.
    fn load(&self) -> Result<ScanState, StoreError>;

    /// Atomically replace the stored state.
    fn save(&self, state: &ScanState) -> Result<(), StoreError>;

    /// Delete the stored state entirely.
    fn reset(&self) -> Result<(), StoreError>;
}

// ============================================================================
// SQLite
// ============================================================================

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        crate::migrations::run_migrations(&conn).map_err(StoreError::Migration)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Import a legacy JSON tracker file when the store holds nothing yet.
    ///
    /// Returns true when a file was imported. A missing file is not an error.
    pub fn import_legacy_if_empty(&self, legacy_path: &Path) -> Result<bool, StoreError> {
        if !legacy_path.exists() || !self.load()?.is_empty() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(legacy_path)
            .map_err(|e| StoreError::Legacy(format!("{}: {}", legacy_path.display(), e)))?;
        let state = parse_legacy_state(&content)?;
        self.save(&state)?;
        log::info!(
            "store: imported {} contacts from {}",
            state.contacts.len(),
            legacy_path.display()
        );
        Ok(true)
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self) -> Result<ScanState, StoreError> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![STATE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(ScanState::default()),
        }
    }

    fn save(&self, state: &ScanState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![STATE_KEY, json, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![STATE_KEY])?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Non-durable store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<ScanState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ScanState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<ScanState, StoreError> {
        Ok(self.state.lock().clone().unwrap_or_default())
    }

    fn save(&self, state: &ScanState) -> Result<(), StoreError> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        *self.state.lock() = None;
        Ok(())
    }
}

// ============================================================================
// Legacy JSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct LegacyTrackerFile {
    #[serde(default)]
    last_scan_date: Option<String>,
    #[serde(default)]
    response_counts: std::collections::BTreeMap<String, u64>,
    #[serde(default)]
    total_threads_scanned: u64,
}

/// Legacy files carry only counts: contacts come back without dates or
/// excerpts. The watermark used `YYYY/MM/DD`.
fn parse_legacy_state(content: &str) -> Result<ScanState, StoreError> {
    let legacy: LegacyTrackerFile =
        serde_json::from_str(content).map_err(|e| StoreError::Legacy(e.to_string()))?;

    let last_scan_date = match legacy.last_scan_date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(
            NaiveDate::parse_from_str(raw, "%Y/%m/%d")
                .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
                .map_err(|e| StoreError::Legacy(format!("last_scan_date {:?}: {}", raw, e)))?,
        ),
        _ => None,
    };

    let mut state = ScanState {
        last_scan_date,
        total_threads_scanned: legacy.total_threads_scanned,
        ..ScanState::default()
    };
    for (address, count) in legacy.response_counts {
        let address = address.trim().to_lowercase();
        if address.is_empty() {
            continue;
        }
        let contact = state
            .contacts
            .entry(address.clone())
            .or_insert_with(|| ContactAggregate::new(address));
        contact.received_count += count;
    }
    Ok(state)
}
