//! Snapshot Storage
//!
//! SQLite file holding exactly one row: the whole `Dataset` serialized as a
//! JSON blob. Every save replaces the row inside one transaction, so a reader
//! sees either the previous snapshot or the new one.
//!
//! # Schema Design
//!
//! ```sql
//! CREATE TABLE dataset_snapshot (
//!     id INTEGER PRIMARY KEY CHECK (id = 1),
//!     saved_at INTEGER NOT NULL,
//!     entity_count INTEGER NOT NULL,
//!     record_count INTEGER NOT NULL,
//!     dataset_blob BLOB NOT NULL
//! );
//! ```
//!
//! Single writer only. Nothing here locks the file against a second process.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::Dataset;

/// Schema version for migrations.
/// Version history:
/// - v1: Initial schema
const SCHEMA_VERSION: u32 = 1;

pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    /// Open (or create) the snapshot file at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, SnapshotError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), SnapshotError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current_version {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS dataset_snapshot (
                        id INTEGER PRIMARY KEY CHECK (id = 1),
                        saved_at INTEGER NOT NULL,
                        entity_count INTEGER NOT NULL,
                        record_count INTEGER NOT NULL,
                        dataset_blob BLOB NOT NULL
                    );
                    "#,
                )?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
                info!("Created snapshot store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Snapshot store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Snapshot store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
                return Err(SnapshotError::SchemaVersion(v));
            }
        }

        Ok(())
    }

    /// Load the last saved dataset; `None` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<Dataset>, SnapshotError> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT dataset_blob FROM dataset_snapshot WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            Some(bytes) => {
                let dataset: Dataset = serde_json::from_slice(&bytes)?;
                debug!(records = dataset.records.len(), "Loaded snapshot");
                Ok(Some(dataset))
            }
            None => Ok(None),
        }
    }

    /// Load, or an empty dataset when no snapshot exists.
    pub fn load_or_default(&self) -> Result<Dataset, SnapshotError> {
        Ok(self.load()?.unwrap_or_default())
    }

    /// Replace the stored snapshot with `dataset`.
    pub fn save(&self, dataset: &Dataset) -> Result<(), SnapshotError> {
        let blob = serde_json::to_vec(dataset)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT OR REPLACE INTO dataset_snapshot
                (id, saved_at, entity_count, record_count, dataset_blob)
               VALUES (1, ?, ?, ?, ?)"#,
            params![
                Utc::now().timestamp(),
                dataset.entities.len() as i64,
                dataset.records.len() as i64,
                &blob,
            ],
        )?;
        tx.commit()?;

        debug!(
            records = dataset.records.len(),
            bytes = blob.len(),
            "Persisted snapshot"
        );
        Ok(())
    }

    /// Get snapshot metadata without deserializing the blob.
    pub fn stats(&self) -> Result<Option<SnapshotStats>, SnapshotError> {
        let conn = self.conn.lock();
        let stats = conn
            .query_row(
                "SELECT saved_at, entity_count, record_count, LENGTH(dataset_blob)
                 FROM dataset_snapshot WHERE id = 1",
                [],
                |row| {
                    Ok(SnapshotStats {
                        saved_at: row.get(0)?,
                        entity_count: row.get::<_, i64>(1)? as u64,
                        record_count: row.get::<_, i64>(2)? as u64,
                        size_bytes: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }
}

/// Statistics about the stored snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStats {
    pub saved_at: i64,
    pub entity_count: u64,
    pub record_count: u64,
    pub size_bytes: u64,
}

/// Errors from the snapshot store.
#[derive(Debug)]
pub enum SnapshotError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    SchemaVersion(u32),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::SchemaVersion(v) => write!(
                f,
                "Unsupported snapshot schema version {} (expected {})",
                v, SCHEMA_VERSION
            ),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<rusqlite::Error> for SnapshotError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Detail, Entity, EntityRecord, NextEvent, PriceBar, PriceReactionRow, PriceReactionTable,
        Symbol,
    };
    use chrono::{TimeZone, Utc};

    fn make_test_dataset() -> Dataset {
        let event = Utc.with_ymd_and_hms(2024, 2, 2, 5, 0, 0).unwrap();
        let bar = |day: u32, close: f64| PriceBar {
            date: Utc.with_ymd_and_hms(2024, 2, day, 5, 0, 0).unwrap(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 52_000_000,
            dividends: 0.0,
            splits: 0.0,
        };

        let mut record = EntityRecord {
            historical_events: Some(vec![event]),
            next_event: NextEvent::Scheduled(Utc.with_ymd_and_hms(2024, 5, 2, 4, 0, 0).unwrap()),
            price_reaction_table: None,
            aggregate: None,
            detail: Detail::Fetched("Apple Inc. designs phones.".to_string()),
        };
        record.set_price_table(
            PriceReactionTable {
                rows: vec![PriceReactionRow {
                    event,
                    pre: bar(1, 186.86),
                    post: bar(2, 185.85),
                    point_change: 185.85 - 186.86,
                    percent_change: Some((185.85 - 186.86) * 100.0 / 186.86),
                }],
            },
            10,
        );

        let mut dataset = Dataset {
            entities: vec![Entity::new("AAPL", "Apple Inc."), Entity::new("MMM", "3M")],
            ..Default::default()
        };
        dataset.records.insert(Symbol::new("AAPL"), record);
        dataset.records.insert(
            Symbol::new("MMM"),
            EntityRecord {
                historical_events: Some(vec![]),
                price_reaction_table: Some(PriceReactionTable::empty()),
                next_event: NextEvent::NoneScheduled,
                detail: Detail::Attempted,
                aggregate: None,
            },
        );
        dataset
    }

    #[test]
    fn test_empty_store_loads_none() {
        let store = SnapshotStore::in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.load_or_default().unwrap(), Dataset::default());
        assert!(store.stats().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let store = SnapshotStore::in_memory().unwrap();
        let mut dataset = make_test_dataset();
        store.save(&dataset).unwrap();

        let mut loaded = store.load().unwrap().unwrap();
        loaded.recompute_aggregates(10);
        dataset.recompute_aggregates(10);
        assert_eq!(loaded, dataset);

        let aapl = loaded.record(&Symbol::new("AAPL")).unwrap();
        assert!(aapl.aggregate.is_some());
        assert_eq!(aapl.price_reaction_table.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let store = SnapshotStore::in_memory().unwrap();
        let mut dataset = make_test_dataset();
        store.save(&dataset).unwrap();

        dataset.records.remove(&Symbol::new("MMM"));
        dataset.entities.retain(|e| e.symbol.as_str() != "MMM");
        store.save(&dataset).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.records.len(), 1);
        let stats = store.stats().unwrap().unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.entity_count, 1);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn test_reopen_file_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.db");
        let dataset = make_test_dataset();

        SnapshotStore::open(&path).unwrap().save(&dataset).unwrap();
        let reopened = SnapshotStore::open(&path).unwrap();
        let loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded.records.keys().count(), 2);
        assert_eq!(
            loaded.record(&Symbol::new("MMM")).unwrap().detail,
            Detail::Attempted
        );
    }
}
