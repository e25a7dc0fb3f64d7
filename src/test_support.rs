//! Per-test database fixture
//!
//! Each test builds its own `TestStore`: a fresh SQLite file in a temporary
//! directory with the event table created. Nothing is shared between tests.

use rusqlite::OptionalExtension;
use tempfile::TempDir;
use uuid::Uuid;

use crate::database::{create_event_table, drop_event_table, SqliteStore, StoreConfig};
use crate::upsert::Event;

pub struct TestStore {
    pub store: SqliteStore,
    _dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("events.sqlite"), config).unwrap();
        store.with_setup_connection(create_event_table).unwrap();
        Self { store, _dir: dir }
    }

    pub fn read(&self, id: Uuid) -> Option<Event> {
        self.store
            .with_setup_connection(|conn| {
                Ok(conn
                    .query_row("SELECT id, name, version FROM event WHERE id = ?1", [id], Event::from_row)
                    .optional()?)
            })
            .unwrap()
    }

    pub fn count_rows(&self) -> i64 {
        self.store
            .with_setup_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM event", [], |row| row.get(0))?))
            .unwrap()
    }

    pub fn drop_table(&self) {
        self.store.with_setup_connection(drop_event_table).unwrap();
    }
}
