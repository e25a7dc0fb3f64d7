//! Event table setup and teardown
//!
//! The upsert core assumes this table exists; these helpers exist so the
//! binary and the tests can provision and drop it around a race.

use rusqlite::Connection;
use tracing::info;

use super::StoreResult;

/// Create the `event` table if it does not exist
pub fn create_event_table(conn: &Connection) -> StoreResult<()> {
    // SQLite has no native UUID type, so the id is stored as a 16 byte blob
    conn.execute(
        "CREATE TABLE IF NOT EXISTS event (
            id BLOB PRIMARY KEY CHECK (length(id) = 16),
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    info!("event table ready");
    Ok(())
}

/// Drop the `event` table if it exists
pub fn drop_event_table(conn: &Connection) -> StoreResult<()> {
    conn.execute("DROP TABLE IF EXISTS event", [])?;

    info!("event table dropped");
    Ok(())
}
