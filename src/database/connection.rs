//! SQLite connections for the upsert race
//!
//! Every writer gets its own connection on the shared database file:
//! 1. WAL mode so the verifier can read while writers hold locks
//! 2. A busy timeout so racing writers queue instead of failing fast
//! 3. Lazy `BEGIN` with a lock mode chosen from the isolation level
//! 4. Read-only connections for verification

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OpenFlags, ToSql};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{IsolationLevel, StoreError, StoreHandle, StoreResult};

/// Connection configuration shared by every handle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a writer waits on a locked database before giving up
    pub busy_timeout_ms: u64,
    /// Enable WAL mode for concurrent readers
    pub enable_wal_mode: bool,
    /// Extra pragmas applied to every connection
    pub pragmas: BTreeMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let mut pragmas = BTreeMap::new();
        pragmas.insert("synchronous".to_string(), "NORMAL".to_string());
        pragmas.insert("temp_store".to_string(), "MEMORY".to_string());

        Self {
            busy_timeout_ms: 5000,
            enable_wal_mode: true,
            pragmas,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Counters for handles handed out by a store
#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub handles_opened: u64,
    pub handle_errors: u64,
    pub read_connections_opened: u64,
}

/// Source of independent connections on one SQLite database file.
///
/// Holds one setup connection for schema work for as long as the store lives,
/// which also keeps the WAL files in place for read-only connections.
pub struct SqliteStore {
    db_path: PathBuf,
    config: StoreConfig,
    setup: Mutex<Connection>,
    stats: Arc<RwLock<StoreStats>>,
}

impl SqliteStore {
    /// Open (or create) the database file and prepare it for concurrent writers
    pub fn open(db_path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if db_path.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig("database path must not be empty".to_string()));
        }

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::InvalidConfig(format!("Failed to create directory: {}", e)))?;
            }
        }

        let setup = Connection::open(&db_path)?;

        if config.enable_wal_mode {
            let mode: String = setup
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(|e| StoreError::Database(format!("Failed to set journal_mode=WAL: {}", e)))?;
            debug!("Journal mode set to: {}", mode);
        }
        configure_connection(&setup, &config)?;

        info!(path = %db_path.display(), wal = config.enable_wal_mode, "event store opened");

        Ok(Self {
            db_path,
            config,
            setup: Mutex::new(setup),
            stats: Arc::new(RwLock::new(StoreStats::default())),
        })
    }

    /// Open a new connection configured for one writer
    pub fn open_handle(&self, isolation: IsolationLevel) -> StoreResult<SqliteHandle> {
        self.opener().open(isolation)
    }

    /// Owned opener for write handles, for setup that runs on a blocking thread
    pub fn opener(&self) -> HandleOpener {
        HandleOpener {
            db_path: self.db_path.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Open a read-only connection, used for verification and sampling
    pub fn open_read_only(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(self.config.busy_timeout())?;
        self.stats.write().read_connections_opened += 1;
        Ok(conn)
    }

    /// Run `f` with the long-lived setup connection (schema work)
    pub fn with_setup_connection<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.setup.lock();
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }
}

/// Opens write handles on a store's file without borrowing the store.
/// Counters are shared with the store it came from.
#[derive(Debug, Clone)]
pub struct HandleOpener {
    db_path: PathBuf,
    config: StoreConfig,
    stats: Arc<RwLock<StoreStats>>,
}

impl HandleOpener {
    pub fn open(&self, isolation: IsolationLevel) -> StoreResult<SqliteHandle> {
        if isolation == IsolationLevel::ReadUncommitted {
            self.stats.write().handle_errors += 1;
            return Err(StoreError::UnsupportedIsolation(isolation));
        }

        let start_time = Instant::now();
        let connection = match Connection::open(&self.db_path)
            .map_err(StoreError::from)
            .and_then(|conn| configure_connection(&conn, &self.config).map(|_| conn))
        {
            Ok(conn) => conn,
            Err(e) => {
                self.stats.write().handle_errors += 1;
                return Err(e);
            }
        };

        self.stats.write().handles_opened += 1;
        debug!(
            isolation = %isolation,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "opened write handle"
        );

        Ok(SqliteHandle {
            connection,
            isolation,
        })
    }
}

/// Apply busy timeout and configured pragmas to a fresh connection
fn configure_connection(conn: &Connection, config: &StoreConfig) -> StoreResult<()> {
    conn.busy_timeout(config.busy_timeout())?;

    for (pragma, value) in &config.pragmas {
        let sql = format!("PRAGMA {} = {}", pragma, value);

        // Some PRAGMAs return results, others don't. Try execute first, fall back to query_row
        match conn.execute(&sql, []) {
            Ok(_) => {}
            Err(rusqlite::Error::ExecuteReturnedResults) => {
                if let Err(e) = conn.query_row(&sql, [], |_| Ok(())) {
                    warn!("Failed to set pragma {} with query_row: {}", pragma, e);
                }
            }
            Err(e) => warn!("Failed to set pragma {}: {}", pragma, e),
        }
    }

    Ok(())
}

/// One writer's connection. Owns its transaction; never shared.
#[derive(Debug)]
pub struct SqliteHandle {
    connection: Connection,
    isolation: IsolationLevel,
}

impl SqliteHandle {
    fn begin_sql(&self) -> &'static str {
        match self.isolation {
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        }
    }

    fn begin_if_needed(&mut self) -> StoreResult<()> {
        if self.connection.is_autocommit() {
            self.connection.execute_batch(self.begin_sql())?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.connection.is_autocommit()
    }
}

impl StoreHandle for SqliteHandle {
    fn prepare(&mut self, sql: &str) -> StoreResult<()> {
        // Compiled once and parked in the connection's statement cache
        self.connection.prepare_cached(sql)?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[&dyn ToSql]) -> StoreResult<usize> {
        self.begin_if_needed()?;
        let mut statement = self.connection.prepare_cached(sql)?;
        let rows_changed = statement.execute(params)?;
        Ok(rows_changed)
    }

    fn commit(&mut self) -> StoreResult<()> {
        if self.in_transaction() {
            self.connection.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if self.in_transaction() {
            self.connection.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> StoreResult<()> {
        self.connection.close().map_err(|(_, e)| {
            error!("Exception when closing connection: {}", e);
            StoreError::from(e)
        })
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}
