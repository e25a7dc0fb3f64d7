//! Verification of the converged event row
//!
//! After every writer has finished, reads the row back through a fresh
//! read-only transaction and checks it against what the confirmed attempts
//! imply. Individual attempts are allowed to lose; only the final state is
//! judged.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::{SqliteStore, StoreError, StoreResult};
use crate::upsert::{AttemptState, CommitConfirmation, Event, UpsertOutcome, UpsertReport};

/// Verification failures
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("No row stored for event {0}")]
    MissingRow(Uuid),

    #[error("Expected the event table to hold only the row for {id}, found {count} rows")]
    UnexpectedRows { id: Uuid, count: i64 },

    #[error("Stored version {actual} does not match expected {expected:?}")]
    VersionMismatch { expected: Vec<i64>, actual: i64 },

    #[error("Stored name {actual:?} is not one of {expected:?}")]
    NameMismatch { expected: Vec<String>, actual: String },

    #[error("No attempt was confirmed, nothing to verify against")]
    NoConfirmedAttempts,
}

impl From<rusqlite::Error> for VerifyError {
    fn from(error: rusqlite::Error) -> Self {
        VerifyError::Store(StoreError::from(error))
    }
}

pub type VerifyResult<T> = Result<T, VerifyError>;

/// Acceptable final states of the row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub version: i64,
    pub names: BTreeSet<String>,
    /// Versions from attempts whose commit may or may not have landed
    pub in_doubt: BTreeSet<i64>,
    /// Only a lower bound is known: every top attempt was a no-op against a
    /// row some other writer stored, so any version at or above `version`
    /// is accepted and the name is not checked
    pub floor_only: bool,
}

impl Expectation {
    pub fn exact(version: i64, name: impl Into<String>) -> Self {
        Self {
            version,
            names: BTreeSet::from([name.into()]),
            in_doubt: BTreeSet::new(),
            floor_only: false,
        }
    }

    /// Derive the expected row from confirmed attempts only.
    ///
    /// The version is the highest one any successful attempt carried. The
    /// accepted names come only from attempts at that version which actually
    /// applied; equal versions never overwrite each other. When all of them
    /// were no-ops the stored row belongs to someone else, so the expectation
    /// becomes a floor and the name is left unchecked.
    pub fn from_reports<'r>(reports: impl IntoIterator<Item = &'r UpsertReport>) -> VerifyResult<Self> {
        let reports: Vec<&UpsertReport> = reports.into_iter().collect();

        let version = reports
            .iter()
            .filter(|r| r.success)
            .map(|r| r.version)
            .max()
            .ok_or(VerifyError::NoConfirmedAttempts)?;

        let names: BTreeSet<String> = reports
            .iter()
            .filter(|r| r.success && r.version == version && r.outcome == UpsertOutcome::Applied)
            .map(|r| r.name.clone())
            .collect();
        let floor_only = names.is_empty();

        let in_doubt = reports
            .iter()
            .filter(|r| r.state == AttemptState::Committed(CommitConfirmation::Unconfirmed) && r.version > version)
            .map(|r| r.version)
            .collect();

        Ok(Self {
            version,
            names,
            in_doubt,
            floor_only,
        })
    }

    fn accepts_version(&self, version: i64) -> bool {
        version == self.version
            || self.in_doubt.contains(&version)
            || (self.floor_only && version > self.version)
    }
}

/// Reads and checks the final state of one event
pub struct Verifier<'a> {
    store: &'a SqliteStore,
}

impl<'a> Verifier<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self { store }
    }

    /// Read the row for `id` in its own read-only transaction
    pub fn read_event(&self, id: Uuid) -> VerifyResult<Option<Event>> {
        let (_, event) = self.read_snapshot(id)?;
        Ok(event)
    }

    /// Check that the table holds exactly one row, for `id`, and that it matches
    pub fn verify(&self, id: Uuid, expectation: &Expectation) -> VerifyResult<Event> {
        let (table_rows, event) = self.read_snapshot(id)?;
        let event = event.ok_or(VerifyError::MissingRow(id))?;
        if table_rows != 1 {
            return Err(VerifyError::UnexpectedRows { id, count: table_rows });
        }
        debug!(id = %id, version = event.version, name = %event.name, "read converged row");

        if !expectation.accepts_version(event.version) {
            let mut expected = vec![expectation.version];
            expected.extend(expectation.in_doubt.iter().copied());
            return Err(VerifyError::VersionMismatch {
                expected,
                actual: event.version,
            });
        }

        // An in-doubt winner carries a name we cannot predict from confirmed attempts
        if !expectation.floor_only
            && event.version == expectation.version
            && !expectation.names.contains(&event.name)
        {
            return Err(VerifyError::NameMismatch {
                expected: expectation.names.iter().cloned().collect(),
                actual: event.name,
            });
        }

        info!(id = %id, version = event.version, name = %event.name, "event row verified");
        Ok(event)
    }

    fn read_snapshot(&self, id: Uuid) -> VerifyResult<(i64, Option<Event>)> {
        let conn = self.store.open_read_only()?;
        let snapshot = read_in_transaction(&conn, id);
        close_quietly(conn);
        Ok(snapshot?)
    }
}

/// Row count of the whole table and the row for `id`, from one snapshot
fn read_in_transaction(conn: &Connection, id: Uuid) -> StoreResult<(i64, Option<Event>)> {
    conn.execute_batch("BEGIN DEFERRED")?;

    let read = (|| -> rusqlite::Result<(i64, Option<Event>)> {
        let table_rows: i64 = conn.query_row("SELECT COUNT(*) FROM event", [], |row| row.get(0))?;
        let event = conn
            .query_row("SELECT id, name, version FROM event WHERE id = ?1", [id], Event::from_row)
            .optional()?;
        Ok((table_rows, event))
    })();

    match read {
        Ok(result) => {
            conn.execute_batch("COMMIT")?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback_error) = conn.execute_batch("ROLLBACK") {
                warn!(error = %rollback_error, "Failure during verification rollback");
            }
            Err(e.into())
        }
    }
}

fn close_quietly(conn: Connection) {
    if let Err((_, e)) = conn.close() {
        debug!(error = %e, "failed to close verification connection");
    }
}
