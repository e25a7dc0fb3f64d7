//! Version-guarded upsert
//!
//! One `Upserter` is one writer: it owns a store handle, prepares the
//! conditional insert-or-update for a single `(id, name, version)`, runs it in
//! its own transaction and reports what happened. Store errors never escape
//! `perform`; they are resolved into the report.

use std::fmt;

use rusqlite::Row;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::{StoreError, StoreHandle};

/// Per-column guard: every mutable column keeps its stored value unless the
/// candidate version is strictly newer. Portable to stores that take no
/// predicate on the conflict path.
pub const PER_COLUMN_GUARD_SQL: &str = "INSERT INTO event (id, name, version) VALUES (?1, ?2, ?3)
ON CONFLICT(id) DO UPDATE SET
  name    = CASE WHEN event.version < excluded.version THEN excluded.name    ELSE event.name    END,
  version = CASE WHEN event.version < excluded.version THEN excluded.version ELSE event.version END";

/// The statement every writer runs.
///
/// SQLite counts a conflicting row as changed whenever the DO UPDATE branch
/// runs, even if every CASE keeps the stored value. The trailing filter skips
/// that branch for stale candidates so `rows_changed` only counts real writes.
pub const UPSERT_SQL: &str = "INSERT INTO event (id, name, version) VALUES (?1, ?2, ?3)
ON CONFLICT(id) DO UPDATE SET
  name    = CASE WHEN event.version < excluded.version THEN excluded.name    ELSE event.name    END,
  version = CASE WHEN event.version < excluded.version THEN excluded.version ELSE event.version END
WHERE event.version < excluded.version";

/// Upsert errors
#[derive(Error, Debug)]
pub enum UpsertError {
    #[error("Failed to prepare upsert for version {version}: {source}")]
    Prepare {
        version: i64,
        #[source]
        source: StoreError,
    },
}

pub type UpsertResult<T> = Result<T, UpsertError>;

/// A persisted event row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub version: i64,
}

impl Event {
    /// Read `(id, name, version)` from the first three columns of a row
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
        })
    }
}

/// Whether a commit was observed to succeed before the handle went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitConfirmation {
    Confirmed,
    Unconfirmed,
}

/// Lifecycle of one attempt.
///
/// `Created -> Executing -> Committed | RolledBack`. An attempt whose handle
/// could not be opened or prepared never leaves `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Created,
    Executing,
    Committed(CommitConfirmation),
    RolledBack,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Committed(_) | AttemptState::RolledBack)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::Created => write!(f, "created"),
            AttemptState::Executing => write!(f, "executing"),
            AttemptState::Committed(CommitConfirmation::Confirmed) => write!(f, "committed"),
            AttemptState::Committed(CommitConfirmation::Unconfirmed) => write!(f, "committed_unconfirmed"),
            AttemptState::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// What one attempt did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Executed, zero rows changed: the stored version was already at or past ours
    NoOp,
    /// Rows changed and the commit succeeded
    Applied,
    /// Rows changed but the commit failed or was never confirmed
    AppliedUnconfirmed,
    /// The statement itself failed, or the attempt never ran
    Failed,
}

impl fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertOutcome::NoOp => write!(f, "no_op"),
            UpsertOutcome::Applied => write!(f, "applied"),
            UpsertOutcome::AppliedUnconfirmed => write!(f, "applied_unconfirmed"),
            UpsertOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Final report of one attempt
#[derive(Debug, Clone)]
pub struct UpsertReport {
    pub id: Uuid,
    pub name: String,
    pub version: i64,
    pub rows_changed: Option<usize>,
    pub outcome: UpsertOutcome,
    pub state: AttemptState,
    /// True only when both the statement and the commit completed
    pub success: bool,
    pub error: Option<String>,
}

impl UpsertReport {
    /// Report for an attempt that could not be opened or prepared
    pub fn not_started(id: Uuid, name: impl Into<String>, version: i64, error: impl fmt::Display) -> Self {
        Self {
            id,
            name: name.into(),
            version,
            rows_changed: None,
            outcome: UpsertOutcome::Failed,
            state: AttemptState::Created,
            success: false,
            error: Some(error.to_string()),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.success && self.state == AttemptState::Committed(CommitConfirmation::Confirmed)
    }
}

impl fmt::Display for UpsertReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            UpsertOutcome::NoOp => {
                write!(
                    f,
                    "Version {}: no row changed, stored version already at or past it",
                    self.version
                )?;
                // Zero rows changed, so only the commit can have failed
                if let Some(error) = &self.error {
                    write!(f, ", but the commit failed: {}", error)?;
                }
                Ok(())
            }
            UpsertOutcome::Applied => write!(f, "Version {} inserted / updated", self.version),
            UpsertOutcome::AppliedUnconfirmed => write!(
                f,
                "Version {} inserted / updated, but the commit was not confirmed ({})",
                self.version, self.state
            ),
            UpsertOutcome::Failed => write!(
                f,
                "Version {} failed: {}",
                self.version,
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Self-contained writer for one candidate version of one event
pub struct Upserter {
    handle: Box<dyn StoreHandle>,
    id: Uuid,
    name: String,
    version: i64,
    state: AttemptState,
}

impl Upserter {
    /// Bind a candidate to its own handle and compile the statement on it.
    ///
    /// The handle must already carry its isolation level; nothing is
    /// committed until `perform`.
    pub fn prepare(
        mut handle: Box<dyn StoreHandle>,
        id: Uuid,
        name: impl Into<String>,
        version: i64,
    ) -> UpsertResult<Self> {
        if let Err(source) = handle.prepare(UPSERT_SQL) {
            error!(version, error = %source, "Failed to prepare upsert statement");
            if let Err(e) = handle.close() {
                warn!(version, error = %e, "Exception when closing connection after failed prepare");
            }
            return Err(UpsertError::Prepare { version, source });
        }

        Ok(Self {
            handle,
            id,
            name: name.into(),
            version,
            state: AttemptState::Created,
        })
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Execute the upsert, commit, roll back on any failure, and report.
    pub fn perform(&mut self) -> UpsertReport {
        self.state = AttemptState::Executing;
        debug!(id = %self.id, version = self.version, isolation = %self.handle.isolation(), "executing upsert");

        let mut rows_changed = None;
        let mut success = false;
        let mut failure: Option<StoreError> = None;

        let executed = self.handle.execute(
            UPSERT_SQL,
            rusqlite::params![self.id, self.name.as_str(), self.version],
        );

        match executed {
            Ok(rows) => {
                debug!(version = self.version, rows_changed = rows, "upsert statement executed");
                rows_changed = Some(rows);

                match self.handle.commit() {
                    Ok(()) => {
                        success = true;
                        self.state = AttemptState::Committed(CommitConfirmation::Confirmed);
                    }
                    Err(e) => {
                        warn!(version = self.version, error = %e, "Failed to commit upsert, rolling back");
                        self.state = self.roll_back(true);
                        failure = Some(e);
                    }
                }
            }
            Err(e) => {
                warn!(version = self.version, error = %e, "Failed to execute upsert, rolling back");
                self.state = self.roll_back(false);
                failure = Some(e);
            }
        }

        let outcome = match (failure.is_some(), rows_changed) {
            (_, None) => UpsertOutcome::Failed,
            (_, Some(0)) => UpsertOutcome::NoOp,
            (false, Some(_)) => UpsertOutcome::Applied,
            (true, Some(_)) => UpsertOutcome::AppliedUnconfirmed,
        };

        let report = UpsertReport {
            id: self.id,
            name: self.name.clone(),
            version: self.version,
            rows_changed,
            outcome,
            state: self.state,
            success,
            error: failure.map(|e| e.to_string()),
        };

        match report.outcome {
            UpsertOutcome::Applied | UpsertOutcome::NoOp => {
                info!(version = self.version, outcome = %report.outcome, state = %report.state, "{}", report)
            }
            _ => warn!(version = self.version, outcome = %report.outcome, state = %report.state, "{}", report),
        }

        report
    }

    /// Returns the state the attempt ends in. A failed rollback after a commit
    /// was issued leaves the commit's effect unknown.
    fn roll_back(&mut self, commit_issued: bool) -> AttemptState {
        match self.handle.rollback() {
            Ok(()) => AttemptState::RolledBack,
            Err(e) => {
                error!(version = self.version, error = %e, "Failure during rollback");
                if commit_issued {
                    AttemptState::Committed(CommitConfirmation::Unconfirmed)
                } else {
                    AttemptState::RolledBack
                }
            }
        }
    }

    /// Release the handle. Failures are logged and never change the report.
    pub fn close(self) {
        if let Err(e) = self.handle.close() {
            warn!(version = self.version, error = %e, "Exception when closing connection");
        }
    }
}
