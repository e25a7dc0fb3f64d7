//! Fault injection for store handles
//!
//! Wraps a real handle and fails exactly one kind of call, so partial
//! failures (lost commits, failed rollbacks, failed closes) can be raced
//! against healthy writers.

use std::fmt;

use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{IsolationLevel, StoreError, StoreHandle, StoreResult};

/// The call a `FaultyHandle` refuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    FailExecute,
    FailCommit,
    FailRollback,
    FailClose,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::FailExecute => write!(f, "fail_execute"),
            Fault::FailCommit => write!(f, "fail_commit"),
            Fault::FailRollback => write!(f, "fail_rollback"),
            Fault::FailClose => write!(f, "fail_close"),
        }
    }
}

/// Handle wrapper that injects one `Fault` and forwards everything else
pub struct FaultyHandle {
    inner: Box<dyn StoreHandle>,
    fault: Fault,
}

impl FaultyHandle {
    pub fn new(inner: Box<dyn StoreHandle>, fault: Fault) -> Self {
        Self { inner, fault }
    }

    fn injected(&self, call: &str) -> StoreError {
        debug!(fault = %self.fault, call, "injecting store failure");
        StoreError::Injected(format!("{} refused by {}", call, self.fault))
    }
}

impl StoreHandle for FaultyHandle {
    fn prepare(&mut self, sql: &str) -> StoreResult<()> {
        self.inner.prepare(sql)
    }

    fn execute(&mut self, sql: &str, params: &[&dyn ToSql]) -> StoreResult<usize> {
        if self.fault == Fault::FailExecute {
            return Err(self.injected("execute"));
        }
        self.inner.execute(sql, params)
    }

    fn commit(&mut self) -> StoreResult<()> {
        // The transaction stays open, so a following rollback really discards it
        if self.fault == Fault::FailCommit {
            return Err(self.injected("commit"));
        }
        self.inner.commit()
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if self.fault == Fault::FailRollback {
            return Err(self.injected("rollback"));
        }
        self.inner.rollback()
    }

    fn close(self: Box<Self>) -> StoreResult<()> {
        let fault = self.fault;
        let error = (fault == Fault::FailClose).then(|| self.injected("close"));
        // The real connection is released even when the close is reported as failed
        self.inner.close()?;
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn isolation(&self) -> IsolationLevel {
        self.inner.isolation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestStore;

    const INSERT: &str = "INSERT INTO event (id, name, version) VALUES (?1, ?2, ?3)";

    fn faulty(fixture: &TestStore, fault: Fault) -> FaultyHandle {
        let inner = fixture.store.open_handle(IsolationLevel::ReadCommitted).unwrap();
        FaultyHandle::new(Box::new(inner), fault)
    }

    #[test]
    fn failed_commit_leaves_transaction_for_rollback() {
        let fixture = TestStore::new();
        let mut handle = faulty(&fixture, Fault::FailCommit);

        let id = uuid::Uuid::new_v4();
        assert_eq!(handle.execute(INSERT, rusqlite::params![id, "lost", 1_i64]).unwrap(), 1);
        assert!(matches!(handle.commit(), Err(StoreError::Injected(_))));
        handle.rollback().unwrap();

        assert_eq!(fixture.count_rows(), 0);
        Box::new(handle).close().unwrap();
    }

    #[test]
    fn failed_execute_touches_nothing() {
        let fixture = TestStore::new();
        let mut handle = faulty(&fixture, Fault::FailExecute);

        let id = uuid::Uuid::new_v4();
        assert!(handle.execute(INSERT, rusqlite::params![id, "never", 1_i64]).is_err());
        handle.commit().unwrap();
        assert_eq!(fixture.count_rows(), 0);
    }

    #[test]
    fn failed_close_still_releases_connection() {
        let fixture = TestStore::new();
        let handle = faulty(&fixture, Fault::FailClose);

        assert!(matches!(Box::new(handle).close(), Err(StoreError::Injected(_))));
        assert_eq!(fixture.store.stats().handles_opened, 1);
    }

    #[test]
    fn isolation_is_forwarded() {
        let fixture = TestStore::new();
        let handle = faulty(&fixture, Fault::FailRollback);
        assert_eq!(handle.isolation(), IsolationLevel::ReadCommitted);
    }
}
