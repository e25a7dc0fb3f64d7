//! Version-guarded upsert and the harness that races it
//!
//! Many writers persist different versions of one event at once; the store
//! must end up holding the highest version no matter who commits first.

pub mod config_loader;
pub mod database;
pub mod harness;
pub mod logger;
pub mod program;
pub mod upsert;
pub mod verifier;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod tests;

pub use config_loader::{AppConfig, ConfigError, ConfigResult};
pub use database::{
    IsolationLevel, SqliteHandle, SqliteStore, StoreConfig, StoreError, StoreHandle, StoreResult,
};
pub use harness::{Candidate, HarnessError, HarnessResult, RaceHarness, RacePlan, RaceSummary};
pub use upsert::{
    AttemptState, CommitConfirmation, Event, UpsertError, UpsertOutcome, UpsertReport, Upserter,
    UPSERT_SQL,
};
pub use verifier::{Expectation, Verifier, VerifyError, VerifyResult};
