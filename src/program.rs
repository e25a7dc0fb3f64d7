use anyhow::{Context, Error};
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::config_loader::AppConfig;
use crate::database::{create_event_table, drop_event_table, SqliteStore};
use crate::harness::{RaceHarness, RacePlan, RaceSummary};
use crate::upsert::Event;
use crate::verifier::{Expectation, Verifier, VerifyError};

/// Result of one full run: the race and its verification
pub struct RunOutcome {
    pub summary: RaceSummary,
    pub verification: Result<Event, VerifyError>,
}

impl RunOutcome {
    pub fn is_verified(&self) -> bool {
        self.verification.is_ok()
    }
}

/// Sets up the table, races the writers, verifies, tears down.
pub struct Program {
    config: AppConfig,
}

impl Program {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<RunOutcome, Error> {
        let store = SqliteStore::open(self.config.database_path(), self.config.store.clone())
            .with_context(|| format!("opening {}", self.config.paths.database_file))?;
        // Verification expects the table to hold only this run's row
        store
            .with_setup_connection(|conn| {
                drop_event_table(conn)?;
                create_event_table(conn)
            })
            .context("resetting event table")?;

        let result = self.race_and_verify(&store).await;

        if self.config.race.keep_table {
            trace!("Keeping event table at {}", store.path().display());
        } else if let Err(e) = store.with_setup_connection(drop_event_table) {
            warn!("Failed to drop event table: {}", e);
        }

        result
    }

    async fn race_and_verify(&self, store: &SqliteStore) -> Result<RunOutcome, Error> {
        let id = Uuid::new_v4();
        let plan = RacePlan::from_config(id, &self.config.race);

        let summary = RaceHarness::new(store).run(&plan).await.context("running upsert race")?;

        for report in &summary.reports {
            println!("{}", report);
        }

        let verification =
            Expectation::from_reports(&summary.reports).and_then(|expected| Verifier::new(store).verify(id, &expected));

        match &verification {
            Ok(event) => {
                info!(version = event.version, name = %event.name, "race converged");
                println!("Converged: id={} name={:?} version={}", event.id, event.name, event.version);
            }
            Err(e) => {
                error!("Verification failed: {}", e);
                println!("Verification failed: {}", e);
            }
        }

        Ok(RunOutcome {
            summary,
            verification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.database_file = dir.join("run.sqlite").display().to_string();
        config.race.pre_race_delay_ms = 50;
        config.race.seed = Some(11);
        config
    }

    fn table_count(path: &std::path::Path) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'event'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn default_run_converges_and_drops_table() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let db_path = config.database_path();

        let outcome = Program::new(config).run().await.unwrap();

        assert!(outcome.is_verified());
        let event = outcome.verification.as_ref().unwrap();
        assert_eq!((event.name.as_str(), event.version), ("First event", 5));
        assert_eq!(outcome.summary.reports.len(), 5);
        assert_eq!(table_count(&db_path), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failing_top_commit_still_verifies_against_confirmed_writers() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.race.fail_commit_versions = vec![5];
        config.race.keep_table = true;
        let db_path = config.database_path();

        let outcome = Program::new(config).run().await.unwrap();

        let event = outcome.verification.as_ref().unwrap();
        assert_eq!(event.version, 4);
        assert_eq!(table_count(&db_path), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn kept_table_from_an_earlier_run_does_not_fail_the_next() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.race.keep_table = true;

        for _ in 0..2 {
            let outcome = Program::new(config.clone()).run().await.unwrap();
            assert!(outcome.is_verified());
        }
    }
}
