//! Concurrent writer harness
//!
//! Races N upserts of the same event against one store:
//! 1. One handle and one `Upserter` per candidate, nothing shared
//! 2. Submission order shuffled independently of version order
//! 3. A worker pool sized to the candidates, each worker pausing before it
//!    executes so every attempt is queued before the race starts
//! 4. A completion barrier: `run` returns only after every worker finished

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config_loader::RaceConfig;
use crate::database::{Fault, FaultyHandle, HandleOpener, IsolationLevel, SqliteStore, StoreHandle};
use crate::upsert::{UpsertReport, Upserter};

/// Harness errors. Store failures never show up here; they live in reports.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Invalid race plan: {0}")]
    InvalidPlan(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    /// Some workers died; the summary holds every report that did come back
    #[error("{} race worker(s) failed: {}", .failures.len(), .failures.join("; "))]
    Incomplete {
        failures: Vec<String>,
        summary: Box<RaceSummary>,
    },
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// One writer's candidate row
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub version: i64,
    pub fault: Option<Fault>,
}

impl Candidate {
    pub fn new(name: impl Into<String>, version: i64) -> Self {
        Self {
            name: name.into(),
            version,
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }
}

/// Everything needed to run one race against one event id
#[derive(Debug, Clone)]
pub struct RacePlan {
    pub id: Uuid,
    pub candidates: Vec<Candidate>,
    pub isolation: IsolationLevel,
    pub pre_race_delay: Duration,
    /// Pool size; `None` means one worker per candidate
    pub workers: Option<usize>,
    /// Seed for the submission shuffle; `None` draws from the thread RNG
    pub seed: Option<u64>,
}

impl RacePlan {
    pub fn new(id: Uuid, candidates: Vec<Candidate>) -> Self {
        Self {
            id,
            candidates,
            isolation: IsolationLevel::ReadCommitted,
            pre_race_delay: Duration::from_millis(200),
            workers: None,
            seed: None,
        }
    }

    /// Same name for every version
    pub fn uniform(id: Uuid, name: &str, versions: impl IntoIterator<Item = i64>) -> Self {
        let candidates = versions.into_iter().map(|v| Candidate::new(name, v)).collect();
        Self::new(id, candidates)
    }

    /// Plan described by the `[race]` config section
    pub fn from_config(id: Uuid, config: &RaceConfig) -> Self {
        let mut plan = Self::uniform(id, &config.name, 1..=config.writers as i64);
        plan.isolation = config.isolation;
        plan.pre_race_delay = Duration::from_millis(config.pre_race_delay_ms);
        plan.workers = config.workers;
        plan.seed = config.seed;
        for version in &config.fail_commit_versions {
            plan = plan.with_fault(*version, Fault::FailCommit);
        }
        plan
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.pre_race_delay = delay;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Inject `fault` into every candidate carrying `version`
    pub fn with_fault(mut self, version: i64, fault: Fault) -> Self {
        for candidate in self.candidates.iter_mut().filter(|c| c.version == version) {
            candidate.fault = Some(fault);
        }
        self
    }

    pub fn max_version(&self) -> Option<i64> {
        self.candidates.iter().map(|c| c.version).max()
    }

    fn validate(&self) -> HarnessResult<usize> {
        if self.candidates.is_empty() {
            return Err(HarnessError::InvalidPlan("at least one candidate is required".to_string()));
        }
        match self.workers {
            Some(0) => Err(HarnessError::InvalidPlan("worker pool must not be empty".to_string())),
            Some(workers) => Ok(workers),
            None => Ok(self.candidates.len()),
        }
    }
}

/// Result of one race, reports in submission order after any attempts that
/// never started
#[derive(Debug, Clone)]
pub struct RaceSummary {
    pub id: Uuid,
    pub reports: Vec<UpsertReport>,
    pub submission_order: Vec<i64>,
    pub elapsed: Duration,
}

impl RaceSummary {
    pub fn confirmed(&self) -> impl Iterator<Item = &UpsertReport> {
        self.reports.iter().filter(|r| r.is_confirmed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &UpsertReport> {
        self.reports.iter().filter(|r| !r.success)
    }

    /// Total rows changed across confirmed attempts
    pub fn applied_count(&self) -> usize {
        self.confirmed().filter_map(|r| r.rows_changed).sum()
    }

    pub fn highest_confirmed(&self) -> Option<&UpsertReport> {
        self.confirmed().max_by_key(|r| r.version)
    }
}

/// Drives racing writers against a store passed in by reference
pub struct RaceHarness<'a> {
    store: &'a SqliteStore,
}

impl<'a> RaceHarness<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self { store }
    }

    /// Run every candidate concurrently and wait for all of them
    pub async fn run(&self, plan: &RacePlan) -> HarnessResult<RaceSummary> {
        let workers = plan.validate()?;
        let start_time = Instant::now();

        info!(
            id = %plan.id,
            writers = plan.candidates.len(),
            workers,
            isolation = %plan.isolation,
            delay_ms = plan.pre_race_delay.as_millis() as u64,
            "starting upsert race"
        );

        // Opening and preparing N connections is blocking work
        let opener = self.store.opener();
        let setup_plan = plan.clone();
        let (mut upserters, mut reports) =
            tokio::task::spawn_blocking(move || prepare_attempts(&opener, &setup_plan))
                .await
                .map_err(|e| HarnessError::Worker(e.to_string()))?;

        match plan.seed {
            Some(seed) => upserters.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => upserters.shuffle(&mut rand::thread_rng()),
        }
        let submission_order: Vec<i64> = upserters.iter().map(|u| u.version()).collect();
        debug!(?submission_order, "submission order shuffled");

        let pool = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for (position, upserter) in upserters.into_iter().enumerate() {
            let pool = pool.clone();
            let delay = plan.pre_race_delay;

            tasks.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|e| HarnessError::Worker(e.to_string()))?;

                // Let every attempt get queued before any of them starts racing
                sleep(delay).await;

                let report = tokio::task::spawn_blocking(move || run_attempt(upserter))
                    .await
                    .map_err(|e| HarnessError::Worker(e.to_string()))?;

                Ok::<_, HarnessError>((position, report))
            });
        }

        // Barrier: drain every worker before looking at the results
        let (mut raced, failures) = drain(&mut tasks).await;

        raced.sort_by_key(|(position, _)| *position);
        reports.extend(raced.into_iter().map(|(_, report)| report));

        let summary = RaceSummary {
            id: plan.id,
            reports,
            submission_order,
            elapsed: start_time.elapsed(),
        };

        if !failures.is_empty() {
            error!(
                id = %plan.id,
                failed_workers = failures.len(),
                reports = summary.reports.len(),
                "upsert race incomplete"
            );
            return Err(HarnessError::Incomplete {
                failures,
                summary: Box::new(summary),
            });
        }

        info!(
            id = %plan.id,
            confirmed = summary.confirmed().count(),
            failed = summary.failed().count(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "upsert race finished"
        );

        Ok(summary)
    }
}

type AttemptResult = HarnessResult<(usize, UpsertReport)>;

/// Wait for every worker. Reports from healthy workers survive a failed one.
async fn drain(tasks: &mut JoinSet<AttemptResult>) -> (Vec<(usize, UpsertReport)>, Vec<String>) {
    let mut raced = Vec::with_capacity(tasks.len());
    let mut failures = Vec::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(result)) => raced.push(result),
            Ok(Err(e)) => {
                error!(error = %e, "race worker failed");
                failures.push(e.to_string());
            }
            Err(e) => {
                error!(error = %e, "race worker panicked");
                failures.push(e.to_string());
            }
        }
    }

    (raced, failures)
}

/// Open, wrap and prepare one attempt per candidate. Attempts that cannot
/// be set up are reported as failed and never race.
fn prepare_attempts(opener: &HandleOpener, plan: &RacePlan) -> (Vec<Upserter>, Vec<UpsertReport>) {
    let mut upserters = Vec::with_capacity(plan.candidates.len());
    let mut not_started = Vec::new();

    for candidate in &plan.candidates {
        let handle: Box<dyn StoreHandle> = match opener.open(plan.isolation) {
            Ok(handle) => match candidate.fault {
                Some(fault) => Box::new(FaultyHandle::new(Box::new(handle), fault)),
                None => Box::new(handle),
            },
            Err(e) => {
                warn!(version = candidate.version, error = %e, "Failed to open handle");
                not_started.push(UpsertReport::not_started(plan.id, &candidate.name, candidate.version, e));
                continue;
            }
        };

        match Upserter::prepare(handle, plan.id, &candidate.name, candidate.version) {
            Ok(upserter) => upserters.push(upserter),
            Err(e) => {
                not_started.push(UpsertReport::not_started(plan.id, &candidate.name, candidate.version, e));
            }
        }
    }

    (upserters, not_started)
}

fn run_attempt(mut upserter: Upserter) -> UpsertReport {
    let report = upserter.perform();
    if !report.success {
        warn!(version = report.version, "Upsert failed");
    }
    upserter.close();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestStore;
    use crate::upsert::UpsertOutcome;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_plan_is_rejected() {
        let fixture = TestStore::new();
        let plan = RacePlan::new(Uuid::new_v4(), Vec::new());

        let result = RaceHarness::new(&fixture.store).run(&plan).await;
        assert!(matches!(result, Err(HarnessError::InvalidPlan(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn zero_workers_is_rejected() {
        let fixture = TestStore::new();
        let plan = RacePlan::uniform(Uuid::new_v4(), "e", 1..=2).with_workers(0);

        let result = RaceHarness::new(&fixture.store).run(&plan).await;
        assert!(matches!(result, Err(HarnessError::InvalidPlan(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_handle_per_candidate() {
        let fixture = TestStore::new();
        let plan = RacePlan::uniform(Uuid::new_v4(), "e", 1..=6).with_delay(Duration::from_millis(20));

        let summary = RaceHarness::new(&fixture.store).run(&plan).await.unwrap();

        assert_eq!(fixture.store.stats().handles_opened, 6);
        assert_eq!(summary.reports.len(), 6);
        assert!(summary.reports.iter().all(|r| r.state.is_terminal()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn seeded_shuffle_is_a_permutation_and_repeatable() {
        let fixture = TestStore::new();
        let plan = RacePlan::uniform(Uuid::new_v4(), "e", 1..=8)
            .with_delay(Duration::ZERO)
            .with_seed(42);

        let first = RaceHarness::new(&fixture.store).run(&plan).await.unwrap();
        let second = RaceHarness::new(&fixture.store).run(&plan).await.unwrap();

        let mut sorted = first.submission_order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=8).collect::<Vec<_>>());
        assert_eq!(first.submission_order, second.submission_order);

        // The reports follow the submission order
        let reported: Vec<i64> = first.reports.iter().map(|r| r.version).collect();
        assert_eq!(reported, first.submission_order);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unsupported_isolation_fails_every_attempt_without_racing() {
        let fixture = TestStore::new();
        let id = Uuid::new_v4();
        let plan = RacePlan::uniform(id, "e", 1..=3).with_isolation(IsolationLevel::ReadUncommitted);

        let summary = RaceHarness::new(&fixture.store).run(&plan).await.unwrap();

        assert_eq!(summary.reports.len(), 3);
        assert!(summary.submission_order.is_empty());
        assert!(summary
            .reports
            .iter()
            .all(|r| r.outcome == UpsertOutcome::Failed && !r.state.is_terminal()));
        assert!(fixture.read(id).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_worker_serialises_the_race() {
        let fixture = TestStore::new();
        let id = Uuid::new_v4();
        let plan = RacePlan::uniform(id, "serial", 1..=4)
            .with_workers(1)
            .with_delay(Duration::from_millis(5))
            .with_seed(7);

        let summary = RaceHarness::new(&fixture.store).run(&plan).await.unwrap();

        assert_eq!(summary.confirmed().count(), 4);
        assert_eq!(fixture.read(id).unwrap().version, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pre_race_delay_is_waited_out() {
        let fixture = TestStore::new();
        let plan = RacePlan::uniform(Uuid::new_v4(), "slow", 1..=3).with_delay(Duration::from_millis(150));

        let summary = RaceHarness::new(&fixture.store).run(&plan).await.unwrap();
        assert!(summary.elapsed >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn setup_runs_off_a_single_threaded_runtime() {
        let fixture = TestStore::new();
        let id = Uuid::new_v4();
        let plan = RacePlan::uniform(id, "current thread", 1..=4).with_delay(Duration::from_millis(10));

        let summary = RaceHarness::new(&fixture.store).run(&plan).await.unwrap();

        // Handles opened on the blocking pool still count against the store
        assert_eq!(fixture.store.stats().handles_opened, 4);
        assert_eq!(summary.confirmed().count(), 4);
        assert_eq!(fixture.read(id).unwrap().version, 4);
    }

    fn finished_attempt(position: usize, version: i64) -> AttemptResult {
        Ok((position, UpsertReport::not_started(Uuid::nil(), "kept", version, "not raced")))
    }

    fn crashed_attempt() -> AttemptResult {
        panic!("worker crashed mid-attempt")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drain_keeps_reports_from_healthy_workers() {
        let mut tasks: JoinSet<AttemptResult> = JoinSet::new();
        tasks.spawn(async { finished_attempt(0, 1) });
        tasks.spawn(async { crashed_attempt() });
        tasks.spawn(async { AttemptResult::Err(HarnessError::Worker("pool closed".to_string())) });
        tasks.spawn(async { finished_attempt(3, 2) });

        let (mut raced, failures) = drain(&mut tasks).await;
        raced.sort_by_key(|(position, _)| *position);

        let versions: Vec<i64> = raced.iter().map(|(_, report)| report.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().any(|f| f.contains("pool closed")));
    }

    #[test]
    fn incomplete_race_keeps_its_summary() {
        let summary = RaceSummary {
            id: Uuid::nil(),
            reports: vec![UpsertReport::not_started(Uuid::nil(), "kept", 1, "not raced")],
            submission_order: vec![1],
            elapsed: Duration::ZERO,
        };
        let error = HarnessError::Incomplete {
            failures: vec!["task panicked".to_string()],
            summary: Box::new(summary),
        };

        assert_eq!(error.to_string(), "1 race worker(s) failed: task panicked");
        match error {
            HarnessError::Incomplete { summary, .. } => assert_eq!(summary.reports.len(), 1),
            _ => unreachable!(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn plan_from_config_marks_failing_commits() {
        let mut config = RaceConfig::default();
        config.writers = 4;
        config.fail_commit_versions = vec![4];
        config.seed = Some(1);

        let plan = RacePlan::from_config(Uuid::new_v4(), &config);

        assert_eq!(plan.candidates.len(), 4);
        assert_eq!(plan.max_version(), Some(4));
        assert_eq!(plan.seed, Some(1));
        let faulty: Vec<i64> = plan.candidates.iter().filter(|c| c.fault.is_some()).map(|c| c.version).collect();
        assert_eq!(faulty, vec![4]);
    }
}
