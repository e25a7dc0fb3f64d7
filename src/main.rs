use std::env::consts::{ARCH, FAMILY, OS};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Error;
use clap::{Args, Parser, Subcommand};
use tracing::trace;

use upsert_race::config_loader::AppConfig;
use upsert_race::database::IsolationLevel;
use upsert_race::logger::init_logging;
use upsert_race::program::Program;

/// Race writers with different versions of one event and check the store
/// keeps the highest.
#[derive(Parser)]
#[command(name = "upsert-race", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one race and verify the converged row
    Run(RunArgs),
    /// Write a default config file
    InitConfig {
        #[arg(default_value = "config.toml")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    /// SQLite database file
    #[arg(long)]
    database: Option<PathBuf>,
    #[arg(long)]
    writers: Option<usize>,
    /// read_committed, repeatable_read or serializable
    #[arg(long)]
    isolation: Option<IsolationLevel>,
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Seed for the submission shuffle
    #[arg(long)]
    seed: Option<u64>,
    /// Force the commit of this version to fail (repeatable)
    #[arg(long = "fail-commit-version")]
    fail_commit_versions: Vec<i64>,
    /// Leave the event table in place afterwards
    #[arg(long)]
    keep_table: bool,
}

impl RunArgs {
    fn apply(self, config: &mut AppConfig) {
        if let Some(database) = self.database {
            config.paths.database_file = database.display().to_string();
        }
        if let Some(writers) = self.writers {
            config.race.writers = writers;
        }
        if let Some(isolation) = self.isolation {
            config.race.isolation = isolation;
        }
        if let Some(delay_ms) = self.delay_ms {
            config.race.pre_race_delay_ms = delay_ms;
        }
        if self.seed.is_some() {
            config.race.seed = self.seed;
        }
        if !self.fail_commit_versions.is_empty() {
            config.race.fail_commit_versions = self.fail_commit_versions;
        }
        config.race.keep_table |= self.keep_table;
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Error> {
    let cli = Cli::parse();

    match cli.command {
        Command::InitConfig { path } => {
            AppConfig::write_default(&path)?;
            println!("Wrote default config to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            let mut config = AppConfig::load(&args.config)?;
            args.apply(&mut config);
            config.validate()?;

            let _guard = init_logging(&config.logging, &config.log_directory())?;
            log_system_information();

            let outcome = Program::new(config).run().await?;
            Ok(if outcome.is_verified() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// Logs information about the system being used.
fn log_system_information() {
    trace!("ARCH:   \"{}\"", ARCH);
    trace!("FAMILY: \"{}\"", FAMILY);
    trace!("OS:     \"{}\"", OS);
}
