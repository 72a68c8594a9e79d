mod cli;

use anyhow::Result;
use ans_expenses::{run_consolidation, write_result, PipelineConfig, RunStatus, Store, VERSION};
use clap::Parser;
use cli::{Cli, Commands, PathArgs};
use tracing::{info, subscriber, warn};
use tracing_subscriber::FmtSubscriber;

fn init_tracing(cli: &Cli) -> Result<()> {
    let level: tracing::Level = cli.trace.unwrap_or_default().into();
    let my_subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    subscriber::set_global_default(my_subscriber)?;
    Ok(())
}

fn load_config(cli: &Cli, paths: &PathArgs) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::from_env()?,
    };
    paths.apply(&mut config);
    Ok(config)
}

fn consolidate(config: &PipelineConfig) -> Result<()> {
    let result = run_consolidation(config)?;

    match result.status {
        RunStatus::Consolidated => info!(
            summary = %result.summary.summary(),
            fingerprint = %result.fingerprint(),
            "period consolidated"
        ),
        RunStatus::Empty(reason) => warn!(
            ?reason,
            summary = %result.summary.summary(),
            "no data for period, writing empty outputs"
        ),
    }

    let paths = write_result(&result, config)?;
    info!(consolidated = %paths.consolidated.display(), metrics = %paths.metrics.display(), "done");
    Ok(())
}

fn load(config: &PipelineConfig) -> Result<()> {
    let mut store = Store::open(&config.database_path)?;
    let report = store.load_outputs(config)?;

    if report.skipped {
        info!(database = %config.database_path.display(), "store already up to date");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    info!(version = VERSION, "ans-expenses");

    match &cli.command {
        Commands::Consolidate(paths) => consolidate(&load_config(&cli, paths)?)?,
        Commands::Load(paths) => load(&load_config(&cli, paths)?)?,
        Commands::Run(paths) => {
            let config = load_config(&cli, paths)?;
            consolidate(&config)?;
            load(&config)?;
        }
    }

    Ok(())
}
