use ans_expenses::PipelineConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Sets the level of tracing.
    #[arg(short, long, global = true)]
    pub trace: Option<TraceLevel>,

    /// JSON config file. Without it, configuration comes from `.env` / ANS_* variables.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consolidate the quarterly expense files of one period into CSV outputs.
    Consolidate(PathArgs),

    /// Load previously written CSV outputs into the SQLite store.
    Load(PathArgs),

    /// Consolidate, then load.
    Run(PathArgs),
}

/// Overrides applied on top of the loaded configuration
#[derive(Args, Debug, Default)]
pub struct PathArgs {
    /// Consolidation period. Defaults to the latest year found in the source directory.
    #[arg(short, long)]
    pub year: Option<i32>,

    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Operator registry file (Relatorio_cadop.csv).
    #[arg(long)]
    pub registry: Option<PathBuf>,

    #[arg(long)]
    pub database: Option<PathBuf>,
}

impl PathArgs {
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(year) = self.year {
            config.year = Some(year);
        }
        if let Some(dir) = &self.source_dir {
            config.source_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(path) = &self.registry {
            config.registry_path = path.clone();
        }
        if let Some(path) = &self.database {
            config.database_path = path.clone();
        }
    }
}

#[derive(ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[clap(rename_all = "UPPERCASE")]
pub enum TraceLevel {
    DEBUG,
    ERROR,
    #[default]
    INFO,
    TRACE,
    WARN,
}

impl From<TraceLevel> for Level {
    fn from(level: TraceLevel) -> Self {
        match level {
            TraceLevel::DEBUG => Level::DEBUG,
            TraceLevel::ERROR => Level::ERROR,
            TraceLevel::INFO => Level::INFO,
            TraceLevel::TRACE => Level::TRACE,
            TraceLevel::WARN => Level::WARN,
        }
    }
}
