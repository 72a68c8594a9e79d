// ANS Expenses - Core Library
// Consolidation engine, store and report queries, shared by the CLI and tests

pub mod cnpj;
pub mod config;
pub mod consolidator;
pub mod db;
pub mod error;
pub mod output;
pub mod parser;
pub mod registry;
pub mod reports;
pub mod validator;

// Re-export commonly used types
pub use config::{
    DescriptionMatch, ExpenseFileSchema, PipelineConfig, SignPolicy, CLAIMS_MARKER,
};
pub use consolidator::{
    aggregate, compute_metrics, run_consolidation,
    ConsolidatedResult, ConsolidationSummary, Consolidator, EmptyReason,
    ExpenseAggregate, OperatorMetrics, RejectionCounts, RunStatus,
};
pub use db::{LoadEvent, LoadReport, Store};
pub use error::{FileReadError, RegistryLoadError, Rejection};
pub use output::{read_aggregates, read_metrics, write_result, OutputPaths};
pub use parser::{
    latest_period, parse_amount, parse_expense_file, parse_source_amount, period_files, RawExpenseLine,
};
pub use registry::{OperatorRecord, RegistryIndex, TextEncoding};
pub use reports::{
    above_average_operators, distribution_by_state, expenses_by_tax_id, list_operators,
    operator_by_tax_id, statistics, top_growth, OperatorStatus, OperatorSummary, Statistics,
};
pub use validator::{validate, RowValidator, ValidatedExpenseRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
