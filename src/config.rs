// ⚙️ Pipeline Configuration
// Policies and pinned file contracts for a consolidation run

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Account description that marks a claims/events expense line
pub const CLAIMS_MARKER: &str = "Despesas com Eventos / Sinistros";

pub const CONSOLIDATED_FILE: &str = "consolidado_despesas.csv";
pub const METRICS_FILE: &str = "despesas_agregadas.csv";
pub const ACTIVE_OPERATORS_FILE: &str = "operadoras_ativas.csv";
pub const INACTIVE_OPERATORS_FILE: &str = "operadoras_inativas.csv";

// ============================================================================
// POLICIES
// ============================================================================

/// Which balances count as expenses.
///
/// Earlier revisions of the pipeline kept zero balances, later ones drop them.
/// `StrictlyPositive` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignPolicy {
    /// Reject `amount <= 0`
    #[default]
    StrictlyPositive,
    /// Reject `amount < 0`
    NonNegative,
}

impl SignPolicy {
    pub fn accepts(&self, amount: f64) -> bool {
        match self {
            SignPolicy::StrictlyPositive => amount > 0.0,
            SignPolicy::NonNegative => amount >= 0.0,
        }
    }
}

impl FromStr for SignPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" | "strictly_positive" => Ok(SignPolicy::StrictlyPositive),
            "non-negative" | "non_negative" => Ok(SignPolicy::NonNegative),
            other => Err(anyhow!("unknown sign policy: {}", other)),
        }
    }
}

/// How a row's description is compared against the claims marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionMatch {
    #[default]
    Exact,
    ContainsIgnoreCase,
}

impl DescriptionMatch {
    pub fn matches(&self, description: &str, marker: &str) -> bool {
        match self {
            DescriptionMatch::Exact => description.trim() == marker,
            DescriptionMatch::ContainsIgnoreCase => description
                .to_lowercase()
                .contains(&marker.to_lowercase()),
        }
    }
}

impl FromStr for DescriptionMatch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(DescriptionMatch::Exact),
            "contains" | "contains_ignore_case" => Ok(DescriptionMatch::ContainsIgnoreCase),
            other => Err(anyhow!("unknown description match mode: {}", other)),
        }
    }
}

// ============================================================================
// EXPENSE FILE SCHEMA
// ============================================================================

/// Declared positional layout of a quarterly accounting extract.
///
/// Rows are read by position, so the header width is checked against
/// `width` when the file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseFileSchema {
    pub date: usize,
    pub registry_id: usize,
    pub account_code: usize,
    pub description: usize,
    pub opening_balance: usize,
    pub closing_balance: usize,
    pub width: usize,
}

impl Default for ExpenseFileSchema {
    fn default() -> Self {
        // DATA;REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL
        ExpenseFileSchema {
            date: 0,
            registry_id: 1,
            account_code: 2,
            description: 3,
            opening_balance: 4,
            closing_balance: 5,
            width: 6,
        }
    }
}

// ============================================================================
// PIPELINE CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub registry_path: PathBuf,
    pub database_path: PathBuf,

    /// Consolidation period; `None` picks the latest year in `source_dir`
    pub year: Option<i32>,

    pub sign_policy: SignPolicy,
    pub description_match: DescriptionMatch,
    pub claims_marker: String,
    pub registry_primary_column: String,
    pub expense_schema: ExpenseFileSchema,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            source_dir: PathBuf::from("download_ans/csv"),
            output_dir: PathBuf::from("data/csv"),
            registry_path: PathBuf::from("download_ans/csv/Relatorio_cadop.csv"),
            database_path: PathBuf::from("data/ans_expenses.db"),
            year: None,
            sign_policy: SignPolicy::default(),
            description_match: DescriptionMatch::default(),
            claims_marker: CLAIMS_MARKER.to_string(),
            registry_primary_column: "registro_operadora".to_string(),
            expense_schema: ExpenseFileSchema::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `.env` (if present) and `ANS_*` environment variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = PipelineConfig::default();

        if let Some(v) = lookup("ANS_SOURCE_DIR") {
            config.source_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANS_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANS_REGISTRY_PATH") {
            config.registry_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANS_DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANS_YEAR") {
            let year = v
                .trim()
                .parse::<i32>()
                .with_context(|| format!("ANS_YEAR is not a year: {}", v))?;
            config.year = Some(year);
        }
        if let Some(v) = lookup("ANS_SIGN_POLICY") {
            config.sign_policy = v.parse()?;
        }
        if let Some(v) = lookup("ANS_DESCRIPTION_MATCH") {
            config.description_match = v.parse()?;
        }

        Ok(config)
    }

    pub fn consolidated_path(&self) -> PathBuf {
        self.output_dir.join(CONSOLIDATED_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.output_dir.join(METRICS_FILE)
    }

    pub fn active_operators_path(&self) -> PathBuf {
        self.output_dir.join(ACTIVE_OPERATORS_FILE)
    }

    pub fn inactive_operators_path(&self) -> PathBuf {
        self.output_dir.join(INACTIVE_OPERATORS_FILE)
    }
}
