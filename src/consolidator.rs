// 📊 Consolidator - Expense aggregation for one period
// Drives validation over every source file, groups accepted rows and derives
// per-operator metrics. Stateless: output depends only on (files, registry, period).

use crate::config::{DescriptionMatch, ExpenseFileSchema, PipelineConfig, CONSOLIDATED_FILE, METRICS_FILE};
use crate::error::Rejection;
use crate::parser::{latest_period, parse_expense_file, period_files};
use crate::registry::{OperatorRecord, RegistryIndex};
use crate::validator::{RowValidator, ValidatedExpenseRecord};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// One row of the consolidated table. Serialized column order is fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseAggregate {
    #[serde(rename = "CNPJ")]
    pub tax_id: String,
    #[serde(rename = "RAZAOSOCIAL")]
    pub legal_name: String,
    #[serde(rename = "TRIMESTRE")]
    pub quarter: u8,
    #[serde(rename = "ANO")]
    pub year: i32,
    #[serde(rename = "VALOR DESPESA")]
    pub amount: f64,
    #[serde(rename = "REGISTRO ANS")]
    pub registry_id: String,
    #[serde(rename = "MODALIDADE")]
    pub modality: String,
    #[serde(rename = "UF")]
    pub state: String,
}

/// Totals per (legal name, state)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorMetrics {
    #[serde(rename = "RAZAOSOCIAL")]
    pub legal_name: String,
    #[serde(rename = "UF")]
    pub state: String,
    #[serde(rename = "Total_Geral")]
    pub total: f64,
    #[serde(rename = "Media_Trimestral")]
    pub mean: f64,
    #[serde(rename = "Desvio_Padrao_Despesas")]
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct AggregateKey {
    tax_id: String,
    legal_name: String,
    quarter: u8,
    year: i32,
    registry_id: String,
    modality: String,
    state: String,
}

impl From<&ValidatedExpenseRecord> for AggregateKey {
    fn from(r: &ValidatedExpenseRecord) -> Self {
        AggregateKey {
            tax_id: r.tax_id.clone(),
            legal_name: r.legal_name.clone(),
            quarter: r.quarter,
            year: r.year,
            registry_id: r.registry_id.clone(),
            modality: r.modality.clone(),
            state: r.state.clone(),
        }
    }
}

// ============================================================================
// RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub unparseable_amount: usize,
    pub non_positive_amount: usize,
    pub unknown_registry_id: usize,
    pub invalid_tax_id: usize,
    pub unparseable_date: usize,
}

impl RejectionCounts {
    pub fn record(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::UnparseableAmount => self.unparseable_amount += 1,
            Rejection::NonPositiveAmount => self.non_positive_amount += 1,
            Rejection::UnknownRegistryId => self.unknown_registry_id += 1,
            Rejection::InvalidTaxId => self.invalid_tax_id += 1,
            Rejection::UnparseableDate => self.unparseable_date += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.unparseable_amount
            + self.non_positive_amount
            + self.unknown_registry_id
            + self.invalid_tax_id
            + self.unparseable_date
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationSummary {
    pub year: i32,
    pub files_scanned: usize,
    pub files_failed: Vec<FailedFile>,
    pub rows_read: usize,
    pub candidates: usize,
    pub accepted: usize,
    pub rejections: RejectionCounts,
}

impl ConsolidationSummary {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} files ({} failed), {} rows, {} claims candidates, {} accepted, {} rejected",
            self.year,
            self.files_scanned,
            self.files_failed.len(),
            self.rows_read,
            self.candidates,
            self.accepted,
            self.rejections.total()
        )
    }
}

/// Why a run produced no data. Reportable, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmptyReason {
    NoSourceFiles,
    NoAcceptedRows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Consolidated,
    Empty(EmptyReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedResult {
    pub status: RunStatus,
    pub aggregates: Vec<ExpenseAggregate>,
    pub metrics: Vec<OperatorMetrics>,
    pub active_operators: Vec<OperatorRecord>,
    pub inactive_operators: Vec<OperatorRecord>,
    pub summary: ConsolidationSummary,
}

impl ConsolidatedResult {
    fn empty(reason: EmptyReason, summary: ConsolidationSummary, index: &RegistryIndex) -> Self {
        ConsolidatedResult {
            status: RunStatus::Empty(reason),
            aggregates: Vec::new(),
            metrics: Vec::new(),
            active_operators: Vec::new(),
            inactive_operators: index.operators().cloned().collect(),
            summary,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.status, RunStatus::Empty(_))
    }

    /// SHA-256 over the canonical aggregate and metrics rows
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for a in &self.aggregates {
            hasher.update(format!(
                "A|{}|{}|{}|{}|{:.2}|{}|{}|{}\n",
                a.tax_id, a.legal_name, a.quarter, a.year, a.amount, a.registry_id, a.modality, a.state
            ));
        }
        for m in &self.metrics {
            hasher.update(format!(
                "M|{}|{}|{:.2}|{:.2}|{:.2}\n",
                m.legal_name, m.state, m.total, m.mean, m.std_dev
            ));
        }
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Late-stage safety net: anything that is not a finite number counts as zero
pub fn coerce_amount(amount: f64) -> f64 {
    if amount.is_finite() {
        amount
    } else {
        0.0
    }
}

/// Group by the full aggregate key and sum amounts. Output is key-ordered.
pub fn aggregate(records: &[ValidatedExpenseRecord]) -> Vec<ExpenseAggregate> {
    let mut groups: BTreeMap<AggregateKey, f64> = BTreeMap::new();
    for record in records {
        *groups.entry(AggregateKey::from(record)).or_insert(0.0) += coerce_amount(record.amount);
    }

    groups
        .into_iter()
        .map(|(key, amount)| ExpenseAggregate {
            tax_id: key.tax_id,
            legal_name: key.legal_name,
            quarter: key.quarter,
            year: key.year,
            amount,
            registry_id: key.registry_id,
            modality: key.modality,
            state: key.state,
        })
        .collect()
}

/// Population standard deviation; 0 for fewer than two samples
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev.is_finite() {
        std_dev
    } else {
        0.0
    }
}

/// Group aggregates by (legal name, state): total, mean, std dev
pub fn compute_metrics(aggregates: &[ExpenseAggregate]) -> Vec<OperatorMetrics> {
    let mut groups: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
    for a in aggregates {
        groups
            .entry((a.legal_name.clone(), a.state.clone()))
            .or_default()
            .push(coerce_amount(a.amount));
    }

    groups
        .into_iter()
        .map(|((legal_name, state), values)| {
            let total: f64 = values.iter().sum();
            OperatorMetrics {
                legal_name,
                state,
                total,
                mean: total / values.len() as f64,
                std_dev: population_std_dev(&values),
            }
        })
        .collect()
}

// ============================================================================
// CONSOLIDATOR
// ============================================================================

pub struct Consolidator {
    validator: RowValidator,
    description_match: DescriptionMatch,
    claims_marker: String,
    schema: ExpenseFileSchema,
}

impl Consolidator {
    pub fn new(config: &PipelineConfig) -> Self {
        Consolidator {
            validator: RowValidator::new(config.sign_policy),
            description_match: config.description_match,
            claims_marker: config.claims_marker.clone(),
            schema: config.expense_schema,
        }
    }

    /// Consolidate every file in `source_dir` belonging to `year`
    pub fn consolidate(&self, source_dir: &Path, year: i32, index: &RegistryIndex) -> ConsolidatedResult {
        let files = match period_files(source_dir, year, &[CONSOLIDATED_FILE, METRICS_FILE]) {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %source_dir.display(), error = %e, "source directory unreadable");
                Vec::new()
            }
        };

        self.consolidate_files(&files, year, index)
    }

    /// Consolidate an explicit file list. A failing file is logged and skipped.
    pub fn consolidate_files(&self, files: &[PathBuf], year: i32, index: &RegistryIndex) -> ConsolidatedResult {
        let mut summary = ConsolidationSummary {
            year,
            ..Default::default()
        };
        let mut accepted = Vec::new();

        for path in files {
            let lines = match parse_expense_file(path, &self.schema) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable expense file");
                    summary.files_failed.push(FailedFile {
                        path: e.path().clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            summary.files_scanned += 1;
            summary.rows_read += lines.len();
            let before = accepted.len();

            for line in lines
                .iter()
                .filter(|l| self.description_match.matches(&l.description, &self.claims_marker))
            {
                summary.candidates += 1;
                match self.validator.check(line, index) {
                    Ok(record) => accepted.push(record),
                    Err(rejection) => summary.rejections.record(rejection),
                }
            }

            debug!(
                file = %path.display(),
                rows = lines.len(),
                accepted = accepted.len() - before,
                "expense file consolidated"
            );
        }

        summary.accepted = accepted.len();

        if summary.files_scanned == 0 {
            warn!(year, "no expense files scanned for period");
            return ConsolidatedResult::empty(EmptyReason::NoSourceFiles, summary, index);
        }
        if accepted.is_empty() {
            warn!(year, "no expense rows accepted for period");
            return ConsolidatedResult::empty(EmptyReason::NoAcceptedRows, summary, index);
        }

        let aggregates = aggregate(&accepted);
        let metrics = compute_metrics(&aggregates);

        let active_ids: HashSet<String> = aggregates.iter().map(|a| a.registry_id.clone()).collect();
        let (active_operators, inactive_operators) = index.partition(&active_ids);

        info!(
            summary = %summary.summary(),
            groups = aggregates.len(),
            active = active_operators.len(),
            inactive = inactive_operators.len(),
            "consolidation complete"
        );

        ConsolidatedResult {
            status: RunStatus::Consolidated,
            aggregates,
            metrics,
            active_operators,
            inactive_operators,
            summary,
        }
    }
}

/// Load the registry, resolve the period and consolidate.
/// Only a registry failure (or an unresolvable period) is returned as an error.
pub fn run_consolidation(config: &PipelineConfig) -> Result<ConsolidatedResult> {
    let index = RegistryIndex::load(&config.registry_path, &config.registry_primary_column)?;

    let year = match config.year {
        Some(year) => year,
        None => latest_period(&config.source_dir)
            .ok()
            .flatten()
            .ok_or_else(|| anyhow!("no period found in {}", config.source_dir.display()))?,
    };

    info!(
        year,
        source_dir = %config.source_dir.display(),
        registry_encoding = index.encoding().map(|e| e.name()).unwrap_or("-"),
        "consolidating period"
    );
    Ok(Consolidator::new(config).consolidate(&config.source_dir, year, &index))
}
