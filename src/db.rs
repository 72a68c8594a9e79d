// 🗄️ Store - SQLite persistence for consolidated output
// Explicitly constructed session: open at start, closed when dropped.

use crate::config::PipelineConfig;
use crate::consolidator::{ExpenseAggregate, OperatorMetrics};
use crate::output::{read_aggregates, read_metrics};
use crate::registry::{OperatorRecord, RegistryIndex};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Audit entry for one load into the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: String,
    pub data: serde_json::Value,
}

impl LoadEvent {
    pub fn new(fingerprint: &str, data: serde_json::Value) -> Self {
        LoadEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            fingerprint: fingerprint.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub operators: usize,
    pub aggregates: usize,
    pub metrics: usize,
    /// Same content was already loaded; nothing was written
    pub skipped: bool,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // WAL mode for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Store { conn };
        store.setup()?;
        debug!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Store {
            conn: Connection::open_in_memory()?,
        };
        store.setup()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn setup(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS operators (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                registry_id TEXT NOT NULL UNIQUE,
                tax_id TEXT NOT NULL,
                legal_name TEXT NOT NULL,
                trade_name TEXT,
                modality TEXT NOT NULL,
                street TEXT,
                number TEXT,
                complement TEXT,
                district TEXT,
                city TEXT,
                state TEXT NOT NULL,
                postal_code TEXT,
                area_code TEXT,
                phone TEXT,
                fax TEXT,
                email TEXT,
                representative TEXT,
                representative_role TEXT,
                sales_region TEXT,
                registered_on TEXT
            );

            CREATE TABLE IF NOT EXISTS consolidated_expenses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tax_id TEXT NOT NULL,
                legal_name TEXT NOT NULL,
                quarter INTEGER NOT NULL,
                year INTEGER NOT NULL,
                amount REAL NOT NULL,
                registry_id TEXT NOT NULL,
                modality TEXT,
                state TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS aggregated_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                legal_name TEXT NOT NULL,
                state TEXT NOT NULL,
                total REAL NOT NULL,
                mean REAL NOT NULL,
                std_dev REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS load_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT UNIQUE NOT NULL,
                timestamp TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_operators_tax_id ON operators(tax_id);
            CREATE INDEX IF NOT EXISTS idx_expenses_tax_id ON consolidated_expenses(tax_id);
            CREATE INDEX IF NOT EXISTS idx_expenses_registry ON consolidated_expenses(registry_id);
            CREATE INDEX IF NOT EXISTS idx_load_events_fingerprint ON load_events(fingerprint);",
        )?;

        Ok(())
    }

    // ========================================================================
    // LOADING (each call replaces the table contents)
    // ========================================================================

    pub fn load_operators(&mut self, operators: &[OperatorRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM operators", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO operators (
                    registry_id, tax_id, legal_name, trade_name, modality, street, number,
                    complement, district, city, state, postal_code, area_code, phone, fax,
                    email, representative, representative_role, sales_region, registered_on
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            )?;
            for op in operators {
                stmt.execute(params![
                    op.registry_id,
                    op.tax_id,
                    op.legal_name,
                    op.trade_name,
                    op.modality,
                    op.street,
                    op.number,
                    op.complement,
                    op.district,
                    op.city,
                    op.state,
                    op.postal_code,
                    op.area_code,
                    op.phone,
                    op.fax,
                    op.email,
                    op.representative,
                    op.representative_role,
                    op.sales_region,
                    op.registered_on,
                ])?;
            }
        }
        tx.commit()?;

        self.count("operators")
    }

    pub fn load_aggregates(&mut self, aggregates: &[ExpenseAggregate]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM consolidated_expenses", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO consolidated_expenses (
                    tax_id, legal_name, quarter, year, amount, registry_id, modality, state
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for a in aggregates {
                stmt.execute(params![
                    a.tax_id,
                    a.legal_name,
                    a.quarter,
                    a.year,
                    a.amount,
                    a.registry_id,
                    a.modality,
                    a.state,
                ])?;
            }
        }
        tx.commit()?;

        Ok(aggregates.len())
    }

    pub fn load_metrics(&mut self, metrics: &[OperatorMetrics]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM aggregated_metrics", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO aggregated_metrics (legal_name, state, total, mean, std_dev)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for m in metrics {
                stmt.execute(params![m.legal_name, m.state, m.total, m.mean, m.std_dev])?;
            }
        }
        tx.commit()?;

        Ok(metrics.len())
    }

    pub fn count(&self, table: &str) -> Result<usize> {
        // table names are fixed by callers, never user input
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========================================================================
    // LOAD AUDIT LOG
    // ========================================================================

    pub fn record_load(&self, event: &LoadEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO load_events (event_id, timestamp, fingerprint, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.fingerprint,
                serde_json::to_string(&event.data)?,
            ],
        )?;
        Ok(())
    }

    /// Fingerprint of the outputs the store currently holds, if any load happened.
    pub fn latest_fingerprint(&self) -> Result<Option<String>> {
        let fingerprint = self
            .conn
            .query_row(
                "SELECT fingerprint FROM load_events ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fingerprint)
    }

    pub fn load_events(&self) -> Result<Vec<LoadEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, fingerprint, data FROM load_events ORDER BY id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let timestamp: String = row.get(1)?;
                let data: String = row.get(3)?;
                Ok((row.get::<_, String>(0)?, timestamp, row.get::<_, String>(2)?, data))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(event_id, timestamp, fingerprint, data)| -> Result<LoadEvent> {
                Ok(LoadEvent {
                    event_id,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
                    fingerprint,
                    data: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }

    // ========================================================================
    // FILE LOAD
    // ========================================================================

    /// Load the written CSV outputs of a run. Re-loading the files the store
    /// already holds is a no-op; any other set replaces the current contents.
    pub fn load_outputs(&mut self, config: &PipelineConfig) -> Result<LoadReport> {
        let fingerprint = fingerprint_files(&[
            config.consolidated_path().as_path(),
            config.metrics_path().as_path(),
            config.active_operators_path().as_path(),
            config.inactive_operators_path().as_path(),
        ])?;

        if self.latest_fingerprint()?.as_deref() == Some(fingerprint.as_str()) {
            info!(%fingerprint, "outputs already loaded, skipping");
            return Ok(LoadReport {
                skipped: true,
                ..Default::default()
            });
        }

        let aggregates = read_aggregates(&config.consolidated_path())?;
        let metrics = read_metrics(&config.metrics_path())?;

        let mut operators: Vec<OperatorRecord> = Vec::new();
        for path in [config.active_operators_path(), config.inactive_operators_path()] {
            let index = RegistryIndex::load(&path, "registro_operadora")
                .with_context(|| format!("Failed to read operators from {}", path.display()))?;
            operators.extend(index.operators().cloned());
        }

        let report = LoadReport {
            operators: self.load_operators(&operators)?,
            aggregates: self.load_aggregates(&aggregates)?,
            metrics: self.load_metrics(&metrics)?,
            skipped: false,
        };

        self.record_load(&LoadEvent::new(
            &fingerprint,
            serde_json::json!({
                "operators": report.operators,
                "aggregates": report.aggregates,
                "metrics": report.metrics,
                "output_dir": config.output_dir.display().to_string(),
            }),
        ))?;

        info!(
            operators = report.operators,
            aggregates = report.aggregates,
            metrics = report.metrics,
            "outputs loaded into store"
        );

        Ok(report)
    }
}

/// SHA-256 over the concatenated bytes of `paths`
pub fn fingerprint_files(paths: &[&Path]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        hasher.update(&bytes);
        hasher.update(b"\0");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::write_result;
    use crate::consolidator::{ConsolidatedResult, ConsolidationSummary, RunStatus};

    fn sample_aggregate(quarter: u8, amount: f64) -> ExpenseAggregate {
        aggregate_for_year(2025, quarter, amount)
    }

    fn aggregate_for_year(year: i32, quarter: u8, amount: f64) -> ExpenseAggregate {
        ExpenseAggregate {
            tax_id: "11444777000161".to_string(),
            legal_name: "Acme Saude".to_string(),
            quarter,
            year,
            amount,
            registry_id: "000001".to_string(),
            modality: "Medicina de Grupo".to_string(),
            state: "SP".to_string(),
        }
    }

    #[test]
    fn test_load_replaces_contents() {
        let mut store = Store::open_in_memory().unwrap();

        store.load_aggregates(&[sample_aggregate(1, 10.0), sample_aggregate(2, 20.0)]).unwrap();
        assert_eq!(store.count("consolidated_expenses").unwrap(), 2);

        store.load_aggregates(&[sample_aggregate(3, 30.0)]).unwrap();
        assert_eq!(store.count("consolidated_expenses").unwrap(), 1);
    }

    #[test]
    fn test_load_operators_ignores_duplicate_ids() {
        let mut store = Store::open_in_memory().unwrap();
        let ops = vec![
            OperatorRecord::new("1", "11444777000161", "First", "Medicina", "SP"),
            OperatorRecord::new("000001", "11222333000181", "Second", "Medicina", "RJ"),
        ];

        assert_eq!(store.load_operators(&ops).unwrap(), 1);
        let name: String = store
            .conn()
            .query_row("SELECT legal_name FROM operators WHERE registry_id = '000001'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "First");
    }

    #[test]
    fn test_load_event_log() {
        let store = Store::open_in_memory().unwrap();
        let event = LoadEvent::new("abc123", serde_json::json!({"aggregates": 3}));

        assert_eq!(store.latest_fingerprint().unwrap(), None);
        store.record_load(&event).unwrap();
        store.record_load(&LoadEvent::new("def456", serde_json::json!({}))).unwrap();
        assert_eq!(store.latest_fingerprint().unwrap().as_deref(), Some("def456"));

        let events = store.load_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, event.event_id);
        assert_eq!(events[0].data["aggregates"], 3);
    }

    fn write_outputs(config: &PipelineConfig, aggregates: Vec<ExpenseAggregate>) {
        let result = ConsolidatedResult {
            status: RunStatus::Consolidated,
            metrics: crate::consolidator::compute_metrics(&aggregates),
            aggregates,
            active_operators: vec![OperatorRecord::new("1", "11444777000161", "Acme Saude", "Medicina de Grupo", "SP")],
            inactive_operators: vec![OperatorRecord::new("2", "11222333000181", "Beta", "Cooperativa", "RJ")],
            summary: ConsolidationSummary::default(),
        };
        write_result(&result, config).unwrap();
    }

    fn stored_years(store: &Store) -> Vec<i32> {
        let mut stmt = store
            .conn()
            .prepare("SELECT DISTINCT year FROM consolidated_expenses ORDER BY year")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<i32>>>()
            .unwrap()
    }

    #[test]
    fn test_load_outputs_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        write_outputs(&config, vec![sample_aggregate(1, 100.0), sample_aggregate(2, 50.0)]);

        let mut store = Store::open(&dir.path().join("db").join("ans.db")).unwrap();
        let first = store.load_outputs(&config).unwrap();
        let second = store.load_outputs(&config).unwrap();

        assert_eq!(first.operators, 2);
        assert_eq!(first.aggregates, 2);
        assert_eq!(first.metrics, 1);
        assert!(!first.skipped);
        assert!(second.skipped, "identical outputs should not be reloaded");
        assert_eq!(store.load_events().unwrap().len(), 1);
    }

    #[test]
    fn test_load_outputs_reloads_earlier_outputs_after_other_period() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut store = Store::open_in_memory().unwrap();

        write_outputs(&config, vec![aggregate_for_year(2024, 1, 10.0)]);
        assert!(!store.load_outputs(&config).unwrap().skipped);

        write_outputs(&config, vec![aggregate_for_year(2025, 1, 20.0)]);
        assert!(!store.load_outputs(&config).unwrap().skipped);
        assert_eq!(stored_years(&store), vec![2025]);

        write_outputs(&config, vec![aggregate_for_year(2024, 1, 10.0)]);
        let report = store.load_outputs(&config).unwrap();

        assert!(!report.skipped, "outputs differing from the stored set must be loaded");
        assert_eq!(stored_years(&store), vec![2024]);
        assert_eq!(store.load_events().unwrap().len(), 3);
    }
}
