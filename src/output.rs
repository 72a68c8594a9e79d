// 💾 Output Files
// Semicolon-delimited CSVs with a UTF-8 signature, plus read-back for loading

use crate::cnpj::{normalize_registry_id, normalize_tax_id};
use crate::config::PipelineConfig;
use crate::consolidator::{coerce_amount, ConsolidatedResult, ExpenseAggregate, OperatorMetrics};
use crate::parser::parse_amount;
use crate::registry::{normalize_header, OperatorRecord, TextEncoding};
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const UTF8_SIGNATURE: &[u8] = b"\xEF\xBB\xBF";

pub const AGGREGATE_HEADER: [&str; 8] = [
    "CNPJ",
    "RAZAOSOCIAL",
    "TRIMESTRE",
    "ANO",
    "VALOR DESPESA",
    "REGISTRO ANS",
    "MODALIDADE",
    "UF",
];

pub const METRICS_HEADER: [&str; 5] = [
    "RAZAOSOCIAL",
    "UF",
    "Total_Geral",
    "Media_Trimestral",
    "Desvio_Padrao_Despesas",
];

fn money(value: f64) -> String {
    format!("{:.2}", coerce_amount(value))
}

fn create_writer(path: &Path) -> Result<csv::Writer<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    let mut file = File::create(path)
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    file.write_all(UTF8_SIGNATURE)?;

    Ok(csv::WriterBuilder::new()
        .delimiter(b';')
        .from_writer(file))
}

// ============================================================================
// WRITERS
// ============================================================================

pub fn write_aggregates(path: &Path, aggregates: &[ExpenseAggregate]) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record(AGGREGATE_HEADER)?;

    for a in aggregates {
        let quarter = a.quarter.to_string();
        let year = a.year.to_string();
        let amount = money(a.amount);
        writer.write_record([
            a.tax_id.as_str(),
            a.legal_name.as_str(),
            quarter.as_str(),
            year.as_str(),
            amount.as_str(),
            a.registry_id.as_str(),
            a.modality.as_str(),
            a.state.as_str(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_metrics(path: &Path, metrics: &[OperatorMetrics]) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record(METRICS_HEADER)?;

    for m in metrics {
        writer.write_record([
            m.legal_name.clone(),
            m.state.clone(),
            money(m.total),
            money(m.mean),
            money(m.std_dev),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_operators(path: &Path, operators: &[OperatorRecord]) -> Result<()> {
    let mut writer = create_writer(path)?;

    if operators.is_empty() {
        // serde only emits the header alongside the first row
        writer.write_record([
            "REGISTRO_OPERADORA", "CNPJ", "Razao_Social", "Nome_Fantasia", "Modalidade",
            "Logradouro", "Numero", "Complemento", "Bairro", "Cidade", "UF", "CEP", "DDD",
            "Telefone", "Fax", "Endereco_eletronico", "Representante", "Cargo_Representante",
            "Regiao_de_Comercializacao", "Data_Registro_ANS",
        ])?;
    }
    for op in operators {
        writer.serialize(op)?;
    }

    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub consolidated: PathBuf,
    pub metrics: PathBuf,
    pub active_operators: PathBuf,
    pub inactive_operators: PathBuf,
}

/// Write all four outputs of a run. Empty runs still produce header-only files.
pub fn write_result(result: &ConsolidatedResult, config: &PipelineConfig) -> Result<OutputPaths> {
    let paths = OutputPaths {
        consolidated: config.consolidated_path(),
        metrics: config.metrics_path(),
        active_operators: config.active_operators_path(),
        inactive_operators: config.inactive_operators_path(),
    };

    write_aggregates(&paths.consolidated, &result.aggregates)?;
    write_metrics(&paths.metrics, &result.metrics)?;
    write_operators(&paths.active_operators, &result.active_operators)?;
    write_operators(&paths.inactive_operators, &result.inactive_operators)?;

    info!(
        dir = %config.output_dir.display(),
        aggregates = result.aggregates.len(),
        metrics = result.metrics.len(),
        "outputs written"
    );

    Ok(paths)
}

// ============================================================================
// READ-BACK
// ============================================================================

/// Table read with normalized header names
struct Table {
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl Table {
    fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let text = TextEncoding::Utf8Sig
            .decode(&bytes)
            .or_else(|| TextEncoding::Latin1.decode(&bytes))
            .unwrap_or_default();

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers = reader.headers()?.iter().map(normalize_header).collect();
        let rows = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Malformed CSV: {}", path.display()))?;

        Ok(Table { headers, rows })
    }

    fn column(&self, path: &Path, names: &[&str]) -> Result<usize> {
        names
            .iter()
            .find_map(|name| self.headers.iter().position(|h| h == name))
            .ok_or_else(|| anyhow!("{}: missing column {}", path.display(), names[0]))
    }
}

fn cell(record: &csv::StringRecord, i: usize) -> &str {
    record.get(i).unwrap_or("").trim()
}

/// Numeric cells that do not parse become zero instead of dropping the row
fn number_or_zero(value: &str) -> f64 {
    parse_amount(value).unwrap_or(0.0)
}

fn int_or_zero<T: std::str::FromStr + Default>(value: &str) -> T {
    value.parse().unwrap_or_default()
}

/// Read a consolidated CSV back: re-pad identifiers, zero-fill bad numbers,
/// drop exact duplicate rows (first kept)
pub fn read_aggregates(path: &Path) -> Result<Vec<ExpenseAggregate>> {
    let table = Table::read(path)?;
    let tax_id = table.column(path, &["cnpj"])?;
    let legal_name = table.column(path, &["razaosocial", "razao_social"])?;
    let quarter = table.column(path, &["trimestre"])?;
    let year = table.column(path, &["ano"])?;
    let amount = table.column(path, &["valor_despesa", "valor_despesas"])?;
    let registry_id = table.column(path, &["registro_ans", "registro_operadora"])?;
    let modality = table.column(path, &["modalidade", "modalidadee"])?;
    let state = table.column(path, &["uf"])?;

    let mut seen = HashSet::new();
    let mut aggregates = Vec::new();

    for row in &table.rows {
        let a = ExpenseAggregate {
            tax_id: normalize_tax_id(cell(row, tax_id)),
            legal_name: cell(row, legal_name).to_string(),
            quarter: int_or_zero(cell(row, quarter)),
            year: int_or_zero(cell(row, year)),
            amount: number_or_zero(cell(row, amount)),
            registry_id: normalize_registry_id(cell(row, registry_id)),
            modality: cell(row, modality).to_string(),
            state: cell(row, state).to_string(),
        };

        let key = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            a.tax_id, a.legal_name, a.quarter, a.year, a.amount, a.registry_id, a.modality, a.state
        );
        if seen.insert(key) {
            aggregates.push(a);
        }
    }

    Ok(aggregates)
}

pub fn read_metrics(path: &Path) -> Result<Vec<OperatorMetrics>> {
    let table = Table::read(path)?;
    let legal_name = table.column(path, &["razaosocial", "razao_social"])?;
    let state = table.column(path, &["uf"])?;
    let total = table.column(path, &["total_geral"])?;
    let mean = table.column(path, &["media_trimestral"])?;
    let std_dev = table.column(path, &["desvio_padrao_despesas"])?;

    Ok(table
        .rows
        .iter()
        .map(|row| OperatorMetrics {
            legal_name: cell(row, legal_name).to_string(),
            state: cell(row, state).to_string(),
            total: number_or_zero(cell(row, total)),
            mean: number_or_zero(cell(row, mean)),
            std_dev: number_or_zero(cell(row, std_dev)),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryIndex;

    fn acme(quarter: u8, amount: f64) -> ExpenseAggregate {
        ExpenseAggregate {
            tax_id: "11444777000161".to_string(),
            legal_name: "Acme Saude".to_string(),
            quarter,
            year: 2025,
            amount,
            registry_id: "000001".to_string(),
            modality: "Medicina de Grupo".to_string(),
            state: "SP".to_string(),
        }
    }

    #[test]
    fn test_write_aggregates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("consolidado_despesas.csv");

        write_aggregates(&path, &[acme(1, 1500.0)]).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(UTF8_SIGNATURE), "file should carry a UTF-8 signature");
        let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("CNPJ;RAZAOSOCIAL;TRIMESTRE;ANO;VALOR DESPESA;REGISTRO ANS;MODALIDADE;UF")
        );
        assert_eq!(
            lines.next(),
            Some("11444777000161;Acme Saude;1;2025;1500.00;000001;Medicina de Grupo;SP")
        );
    }

    #[test]
    fn test_read_aggregates_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consolidado_despesas.csv");
        let rows = vec![acme(1, 1500.0), acme(2, 10.5)];

        write_aggregates(&path, &rows).unwrap();
        assert_eq!(read_aggregates(&path).unwrap(), rows);
    }

    #[test]
    fn test_read_aggregates_coerces_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.csv");
        fs::write(
            &path,
            "CNPJ;RAZAOSOCIAL;TRIMESTRE;ANO;VALOR DESPESA;REGISTRO ANS;MODALIDADEE;UF\n\
             444777000161;Acme;x;2025;1.234,50;1;Medicina;SP\n\
             444777000161;Acme;x;2025;1.234,50;1;Medicina;SP\n\
             444777000161;Acme;3;;n/a;1;Medicina;SP\n",
        )
        .unwrap();

        let rows = read_aggregates(&path).unwrap();

        assert_eq!(rows.len(), 2, "exact duplicate dropped");
        assert_eq!(rows[0].tax_id, "00444777000161");
        assert_eq!(rows[0].registry_id, "000001");
        assert_eq!(rows[0].quarter, 0);
        assert_eq!(rows[0].amount, 1234.5);
        assert_eq!(rows[1].year, 0);
        assert_eq!(rows[1].amount, 0.0);
    }

    #[test]
    fn test_read_aggregates_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "CNPJ;UF\n1;SP\n").unwrap();
        assert!(read_aggregates(&path).is_err());
    }

    #[test]
    fn test_metrics_and_operators_written() {
        let dir = tempfile::tempdir().unwrap();
        let metrics_path = dir.path().join("despesas_agregadas.csv");
        let ops_path = dir.path().join("operadoras_ativas.csv");

        let metrics = vec![OperatorMetrics {
            legal_name: "Acme Saude".to_string(),
            state: "SP".to_string(),
            total: 150.0,
            mean: 75.0,
            std_dev: 25.0,
        }];
        write_metrics(&metrics_path, &metrics).unwrap();
        assert_eq!(read_metrics(&metrics_path).unwrap(), metrics);

        let ops = vec![OperatorRecord::new("1", "11444777000161", "Acme Saude", "Medicina", "SP")];
        write_operators(&ops_path, &ops).unwrap();
        let index = RegistryIndex::load(&ops_path, "registro_operadora").unwrap();
        assert_eq!(index.lookup("000001"), Some(&ops[0]));

        write_operators(&ops_path, &[]).unwrap();
        let empty = RegistryIndex::load(&ops_path, "registro_operadora").unwrap();
        assert!(empty.is_empty());
    }
}
