// 📈 Reports - read queries over the loaded store
// Backs the operator listing, statistics and ranking endpoints

use crate::cnpj::normalize_tax_id;
use crate::consolidator::ExpenseAggregate;
use crate::db::Store;
use crate::registry::OperatorRecord;
use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const MAX_PAGE_SIZE: u32 = 100;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorStatus {
    ActiveWithExpenses,
    NoExpensesRecorded,
}

impl OperatorStatus {
    pub fn label(&self) -> &'static str {
        match self {
            OperatorStatus::ActiveWithExpenses => "Ativa com despesas",
            OperatorStatus::NoExpensesRecorded => "Sem despesas registradas",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSummary {
    pub id: i64,
    pub operator: OperatorRecord,
    pub status: OperatorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopOperator {
    pub registry_id: String,
    pub legal_name: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: f64,
    pub mean: f64,
    pub top_operators: Vec<TopOperator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthEntry {
    pub registry_id: String,
    pub legal_name: String,
    pub growth_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDistribution {
    pub state: String,
    pub total: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AboveAverageOperator {
    pub registry_id: String,
    pub legal_name: Option<String>,
    pub quarters_above: usize,
}

// ============================================================================
// OPERATORS
// ============================================================================

const OPERATOR_COLUMNS: &str = "o.id, o.registry_id, o.tax_id, o.legal_name, o.trade_name, o.modality,
    o.street, o.number, o.complement, o.district, o.city, o.state, o.postal_code, o.area_code,
    o.phone, o.fax, o.email, o.representative, o.representative_role, o.sales_region,
    o.registered_on,
    EXISTS(SELECT 1 FROM consolidated_expenses e WHERE e.tax_id = o.tax_id)";

fn summary_from_row(row: &Row) -> rusqlite::Result<OperatorSummary> {
    let has_expenses: bool = row.get(21)?;
    Ok(OperatorSummary {
        id: row.get(0)?,
        operator: OperatorRecord {
            registry_id: row.get(1)?,
            tax_id: row.get(2)?,
            legal_name: row.get(3)?,
            trade_name: row.get(4)?,
            modality: row.get(5)?,
            street: row.get(6)?,
            number: row.get(7)?,
            complement: row.get(8)?,
            district: row.get(9)?,
            city: row.get(10)?,
            state: row.get(11)?,
            postal_code: row.get(12)?,
            area_code: row.get(13)?,
            phone: row.get(14)?,
            fax: row.get(15)?,
            email: row.get(16)?,
            representative: row.get(17)?,
            representative_role: row.get(18)?,
            sales_region: row.get(19)?,
            registered_on: row.get(20)?,
        },
        status: if has_expenses {
            OperatorStatus::ActiveWithExpenses
        } else {
            OperatorStatus::NoExpensesRecorded
        },
    })
}

/// Page through operators, optionally filtered by a substring of legal name or tax id.
///
/// The search is literal (`%` and `_` match themselves). Case folding is
/// SQLite `LIKE`, so it ignores case for ASCII letters only: "sao" finds
/// "SAO" but "são" does not find "SÃO".
pub fn list_operators(store: &Store, page: u32, limit: u32, search: Option<&str>) -> Result<Vec<OperatorSummary>> {
    if page < 1 {
        bail!("page must be >= 1, got {}", page);
    }
    if limit < 1 || limit > MAX_PAGE_SIZE {
        bail!("limit must be between 1 and {}, got {}", MAX_PAGE_SIZE, limit);
    }

    let pattern = search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", escape_like(s)));
    let offset = (page - 1) as i64 * limit as i64;

    let mut stmt = store.conn().prepare(&format!(
        "SELECT {} FROM operators o
         WHERE ?1 IS NULL
            OR o.legal_name LIKE ?1 ESCAPE '\\'
            OR o.tax_id LIKE ?1 ESCAPE '\\'
         ORDER BY o.id
         LIMIT ?2 OFFSET ?3",
        OPERATOR_COLUMNS
    ))?;

    let rows = stmt
        .query_map(params![pattern, limit as i64, offset], summary_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn operator_by_tax_id(store: &Store, tax_id: &str) -> Result<Option<OperatorSummary>> {
    let summary = store
        .conn()
        .query_row(
            &format!(
                "SELECT {} FROM operators o WHERE o.tax_id = ?1 ORDER BY o.id LIMIT 1",
                OPERATOR_COLUMNS
            ),
            params![normalize_tax_id(tax_id)],
            summary_from_row,
        )
        .optional()?;
    Ok(summary)
}

/// Consolidated rows for an operator; `None` when the operator is unknown
pub fn expenses_by_tax_id(store: &Store, tax_id: &str) -> Result<Option<Vec<ExpenseAggregate>>> {
    if operator_by_tax_id(store, tax_id)?.is_none() {
        return Ok(None);
    }

    let mut stmt = store.conn().prepare(
        "SELECT tax_id, legal_name, quarter, year, amount, registry_id, modality, state
         FROM consolidated_expenses
         WHERE tax_id = ?1
         ORDER BY year, quarter, id",
    )?;

    let rows = stmt
        .query_map(params![normalize_tax_id(tax_id)], |row| {
            Ok(ExpenseAggregate {
                tax_id: row.get(0)?,
                legal_name: row.get(1)?,
                quarter: row.get(2)?,
                year: row.get(3)?,
                amount: row.get(4)?,
                registry_id: row.get(5)?,
                modality: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                state: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(rows))
}

// ============================================================================
// AGGREGATE STATISTICS
// ============================================================================

pub fn statistics(store: &Store) -> Result<Statistics> {
    let (total, mean): (f64, f64) = store.conn().query_row(
        "SELECT COALESCE(SUM(amount), 0.0), COALESCE(AVG(amount), 0.0) FROM consolidated_expenses",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = store.conn().prepare(
        "SELECT registry_id, legal_name, SUM(amount) AS total
         FROM consolidated_expenses
         GROUP BY registry_id, legal_name
         ORDER BY total DESC, registry_id
         LIMIT 5",
    )?;
    let top_operators = stmt
        .query_map([], |row| {
            Ok(TopOperator {
                registry_id: row.get(0)?,
                legal_name: row.get(1)?,
                total: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Statistics {
        total,
        mean,
        top_operators,
    })
}

fn operator_names(store: &Store) -> Result<HashMap<String, String>> {
    let mut stmt = store
        .conn()
        .prepare("SELECT registry_id, legal_name FROM operators")?;
    let names = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(names)
}

/// Percent growth between each operator's first and last quarter on record.
///
/// A zero first quarter with a non-zero last one counts as 0% growth;
/// 0 -> 0 has no defined growth and is left out, as are operators missing
/// from the registry.
pub fn top_growth(store: &Store, limit: usize) -> Result<Vec<GrowthEntry>> {
    let mut stmt = store.conn().prepare(
        "SELECT registry_id, SUM(amount)
         FROM consolidated_expenses
         GROUP BY registry_id, year, quarter
         ORDER BY registry_id, year, quarter",
    )?;

    // registry id -> (first, last) quarterly totals
    let mut spans: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (registry_id, total) in rows {
        spans
            .entry(registry_id)
            .and_modify(|span| span.1 = total)
            .or_insert((total, total));
    }

    let names = operator_names(store)?;
    let mut entries: Vec<GrowthEntry> = spans
        .into_iter()
        .filter_map(|(registry_id, (first, last))| {
            let growth = (last - first) / first * 100.0;
            let growth = if growth.is_nan() {
                return None;
            } else if growth.is_infinite() {
                0.0
            } else {
                growth
            };
            let legal_name = names.get(&registry_id)?.clone();
            Some(GrowthEntry {
                registry_id,
                legal_name,
                growth_percent: growth,
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        b.growth_percent
            .total_cmp(&a.growth_percent)
            .then_with(|| a.registry_id.cmp(&b.registry_id))
    });
    entries.truncate(limit);
    Ok(entries)
}

pub fn distribution_by_state(store: &Store, limit: usize) -> Result<Vec<StateDistribution>> {
    let mut stmt = store.conn().prepare(
        "SELECT state, SUM(amount) AS total, AVG(amount)
         FROM consolidated_expenses
         GROUP BY state
         ORDER BY total DESC, state
         LIMIT ?1",
    )?;

    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(StateDistribution {
                state: row.get(0)?,
                total: row.get(1)?,
                mean: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Operators whose mean expense exceeds the overall mean in at least
/// `min_quarters` distinct quarter numbers
pub fn above_average_operators(store: &Store, min_quarters: usize) -> Result<Vec<AboveAverageOperator>> {
    let overall: Option<f64> = store.conn().query_row(
        "SELECT AVG(amount) FROM consolidated_expenses",
        [],
        |row| row.get(0),
    )?;
    let Some(overall) = overall else {
        return Ok(Vec::new());
    };

    let mut stmt = store.conn().prepare(
        "SELECT registry_id, AVG(amount)
         FROM consolidated_expenses
         GROUP BY registry_id, quarter",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for (registry_id, mean) in rows {
        let count = counts.entry(registry_id).or_insert(0);
        if mean > overall {
            *count += 1;
        }
    }

    let names = operator_names(store)?;
    Ok(counts
        .into_iter()
        .filter(|(_, quarters)| *quarters >= min_quarters)
        .map(|(registry_id, quarters_above)| AboveAverageOperator {
            legal_name: names.get(&registry_id).cloned(),
            registry_id,
            quarters_above,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(registry_id: &str, tax_id: &str, name: &str, state: &str, quarter: u8, amount: f64) -> ExpenseAggregate {
        ExpenseAggregate {
            tax_id: tax_id.to_string(),
            legal_name: name.to_string(),
            quarter,
            year: 2025,
            amount,
            registry_id: registry_id.to_string(),
            modality: "Medicina de Grupo".to_string(),
            state: state.to_string(),
        }
    }

    fn seeded_store() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store
            .load_operators(&[
                OperatorRecord::new("1", "11444777000161", "Acme Saude", "Medicina de Grupo", "SP"),
                OperatorRecord::new("2", "11222333000181", "Beta Saude", "Cooperativa Medica", "RJ"),
                OperatorRecord::new("3", "45997418000153", "Gama Odonto", "Odontologia de Grupo", "MG"),
            ])
            .unwrap();
        store
            .load_aggregates(&[
                row("000001", "11444777000161", "Acme Saude", "SP", 1, 100.0),
                row("000001", "11444777000161", "Acme Saude", "SP", 2, 300.0),
                row("000001", "11444777000161", "Acme Saude", "SP", 3, 400.0),
                row("000002", "11222333000181", "Beta Saude", "RJ", 1, 200.0),
                row("000002", "11222333000181", "Beta Saude", "RJ", 2, 100.0),
            ])
            .unwrap();
        store
    }

    #[test]
    fn test_list_operators_status_and_paging() {
        let store = seeded_store();

        let page = list_operators(&store, 1, 2, None).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].operator.legal_name, "Acme Saude");
        assert_eq!(page[0].status, OperatorStatus::ActiveWithExpenses);

        let page2 = list_operators(&store, 2, 2, None).unwrap();
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].status, OperatorStatus::NoExpensesRecorded);
        assert_eq!(page2[0].status.label(), "Sem despesas registradas");
    }

    #[test]
    fn test_list_operators_search() {
        let store = seeded_store();

        let by_name = list_operators(&store, 1, 10, Some("beta")).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].operator.registry_id, "000002");

        let by_tax_id = list_operators(&store, 1, 10, Some("45997418")).unwrap();
        assert_eq!(by_tax_id[0].operator.legal_name, "Gama Odonto");
    }

    #[test]
    fn test_list_operators_search_wildcards_are_literal() {
        let store = seeded_store();

        assert!(list_operators(&store, 1, 10, Some("%")).unwrap().is_empty());
        assert!(list_operators(&store, 1, 10, Some("Sa_de")).unwrap().is_empty());
        assert_eq!(list_operators(&store, 1, 10, Some("SAUDE")).unwrap().len(), 2);
        assert_eq!(escape_like(r"10%_a\b"), r"10\%\_a\\b");
    }

    #[test]
    fn test_list_operators_rejects_bad_paging() {
        let store = seeded_store();
        assert!(list_operators(&store, 0, 10, None).is_err());
        assert!(list_operators(&store, 1, 0, None).is_err());
        assert!(list_operators(&store, 1, 101, None).is_err());
    }

    #[test]
    fn test_operator_and_expenses_by_tax_id() {
        let store = seeded_store();

        let op = operator_by_tax_id(&store, "11.444.777/0001-61").unwrap().unwrap();
        assert_eq!(op.operator.registry_id, "000001");

        let expenses = expenses_by_tax_id(&store, "11444777000161").unwrap().unwrap();
        assert_eq!(expenses.len(), 3);
        assert_eq!(expenses[0].quarter, 1);

        assert!(operator_by_tax_id(&store, "00000000000000").unwrap().is_none());
        assert!(expenses_by_tax_id(&store, "00000000000000").unwrap().is_none());
        assert_eq!(expenses_by_tax_id(&store, "45997418000153").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_statistics() {
        let store = seeded_store();
        let stats = statistics(&store).unwrap();

        assert_eq!(stats.total, 1100.0);
        assert_eq!(stats.mean, 220.0);
        assert_eq!(stats.top_operators.len(), 2);
        assert_eq!(stats.top_operators[0].legal_name, "Acme Saude");
        assert_eq!(stats.top_operators[0].total, 800.0);
    }

    #[test]
    fn test_statistics_on_empty_store() {
        let store = Store::open_in_memory().unwrap();
        let stats = statistics(&store).unwrap();

        assert_eq!(stats.total, 0.0);
        assert_eq!(stats.mean, 0.0);
        assert!(stats.top_operators.is_empty());
    }

    #[test]
    fn test_top_growth() {
        let store = seeded_store();
        let growth = top_growth(&store, 5).unwrap();

        assert_eq!(growth.len(), 2);
        assert_eq!(growth[0].registry_id, "000001");
        assert_eq!(growth[0].growth_percent, 300.0);
        assert_eq!(growth[1].growth_percent, -50.0);
    }

    #[test]
    fn test_distribution_by_state() {
        let store = seeded_store();
        let dist = distribution_by_state(&store, 5).unwrap();

        assert_eq!(dist.len(), 2);
        assert_eq!(dist[0].state, "SP");
        assert_eq!(dist[0].total, 800.0);
        assert!((dist[0].mean - 800.0 / 3.0).abs() < 1e-9);
        assert_eq!(dist[1].state, "RJ");
    }

    #[test]
    fn test_above_average_operators() {
        let store = seeded_store();
        // overall mean 220: Acme is above in Q2 and Q3, Beta in none
        let above = above_average_operators(&store, 2).unwrap();

        assert_eq!(above.len(), 1);
        assert_eq!(above[0].registry_id, "000001");
        assert_eq!(above[0].legal_name.as_deref(), Some("Acme Saude"));
        assert_eq!(above[0].quarters_above, 2);
    }
}
