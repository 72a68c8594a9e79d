// ✅ Row Validator
// Accepts or rejects one raw expense line and normalizes the accepted ones
//
// Steps run in order and short-circuit:
//   amount -> registry lookup -> tax id check digits -> date/quarter
// A rejected row is not an error; it simply contributes nothing.

use crate::cnpj::{is_valid_cnpj, normalize_registry_id, normalize_tax_id};
use crate::config::SignPolicy;
use crate::error::Rejection;
use crate::parser::{parse_source_amount, RawExpenseLine};
use crate::registry::RegistryIndex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedExpenseRecord {
    pub tax_id: String,
    pub legal_name: String,
    pub quarter: u8,
    pub year: i32,
    pub amount: f64,
    pub registry_id: String,
    pub modality: String,
    pub state: String,
}

/// Quarter (1-4) for a calendar month; `None` outside 1..=12
pub fn quarter_of(month: u32) -> Option<u8> {
    if (1..=12).contains(&month) {
        Some(((month - 1) / 3 + 1) as u8)
    } else {
        None
    }
}

/// Parse `YYYY-MM[-...]` into (year, quarter)
pub fn parse_period(date: &str) -> Option<(i32, u8)> {
    let mut parts = date.trim().split('-');
    let year = parts.next()?.trim().parse::<i32>().ok()?;
    let month = parts.next()?.trim().parse::<u32>().ok()?;
    Some((year, quarter_of(month)?))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RowValidator {
    pub sign_policy: SignPolicy,
}

impl RowValidator {
    pub fn new(sign_policy: SignPolicy) -> Self {
        RowValidator { sign_policy }
    }

    pub fn validate(&self, line: &RawExpenseLine, index: &RegistryIndex) -> Option<ValidatedExpenseRecord> {
        self.check(line, index).ok()
    }

    /// Same as `validate`, but reports which step rejected the row
    pub fn check(&self, line: &RawExpenseLine, index: &RegistryIndex) -> Result<ValidatedExpenseRecord, Rejection> {
        let amount = parse_source_amount(&line.closing_balance).ok_or(Rejection::UnparseableAmount)?;
        if !self.sign_policy.accepts(amount) {
            return Err(Rejection::NonPositiveAmount);
        }

        let registry_id = normalize_registry_id(&line.registry_id);
        let operator = index
            .lookup(&registry_id)
            .ok_or(Rejection::UnknownRegistryId)?;

        let tax_id = normalize_tax_id(&operator.tax_id);
        if !is_valid_cnpj(&tax_id) {
            return Err(Rejection::InvalidTaxId);
        }

        let (year, quarter) = parse_period(&line.date).ok_or(Rejection::UnparseableDate)?;

        Ok(ValidatedExpenseRecord {
            tax_id,
            legal_name: operator.legal_name.clone(),
            quarter,
            year,
            amount,
            registry_id: operator.registry_id.clone(),
            modality: operator.modality.clone(),
            state: operator.state.clone(),
        })
    }
}

/// Validate with the default policy (strictly positive amounts)
pub fn validate(line: &RawExpenseLine, index: &RegistryIndex) -> Option<ValidatedExpenseRecord> {
    RowValidator::default().validate(line, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OperatorRecord;

    fn acme_index() -> RegistryIndex {
        RegistryIndex::from_records(vec![
            OperatorRecord::new("000001", "11444777000161", "Acme Saude", "Medicina de Grupo", "SP"),
            OperatorRecord::new("000002", "11444777000162", "Bad Tax Id", "Cooperativa", "RJ"),
        ])
    }

    fn line(date: &str, registry_id: &str, balance: &str) -> RawExpenseLine {
        RawExpenseLine::from_fields(&[date, registry_id, "41", "Despesas com Eventos / Sinistros", "0", balance])
    }

    #[test]
    fn test_accepts_and_normalizes() {
        let record = validate(&line("2025-02", "1", "1500,00"), &acme_index()).expect("row should validate");

        assert_eq!(record.tax_id, "11444777000161");
        assert_eq!(record.legal_name, "Acme Saude");
        assert_eq!(record.quarter, 1);
        assert_eq!(record.year, 2025);
        assert_eq!(record.amount, 1500.0);
        assert_eq!(record.registry_id, "000001");
        assert_eq!(record.modality, "Medicina de Grupo");
        assert_eq!(record.state, "SP");
    }

    #[test]
    fn test_sign_filter_has_no_gap_at_zero() {
        let index = acme_index();
        let v = RowValidator::default();

        for balance in ["0", "0,00", "-0,01", "-1500,00"] {
            assert_eq!(
                v.check(&line("2025-02", "1", balance), &index),
                Err(Rejection::NonPositiveAmount),
                "balance {} should be rejected",
                balance
            );
        }
        assert!(v.check(&line("2025-02", "1", "0,01"), &index).is_ok());
    }

    #[test]
    fn test_non_negative_policy_keeps_zero() {
        let v = RowValidator::new(SignPolicy::NonNegative);
        let record = v.validate(&line("2025-02", "1", "0,00"), &acme_index()).unwrap();
        assert_eq!(record.amount, 0.0);

        let negative_zero = v.validate(&line("2025-02", "1", "-0,00"), &acme_index()).unwrap();
        assert!(negative_zero.amount.is_sign_positive());
    }

    #[test]
    fn test_dot_in_balance_groups_thousands() {
        let record = validate(&line("2025-02", "1", "1.500"), &acme_index()).unwrap();
        assert_eq!(record.amount, 1500.0);
    }

    #[test]
    fn test_rejection_causes() {
        let index = acme_index();
        let v = RowValidator::default();

        assert_eq!(v.check(&line("2025-02", "1", "abc"), &index), Err(Rejection::UnparseableAmount));
        assert_eq!(v.check(&line("2025-02", "999999", "10,00"), &index), Err(Rejection::UnknownRegistryId));
        assert_eq!(v.check(&line("2025-02", "2", "10,00"), &index), Err(Rejection::InvalidTaxId));
        assert_eq!(v.check(&line("2025", "1", "10,00"), &index), Err(Rejection::UnparseableDate));
        assert_eq!(v.check(&line("01/02/2025", "1", "10,00"), &index), Err(Rejection::UnparseableDate));
    }

    #[test]
    fn test_unknown_registry_rejected_even_when_amount_and_date_valid() {
        let index = acme_index();
        assert!(validate(&line("2025-05-01", "000003", "99,90"), &index).is_none());
    }

    #[test]
    fn test_quarter_derivation() {
        let expected = [1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4];
        for (month, quarter) in (1..=12).zip(expected) {
            assert_eq!(quarter_of(month), Some(quarter), "month {}", month);
        }
        assert_eq!(quarter_of(0), None);
        assert_eq!(quarter_of(13), None);
    }

    #[test]
    fn test_parse_period_variants() {
        assert_eq!(parse_period("2025-10"), Some((2025, 4)));
        assert_eq!(parse_period("2024-04-01"), Some((2024, 2)));
        assert_eq!(parse_period("2024-13-01"), None);
        assert_eq!(parse_period("2024-00"), None);
        assert_eq!(parse_period("2024-ab"), None);
        assert_eq!(parse_period("abcd-01"), None);
    }
}
