// 🔢 Identifier Normalization
// Digit padding for registry ids / tax ids and the CNPJ check-digit algorithm

pub const REGISTRY_ID_WIDTH: usize = 6;
pub const TAX_ID_WIDTH: usize = 14;

const FIRST_WEIGHTS: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
const SECOND_WEIGHTS: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

pub fn strip_non_digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Strip non-digits, then left-pad with zeros to `width`.
///
/// Longer values are returned unpadded and untruncated.
pub fn pad_digits(value: &str, width: usize) -> String {
    let digits = strip_non_digits(value);
    format!("{:0>width$}", digits, width = width)
}

pub fn normalize_registry_id(value: &str) -> String {
    pad_digits(value, REGISTRY_ID_WIDTH)
}

pub fn normalize_tax_id(value: &str) -> String {
    pad_digits(value, TAX_ID_WIDTH)
}

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    match sum % 11 {
        0 | 1 => 0,
        r => 11 - r,
    }
}

/// Validate a 14-digit CNPJ against its two check digits.
///
/// Input must already be exactly 14 ASCII digits; repeated-digit sequences
/// (e.g. `00000000000000`) are rejected.
pub fn is_valid_cnpj(tax_id: &str) -> bool {
    if tax_id.len() != TAX_ID_WIDTH || !tax_id.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    let digits: Vec<u32> = tax_id.chars().filter_map(|c| c.to_digit(10)).collect();

    if digits.iter().all(|&d| d == digits[0]) {
        return false;
    }

    let first = check_digit(&digits[..12], &FIRST_WEIGHTS);
    if digits[12] != first {
        return false;
    }

    let second = check_digit(&digits[..13], &SECOND_WEIGHTS);
    digits[13] == second
}
