//! Best-effort conversion of free-text amounts ("USD 50,000", "CLP 1.000.000") into numbers.
//!
//! Separator convention: when the numeric token contains a comma, commas group thousands
//! and `.` is the decimal point. Without commas, dots group thousands only when every
//! group after the first has exactly three digits (`1.000.000`, `500.000`); otherwise a
//! single dot is a decimal point (`12.5`).

use thiserror::Error;

use crate::NOT_AVAILABLE;

const CURRENCY_SYMBOLS: [&str; 4] = ["US$", "CLP$", "$", "€"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount is not available")]
    NotAvailable,
    #[error("not a number: {0:?}")]
    NotNumeric(String),
}

/// Parses an amount for sorting. Never fails: anything unparseable is `0.0`.
pub fn parse_amount(text: &str) -> f64 {
    try_parse_amount(text).unwrap_or(0.0)
}

pub fn try_parse_amount(text: &str) -> Result<f64, AmountError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Empty);
    }
    if trimmed.eq_ignore_ascii_case(NOT_AVAILABLE) {
        return Err(AmountError::NotAvailable);
    }

    // "<CURRENCY> <NUMBER>" shape: the number is the last token.
    let token = trimmed.split_whitespace().last().unwrap_or(trimmed);
    let token = CURRENCY_SYMBOLS
        .iter()
        .find_map(|symbol| token.strip_prefix(symbol))
        .unwrap_or(token);

    let canonical = canonical_number(token);
    canonical
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AmountError::NotNumeric(token.to_string()))
}

fn canonical_number(token: &str) -> String {
    if token.contains(',') {
        return token.replace(',', "");
    }
    let mut groups = token.split('.');
    let head = groups.next().unwrap_or_default();
    let tail: Vec<&str> = groups.collect();
    let dotted_thousands = !tail.is_empty()
        && !head.is_empty()
        && tail
            .iter()
            .all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()));
    if dotted_thousands {
        token.replace('.', "")
    } else {
        token.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_prefixed_amounts() {
        assert_eq!(parse_amount("USD 1,234"), 1234.0);
        assert_eq!(parse_amount("USD 50,000"), 50_000.0);
        assert_eq!(parse_amount("CLP 500000"), 500_000.0);
        assert_eq!(parse_amount("CLP 1.000.000"), 1_000_000.0);
    }

    #[test]
    fn empty_and_sentinel_are_zero() {
        assert_eq!(parse_amount(""), 0.0);
        assert_eq!(parse_amount("   "), 0.0);
        assert_eq!(parse_amount("N/A"), 0.0);
        assert_eq!(try_parse_amount("n/a"), Err(AmountError::NotAvailable));
    }

    #[test]
    fn decimal_and_thousands_conventions() {
        assert_eq!(parse_amount("1,000,000.50"), 1_000_000.5);
        assert_eq!(parse_amount("12.5"), 12.5);
        assert_eq!(parse_amount("1.500"), 1500.0);
        assert_eq!(parse_amount("$1.000.000"), 1_000_000.0);
        assert_eq!(parse_amount("Hasta US$ 20,000"), 20_000.0);
    }

    #[test]
    fn non_numeric_degrades_to_zero() {
        assert_eq!(parse_amount("Variable"), 0.0);
        assert_eq!(parse_amount("USD abc"), 0.0);
        assert!(matches!(
            try_parse_amount("Según proyecto"),
            Err(AmountError::NotNumeric(_))
        ));
    }
}
