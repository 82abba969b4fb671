use rust_decimal::Decimal;
use std::str::FromStr;

/// Significant digits a `Decimal` mantissa can always hold.
const MAX_DIGITS: usize = 28;

// Raw on-chain amounts are integer strings in base units; prices are computed on
// decimal-normalized values.
pub fn normalize_amount(raw: &str, decimals: u32) -> Result<Decimal, ConversionError> {
    let trimmed = raw.trim();
    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let (int_digits, frac_digits) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };
    if int_digits.is_empty() && frac_digits.is_empty() {
        return Err(ConversionError::InvalidAmount(raw.to_string()));
    }
    if !int_digits.bytes().all(|b| b.is_ascii_digit()) || !frac_digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConversionError::InvalidAmount(raw.to_string()));
    }

    // Shift the decimal point `decimals` places to the left.
    let digits = format!("{}{}", int_digits, frac_digits);
    let point = int_digits.len() as i64 - decimals as i64;
    let (int_part, frac_part) = if point <= 0 {
        (String::new(), format!("{}{}", "0".repeat((-point) as usize), digits))
    } else {
        let point = point as usize;
        (digits[..point].to_string(), digits[point..].to_string())
    };

    let int_part = int_part.trim_start_matches('0');
    if int_part.len() > MAX_DIGITS {
        return Err(ConversionError::Overflow);
    }
    let keep = frac_part.len().min(MAX_DIGITS - int_part.len());
    let frac_part = frac_part[..keep].trim_end_matches('0');

    let text = match (int_part.is_empty(), frac_part.is_empty()) {
        (true, true) => "0".to_string(),
        (true, false) => format!("0.{}", frac_part),
        (false, true) => int_part.to_string(),
        (false, false) => format!("{}.{}", int_part, frac_part),
    };
    let value = Decimal::from_str(&text).map_err(|e| ConversionError::InvalidDecimal(e.to_string()))?;
    Ok(if negative { -value } else { value })
}

/// `|numerator / denominator|`
pub fn abs_ratio(numerator: Decimal, denominator: Decimal) -> Result<Decimal, ConversionError> {
    if denominator.is_zero() {
        return Err(ConversionError::DivisionByZero);
    }
    numerator
        .abs()
        .checked_div(denominator.abs())
        .ok_or(ConversionError::Overflow)
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Division by zero")]
    DivisionByZero,
}
