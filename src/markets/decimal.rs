//! Venue payloads quote prices as decimal numbers ("0.535", 0.535, "1e-3").
//! They are converted to micro-units from their textual form, never via f64.

use serde_json::Value;

use crate::fund::money::MICROS;

/// Parse a non-negative decimal into micro-units, truncating past 6 places.
pub fn parse_decimal_micros(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (mantissa, exponent) = match raw.find(['e', 'E']) {
        Some(idx) => (&raw[..idx], raw[idx + 1..].parse::<i32>().ok()?),
        None => (raw, 0),
    };
    let mantissa = mantissa.strip_prefix('+').unwrap_or(mantissa);
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    // digits * 10^(exponent - frac_len) * 10^6
    let digits = format!("{int_part}{frac_part}");
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Some(0);
    }
    let frac_len = i64::try_from(frac_part.len()).ok()?;
    let shift = i64::from(exponent) - frac_len + 6;
    if shift >= 0 {
        let base: u128 = digits.parse().ok()?;
        let scaled = base.checked_mul(10u128.checked_pow(u32::try_from(shift).ok()?)?)?;
        u64::try_from(scaled).ok()
    } else {
        let cut = usize::try_from(-shift).ok()?;
        if cut >= digits.len() {
            return Some(0);
        }
        digits[..digits.len() - cut].parse::<u64>().ok()
    }
}

/// Accepts JSON strings and numbers.
pub fn value_to_micros(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => parse_decimal_micros(s),
        Value::Number(n) => parse_decimal_micros(&n.to_string()),
        _ => None,
    }
}

/// Complement of a binary outcome price.
pub fn complement(price: u64) -> Option<u64> {
    MICROS.checked_sub(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_decimals() {
        assert_eq!(parse_decimal_micros("0.535"), Some(535_000));
        assert_eq!(parse_decimal_micros("1"), Some(1_000_000));
        assert_eq!(parse_decimal_micros(".5"), Some(500_000));
        assert_eq!(parse_decimal_micros("12.3456789"), Some(12_345_678));
        assert_eq!(parse_decimal_micros("0"), Some(0));
    }

    #[test]
    fn parses_exponents() {
        assert_eq!(parse_decimal_micros("1e-3"), Some(1_000));
        assert_eq!(parse_decimal_micros("2.5E2"), Some(250_000_000));
        assert_eq!(parse_decimal_micros("1e-9"), Some(0));
    }

    #[test]
    fn extreme_exponents_do_not_overflow() {
        assert_eq!(parse_decimal_micros("1e2147483647"), None);
        assert_eq!(parse_decimal_micros("1.5e-2147483648"), Some(0));
        assert_eq!(parse_decimal_micros("0e2147483647"), Some(0));
        assert_eq!(parse_decimal_micros("1e2147483648"), None);
        assert_eq!(parse_decimal_micros("1e13"), Some(10_000_000_000_000_000_000));
        assert_eq!(parse_decimal_micros("1e14"), None);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_decimal_micros("-0.5"), None);
        assert_eq!(parse_decimal_micros("abc"), None);
        assert_eq!(parse_decimal_micros(""), None);
        assert_eq!(parse_decimal_micros("."), None);
    }

    #[test]
    fn json_values() {
        assert_eq!(value_to_micros(&json!(0.25)), Some(250_000));
        assert_eq!(value_to_micros(&json!("0.75")), Some(750_000));
        assert_eq!(value_to_micros(&json!(null)), None);
        assert_eq!(complement(250_000), Some(750_000));
    }
}
