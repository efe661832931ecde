//! Fixed-point helpers.
//!
//! Every USDC amount, share quantity and price in this crate is a `u64` scaled
//! by 10^6 (micro-USDC / micro-shares). Intermediate products are widened to
//! `u128` and every division truncates toward zero.

use super::error::{FundError, FundResult};

/// 10^6: one whole USDC or one whole share.
pub const MICROS: u64 = 1_000_000;

/// Share price of a freshly created fund (1.00 USDC).
pub const INITIAL_SHARE_PRICE: u64 = MICROS;

pub const BPS_DENOMINATOR: u64 = 10_000;

/// Largest id or amount SQLite can hold (`INTEGER` is a signed 64-bit value).
pub const MAX_STORABLE: u64 = i64::MAX as u64;

fn out_of_range(value: impl std::fmt::Display) -> FundError {
    FundError::Validation(format!("{value} exceeds the maximum of {MAX_STORABLE}"))
}

/// Accepts `value` only if it fits a stored column.
pub fn storable(value: u64) -> FundResult<u64> {
    if value > MAX_STORABLE {
        return Err(out_of_range(value));
    }
    Ok(value)
}

fn narrow(value: u128) -> FundResult<u64> {
    if value > MAX_STORABLE as u128 {
        return Err(out_of_range(value));
    }
    Ok(value as u64)
}

/// `floor(value * bps / 10_000)`
pub fn bps_of(value: u64, bps: u16) -> FundResult<u64> {
    narrow((value as u128) * (bps as u128) / (BPS_DENOMINATOR as u128))
}

/// Micro-shares bought by `usdc` micro-USDC at `share_price` micro-USDC per share.
pub fn usdc_to_shares(usdc: u64, share_price: u64) -> FundResult<u64> {
    if share_price == 0 {
        return Err(FundError::Validation("share price is zero".to_string()));
    }
    narrow((usdc as u128) * (MICROS as u128) / (share_price as u128))
}

/// Micro-USDC worth of `shares` micro-shares at `share_price`.
pub fn shares_to_usdc(shares: u64, share_price: u64) -> FundResult<u64> {
    narrow((shares as u128) * (share_price as u128) / (MICROS as u128))
}

/// `nav / total_shares` in micro-USDC per share, or `fallback` with no shares outstanding.
pub fn share_price_of(nav: u64, total_shares: u64, fallback: u64) -> FundResult<u64> {
    if total_shares == 0 {
        return Ok(fallback);
    }
    narrow((nav as u128) * (MICROS as u128) / (total_shares as u128))
}

pub fn checked_add(a: u64, b: u64) -> FundResult<u64> {
    narrow(a as u128 + b as u128)
}

/// Parse a decimal string of micro-units (`"10000000"`), up to [`MAX_STORABLE`].
pub fn parse_micros(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u64>().ok().filter(|v| *v <= MAX_STORABLE)
}

/// Serde adapters that put `u64` micro-amounts on the wire as decimal strings
/// and accept either strings or JSON integers on the way in. Floats are rejected.
pub mod decimal_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Int(v) if v <= super::MAX_STORABLE => Ok(v),
            Raw::Int(v) => Err(de::Error::custom(format!(
                "{v} exceeds the maximum of {}",
                super::MAX_STORABLE
            ))),
            Raw::Str(s) => super::parse_micros(&s).ok_or_else(|| {
                de::Error::custom(format!(
                    "expected integer micro-units up to {}, got {s:?}",
                    super::MAX_STORABLE
                ))
            }),
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => s.serialize_str(&v.to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            #[derive(Deserialize)]
            struct Wrap(#[serde(with = "super")] u64);
            Ok(Option::<Wrap>::deserialize(d)?.map(|Wrap(v)| v))
        }
    }
}

/// Signed variant for PnL figures.
pub mod signed_decimal_str {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &i128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bps_truncates() {
        assert_eq!(bps_of(10_000 * MICROS, 100).unwrap(), 100 * MICROS);
        // 0.000199 USDC at 50 bps -> 0.000000995, floored to 0
        assert_eq!(bps_of(199, 50).unwrap(), 0);
        assert_eq!(bps_of(MAX_STORABLE, 10_000).unwrap(), MAX_STORABLE);
    }

    #[test]
    fn results_stay_within_the_storable_range() {
        assert!(matches!(
            shares_to_usdc(MAX_STORABLE, 2 * MICROS),
            Err(FundError::Validation(_))
        ));
        assert_eq!(checked_add(MAX_STORABLE - 1, 1).unwrap(), MAX_STORABLE);
        assert!(matches!(checked_add(MAX_STORABLE, 1), Err(FundError::Validation(_))));
        assert!(checked_add(u64::MAX, u64::MAX).is_err());
        assert_eq!(storable(MAX_STORABLE).unwrap(), MAX_STORABLE);
        assert!(storable(MAX_STORABLE + 1).is_err());
    }

    #[test]
    fn share_conversions_at_non_unit_price() {
        let price = 1_230_000;
        assert_eq!(shares_to_usdc(1_000 * MICROS, price).unwrap(), 1_230 * MICROS);
        assert_eq!(usdc_to_shares(1_230 * MICROS, price).unwrap(), 1_000 * MICROS);
        // 1 micro-USDC buys 0.81 micro-shares, truncated to zero
        assert_eq!(usdc_to_shares(1, price).unwrap(), 0);
        assert!(usdc_to_shares(1, 0).is_err());
    }

    #[test]
    fn share_price_falls_back_without_shares() {
        assert_eq!(share_price_of(0, 0, 1_500_000).unwrap(), 1_500_000);
        assert_eq!(share_price_of(123 * MICROS, 100 * MICROS, 0).unwrap(), 1_230_000);
    }

    #[test]
    fn parse_micros_rejects_non_digits() {
        assert_eq!(parse_micros(" 42 "), Some(42));
        assert_eq!(parse_micros("1.5"), None);
        assert_eq!(parse_micros("-3"), None);
        assert_eq!(parse_micros("9223372036854775807"), Some(MAX_STORABLE));
        assert_eq!(parse_micros("9223372036854775808"), None);
        assert_eq!(parse_micros(""), None);
    }

    #[test]
    fn decimal_str_accepts_strings_and_ints() {
        #[derive(serde::Deserialize, serde::Serialize)]
        struct Amount {
            #[serde(with = "decimal_str")]
            v: u64,
        }

        let a: Amount = serde_json::from_str(r#"{"v":"9223372036854775807"}"#).unwrap();
        assert_eq!(a.v, MAX_STORABLE);
        assert!(serde_json::from_str::<Amount>(r#"{"v":"9223372036854775808"}"#).is_err());
        assert!(serde_json::from_str::<Amount>(r#"{"v":9223372036854775808}"#).is_err());
        let b: Amount = serde_json::from_str(r#"{"v":12}"#).unwrap();
        assert_eq!(b.v, 12);
        assert!(serde_json::from_str::<Amount>(r#"{"v":1.5}"#).is_err());
        assert_eq!(serde_json::to_string(&b).unwrap(), r#"{"v":"12"}"#);
    }
}
