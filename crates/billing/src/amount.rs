//! Amount normalization
//!
//! The provider encodes amounts inconsistently: sometimes as major-unit
//! decimals (`19.99`, `"19.99"`), sometimes as minor-unit integers (`1999`,
//! `"1999"`). Magnitude decides which: anything below
//! [`MAJOR_UNIT_THRESHOLD`] is read as major units and scaled by 100,
//! anything at or above it is already in cents.
//!
//! The heuristic is ambiguous for real prices of 1000 major units or more,
//! and for sub-1000-cent charges sent as integers. Keep it as is; the
//! boundary is pinned by tests.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Values strictly below this are major currency units
pub const MAJOR_UNIT_THRESHOLD: i64 = 1000;

/// An amount as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Number(serde_json::Number),
    Text(String),
}

impl RawAmount {
    /// Normalize to integer minor units (cents)
    pub fn to_cents(&self) -> BillingResult<i64> {
        match self {
            RawAmount::Number(n) => {
                if let Some(i) = n.as_i64() {
                    integer_to_cents(i)
                } else if let Some(u) = n.as_u64() {
                    i64::try_from(u)
                        .map_err(|_| BillingError::InvalidAmount(format!("{u} is out of range")))
                        .and_then(integer_to_cents)
                } else {
                    let f = n
                        .as_f64()
                        .ok_or_else(|| BillingError::InvalidAmount(n.to_string()))?;
                    decimal_to_cents(f)
                }
            }
            RawAmount::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(BillingError::InvalidAmount("empty amount".to_string()));
                }
                if let Ok(i) = trimmed.parse::<i64>() {
                    return integer_to_cents(i);
                }
                let f = trimmed
                    .parse::<f64>()
                    .map_err(|_| BillingError::InvalidAmount(format!("'{trimmed}' is not a number")))?;
                decimal_to_cents(f)
            }
        }
    }
}

fn integer_to_cents(value: i64) -> BillingResult<i64> {
    if value < 0 {
        return Err(BillingError::InvalidAmount(format!(
            "{value} is negative"
        )));
    }
    if value < MAJOR_UNIT_THRESHOLD {
        Ok(value * 100)
    } else {
        Ok(value)
    }
}

fn decimal_to_cents(value: f64) -> BillingResult<i64> {
    if !value.is_finite() {
        return Err(BillingError::InvalidAmount(format!(
            "{value} is not finite"
        )));
    }
    if value < 0.0 {
        return Err(BillingError::InvalidAmount(format!(
            "{value} is negative"
        )));
    }

    let cents = if value < MAJOR_UNIT_THRESHOLD as f64 {
        (value * 100.0).round()
    } else {
        value.round()
    };

    if cents > i64::MAX as f64 {
        return Err(BillingError::InvalidAmount(format!(
            "{value} is out of range"
        )));
    }
    Ok(cents as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cents(value: serde_json::Value) -> BillingResult<i64> {
        serde_json::from_value::<RawAmount>(value).unwrap().to_cents()
    }

    #[test]
    fn test_reference_inputs() {
        assert_eq!(cents(json!("19.99")).unwrap(), 1999);
        assert_eq!(cents(json!(1999)).unwrap(), 1999);
        assert_eq!(cents(json!(19.99)).unwrap(), 1999);
        assert_eq!(cents(json!("1999")).unwrap(), 1999);
    }

    #[test]
    fn test_threshold_boundary() {
        // Exactly the threshold is already minor units
        assert_eq!(cents(json!(1000)).unwrap(), 1000);
        assert_eq!(cents(json!("1000")).unwrap(), 1000);
        assert_eq!(cents(json!(1000.0)).unwrap(), 1000);

        // One below is major units
        assert_eq!(cents(json!(999)).unwrap(), 99_900);
        assert_eq!(cents(json!("999")).unwrap(), 99_900);
        assert_eq!(cents(json!(999.99)).unwrap(), 99_999);
        assert_eq!(cents(json!("999.99")).unwrap(), 99_999);

        assert_eq!(cents(json!(1001)).unwrap(), 1001);
    }

    #[test]
    fn test_small_and_zero_amounts() {
        assert_eq!(cents(json!(0)).unwrap(), 0);
        assert_eq!(cents(json!("0.00")).unwrap(), 0);
        assert_eq!(cents(json!(5)).unwrap(), 500);
        assert_eq!(cents(json!("0.1")).unwrap(), 10);
    }

    #[test]
    fn test_float_noise_is_rounded() {
        // 4.35 * 100 is 434.99999999999994 in binary floating point
        assert_eq!(cents(json!(4.35)).unwrap(), 435);
        assert_eq!(cents(json!("29.90")).unwrap(), 2990);
    }

    #[test]
    fn test_large_minor_unit_values() {
        assert_eq!(cents(json!(150_000)).unwrap(), 150_000);
        assert_eq!(cents(json!("2500.4")).unwrap(), 2500);
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        assert_eq!(cents(json!(" 19.99 ")).unwrap(), 1999);
    }

    #[test]
    fn test_rejects_negative() {
        assert!(matches!(cents(json!(-1)), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(cents(json!("-19.99")), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(cents(json!(-0.5)), Err(BillingError::InvalidAmount(_))));
    }

    #[test]
    fn test_rejects_non_finite_and_garbage() {
        assert!(matches!(cents(json!("NaN")), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(cents(json!("inf")), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(cents(json!("")), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(cents(json!("12 USD")), Err(BillingError::InvalidAmount(_))));
    }

    #[test]
    fn test_non_number_json_does_not_deserialize() {
        assert!(serde_json::from_value::<RawAmount>(json!(true)).is_err());
        assert!(serde_json::from_value::<RawAmount>(json!({"value": 1})).is_err());
    }
}
