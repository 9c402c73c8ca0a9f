//! Native-amount and rate parsing.
//!
//! Amounts travel through ops and effects as decimal strings of native units
//! (the smallest denomination of a currency). Rates are arbitrary decimals.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::{ActionQueueError, Result};

/// Upper limit for a single native amount (1e27 units). Anything larger
/// leaves no room for balance arithmetic inside `Decimal`'s range.
const MAX_NATIVE_UNITS: i128 = 1_000_000_000_000_000_000_000_000_000;

pub fn max_native() -> Decimal {
    Decimal::from_i128_with_scale(MAX_NATIVE_UNITS, 0)
}

/// Parse a strictly positive integer native amount no larger than
/// [`max_native`].
pub fn parse_native(s: &str) -> Result<Decimal> {
    let d = Decimal::from_str(s.trim()).map_err(|_| ActionQueueError::InvalidAmount(s.into()))?;
    if !d.fract().is_zero() || d <= Decimal::ZERO || d > max_native() {
        return Err(ActionQueueError::InvalidAmount(s.into()));
    }
    Ok(d)
}

pub fn checked_add(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| ActionQueueError::InvalidAmount(format!("{a} + {b}")))
}

pub fn checked_sub(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_sub(b)
        .ok_or_else(|| ActionQueueError::InvalidAmount(format!("{a} - {b}")))
}

pub fn checked_mul(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_mul(b)
        .ok_or_else(|| ActionQueueError::InvalidAmount(format!("{a} * {b}")))
}

/// Parse a bound (amount or rate) as written in an effect.
pub fn parse_bound(s: &str) -> Result<Decimal> {
    Decimal::from_str(s.trim()).map_err(|_| ActionQueueError::InvalidAmount(s.into()))
}

/// Render a decimal without trailing zeros, as stored in effects.
pub fn to_native_string(d: Decimal) -> String {
    d.normalize().to_string()
}

/// `true` if `value` lies strictly between the present bounds.
///
/// An absent bound leaves that side unconstrained. With no bounds at all
/// the condition can never hold.
pub fn within_bounds(value: Decimal, above: Option<Decimal>, below: Option<Decimal>) -> bool {
    if above.is_none() && below.is_none() {
        return false;
    }
    above.map_or(true, |a| value > a) && below.map_or(true, |b| value < b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn parse_native_accepts_integers() {
        assert_eq!(parse_native("1000").unwrap(), dec("1000"));
        assert_eq!(parse_native(" 42 ").unwrap(), dec("42"));
    }

    #[test]
    fn parse_native_rejects_fractions_zero_and_garbage() {
        assert!(parse_native("1.5").is_err());
        assert!(parse_native("0").is_err());
        assert!(parse_native("-3").is_err());
        assert!(parse_native("ten").is_err());
    }

    #[test]
    fn parse_native_rejects_amounts_without_headroom() {
        assert!(parse_native("1000000000000000000000000000").is_ok());
        assert!(parse_native("1000000000000000000000000001").is_err());
        let err = parse_native("79228162514264337593543950335").unwrap_err();
        assert_eq!(err.kind(), "invalid_amount");
    }

    #[test]
    fn checked_arithmetic_reports_overflow() {
        assert_eq!(checked_add(dec("2"), dec("3")).unwrap(), dec("5"));
        assert_eq!(
            checked_add(Decimal::MAX, Decimal::ONE).unwrap_err().kind(),
            "invalid_amount"
        );
        assert!(checked_sub(Decimal::MIN, Decimal::ONE).is_err());
        assert!(checked_mul(Decimal::MAX, dec("2")).is_err());
    }

    #[test]
    fn bounds_are_strict() {
        assert!(!within_bounds(dec("999"), Some(dec("1000")), None));
        assert!(!within_bounds(dec("1000"), Some(dec("1000")), None));
        assert!(within_bounds(dec("1001"), Some(dec("1000")), None));
        assert!(within_bounds(dec("5"), None, Some(dec("6"))));
        assert!(!within_bounds(dec("6"), None, Some(dec("6"))));
    }

    #[test]
    fn both_bounds_must_hold() {
        assert!(within_bounds(dec("5"), Some(dec("1")), Some(dec("10"))));
        assert!(!within_bounds(dec("11"), Some(dec("1")), Some(dec("10"))));
    }

    #[test]
    fn no_bounds_never_holds() {
        assert!(!within_bounds(dec("5"), None, None));
    }

    #[test]
    fn native_string_drops_trailing_zeros() {
        assert_eq!(to_native_string(dec("1000.000")), "1000");
    }
}
