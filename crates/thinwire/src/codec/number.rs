//! NUMBER encoding: packed base-100 digits with an exponent byte.
//!
//! Layout:
//! - zero is the single byte `0x80`
//! - positive: exponent byte `0xC1 + e`, then each digit `d` as `d + 1`
//! - negative: exponent byte `62 - e`, then each digit as `101 - d`, followed
//!   by a `102` terminator when fewer than 20 digits are present
//!
//! where the value is `Σ dᵢ · 100^(e - i)`. The format holds at most 20
//! base-100 digits and exponents in `-65..=62`, and is byte-order comparable.

use bigdecimal::BigDecimal;
use num_bigint::{BigInt, Sign};
use num_traits::Zero;

use crate::error::{Error, Result};

const ZERO: u8 = 0x80;
const POSITIVE_BIAS: i32 = 0xC1;
const NEGATIVE_BIAS: i32 = 62;
const NEGATIVE_TERMINATOR: u8 = 102;

/// Largest number of base-100 digits in a NUMBER.
pub const MAX_DIGITS: usize = 20;

/// Smallest base-100 exponent.
pub const MIN_EXPONENT: i32 = -65;

/// Largest base-100 exponent.
pub const MAX_EXPONENT: i32 = 62;

/// Encode a decimal into its wire form.
pub fn encode(value: &BigDecimal) -> Result<Vec<u8>> {
    let (mantissa, scale) = value.as_bigint_and_exponent();
    if mantissa.is_zero() {
        return Ok(vec![ZERO]);
    }

    let mut decimal: Vec<u8> = mantissa
        .magnitude()
        .to_string()
        .bytes()
        .map(|b| b - b'0')
        .collect();
    // Digits before the decimal point; may be negative or exceed the digit count.
    let mut point = decimal.len() as i64 - scale;
    if point.rem_euclid(2) == 1 {
        decimal.insert(0, 0);
        point += 1;
    }
    if decimal.len() % 2 == 1 {
        decimal.push(0);
    }

    let mut digits: Vec<u8> = decimal.chunks(2).map(|p| p[0] * 10 + p[1]).collect();
    let mut exponent = point / 2 - 1;
    let leading = digits.iter().take_while(|d| **d == 0).count();
    digits.drain(..leading);
    exponent -= leading as i64;
    while digits.last() == Some(&0) {
        digits.pop();
    }

    if digits.len() > MAX_DIGITS {
        return Err(Error::unsupported_type(format!(
            "NUMBER {value} needs {} base-100 digits, at most {MAX_DIGITS} are supported",
            digits.len()
        )));
    }
    let exponent = i32::try_from(exponent)
        .ok()
        .filter(|e| (MIN_EXPONENT..=MAX_EXPONENT).contains(e))
        .ok_or_else(|| Error::unsupported_type(format!("NUMBER {value} is out of range")))?;

    let mut out = Vec::with_capacity(digits.len() + 2);
    if mantissa.sign() == Sign::Minus {
        out.push((NEGATIVE_BIAS - exponent) as u8);
        out.extend(digits.iter().map(|d| 101 - d));
        if digits.len() < MAX_DIGITS {
            out.push(NEGATIVE_TERMINATOR);
        }
    } else {
        out.push((POSITIVE_BIAS + exponent) as u8);
        out.extend(digits.iter().map(|d| d + 1));
    }
    Ok(out)
}

/// Decode a wire NUMBER.
pub fn decode(bytes: &[u8]) -> Result<BigDecimal> {
    let (&head, body) = bytes
        .split_first()
        .ok_or_else(|| Error::protocol("empty NUMBER value"))?;
    if head == ZERO && body.is_empty() {
        return Ok(BigDecimal::zero());
    }

    let negative = head < ZERO;
    let (exponent, digits) = if negative {
        let body = body.strip_suffix(&[NEGATIVE_TERMINATOR]).unwrap_or(body);
        let digits = body
            .iter()
            .map(|b| 101u8.checked_sub(*b).filter(|d| *d < 100))
            .collect::<Option<Vec<_>>>();
        (NEGATIVE_BIAS - i32::from(head), digits)
    } else {
        let digits = body
            .iter()
            .map(|b| b.checked_sub(1).filter(|d| *d < 100))
            .collect::<Option<Vec<_>>>();
        (i32::from(head) - POSITIVE_BIAS, digits)
    };
    let digits = digits
        .filter(|d| !d.is_empty() && d.len() <= MAX_DIGITS)
        .ok_or_else(|| Error::protocol(format!("malformed NUMBER bytes {bytes:02X?}")))?;

    let mut mantissa = BigInt::zero();
    for digit in &digits {
        mantissa = mantissa * 100u32 + u32::from(*digit);
    }
    if negative {
        mantissa = -mantissa;
    }
    let scale = 2 * (digits.len() as i64 - 1 - i64::from(exponent));
    Ok(BigDecimal::new(mantissa, scale))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn round_trip(s: &str) {
        let value = dec(s);
        let encoded = encode(&value).unwrap();
        assert_eq!(decode(&encoded).unwrap(), value, "round trip of {s}");
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(&dec("0")).unwrap(), vec![0x80]);
        assert_eq!(encode(&dec("1")).unwrap(), vec![0xC1, 2]);
        assert_eq!(encode(&dec("100")).unwrap(), vec![0xC2, 2]);
        assert_eq!(encode(&dec("123")).unwrap(), vec![0xC2, 2, 24]);
        assert_eq!(encode(&dec("0.5")).unwrap(), vec![0xC0, 51]);
        assert_eq!(encode(&dec("-1")).unwrap(), vec![0x3E, 100, 102]);
        assert_eq!(encode(&dec("-123")).unwrap(), vec![0x3D, 100, 78, 102]);
    }

    #[test]
    fn test_round_trips() {
        for s in [
            "1",
            "-1",
            "7",
            "42",
            "100",
            "5000",
            "0.05",
            "0.0005",
            "-0.5",
            "3.14159265358979323846",
            "123456789012345678901234567890123456789",
            "-99999999999999999999999999999999999999",
            "1E-130",
            "9.999999999999999999999999999999999999999E+125",
            "-1E+125",
        ] {
            round_trip(s);
        }
    }

    #[test]
    fn test_scale_is_not_significant() {
        assert_eq!(encode(&dec("1.500")).unwrap(), encode(&dec("1.5")).unwrap());
    }

    #[test]
    fn test_out_of_range() {
        assert!(encode(&dec("1E+126")).unwrap_err().is_unsupported_type());
        assert!(encode(&dec("1E-131")).unwrap_err().is_unsupported_type());
        let too_precise = dec("1234567890123456789012345678901234567890.1");
        assert!(encode(&too_precise).unwrap_err().is_unsupported_type());
    }

    #[test]
    fn test_ordering_is_preserved() {
        let values = ["-1000", "-2.5", "-1", "0", "0.001", "1", "1.5", "99", "100"];
        let encoded: Vec<Vec<u8>> = values.iter().map(|s| encode(&dec(s)).unwrap()).collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1], "{:?} should sort before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_malformed_input() {
        assert!(decode(&[]).unwrap_err().is_protocol());
        assert!(decode(&[0xC1]).unwrap_err().is_protocol());
        assert!(decode(&[0xC1, 0]).unwrap_err().is_protocol());
        assert!(decode(&[0xC1, 120]).unwrap_err().is_protocol());
    }
}
