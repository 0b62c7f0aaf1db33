//! DATE, TIMESTAMP and TIMESTAMP WITH TIME ZONE encodings.
//!
//! Base layout (7 bytes): `[century + 100, year % 100 + 100, month, day,
//! hour + 1, minute + 1, second + 1]`. TIMESTAMP appends nanoseconds as a
//! `u32`; TIMESTAMP WITH TIME ZONE stores the UTC instant followed by
//! `[offset hours + 20, offset minutes + 60]`.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{Error, Result};

pub const DATE_LEN: usize = 7;
pub const TIMESTAMP_LEN: usize = 11;
pub const TIMESTAMP_TZ_LEN: usize = 13;

const TZ_HOUR_BIAS: i32 = 20;
const TZ_MINUTE_BIAS: i32 = 60;

fn encode_base(value: &NaiveDateTime, out: &mut Vec<u8>) -> Result<()> {
    let year = value.year();
    if !(1..=9999).contains(&year) {
        return Err(Error::unsupported_type(format!(
            "year {year} is outside the supported range 1..=9999"
        )));
    }
    out.extend_from_slice(&[
        (year / 100 + 100) as u8,
        (year % 100 + 100) as u8,
        value.month() as u8,
        value.day() as u8,
        value.hour() as u8 + 1,
        value.minute() as u8 + 1,
        value.second() as u8 + 1,
    ]);
    Ok(())
}

fn nanos(value: &NaiveDateTime) -> Result<u32> {
    let nanos = value.nanosecond();
    if nanos >= 1_000_000_000 {
        return Err(Error::unsupported_type("leap seconds are not representable"));
    }
    Ok(nanos)
}

fn decode_base(bytes: &[u8], nanos: u32) -> Result<NaiveDateTime> {
    let field = |i: usize, bias: i32| i32::from(bytes[i]) - bias;
    let year = field(0, 100) * 100 + field(1, 100);
    let invalid = || Error::protocol(format!("invalid date/time bytes {bytes:02X?}"));

    let date = NaiveDate::from_ymd_opt(year, u32::from(bytes[2]), u32::from(bytes[3]))
        .ok_or_else(invalid)?;
    let (hour, minute, second) = (field(4, 1), field(5, 1), field(6, 1));
    if hour < 0 || minute < 0 || second < 0 {
        return Err(invalid());
    }
    date.and_hms_nano_opt(hour as u32, minute as u32, second as u32, nanos)
        .ok_or_else(invalid)
}

/// Encode a DATE. Fractional seconds cannot be stored.
pub fn encode_date(value: &NaiveDateTime) -> Result<Vec<u8>> {
    if nanos(value)? != 0 {
        return Err(Error::unsupported_type(
            "DATE cannot hold fractional seconds, bind a TIMESTAMP instead",
        ));
    }
    let mut out = Vec::with_capacity(DATE_LEN);
    encode_base(value, &mut out)?;
    Ok(out)
}

pub fn decode_date(bytes: &[u8]) -> Result<NaiveDateTime> {
    if bytes.len() != DATE_LEN {
        return Err(Error::protocol(format!(
            "DATE value has {} bytes, expected {DATE_LEN}",
            bytes.len()
        )));
    }
    decode_base(bytes, 0)
}

pub fn encode_timestamp(value: &NaiveDateTime) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(TIMESTAMP_LEN);
    encode_base(value, &mut out)?;
    out.extend_from_slice(&nanos(value)?.to_be_bytes());
    Ok(out)
}

/// Decode a TIMESTAMP. Servers omit the fraction when it is zero, so the
/// 7-byte form is accepted too.
pub fn decode_timestamp(bytes: &[u8]) -> Result<NaiveDateTime> {
    match bytes.len() {
        DATE_LEN => decode_base(bytes, 0),
        TIMESTAMP_LEN => {
            let nanos = u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
            decode_base(&bytes[..DATE_LEN], nanos)
        }
        other => Err(Error::protocol(format!(
            "TIMESTAMP value has {other} bytes, expected {DATE_LEN} or {TIMESTAMP_LEN}"
        ))),
    }
}

pub fn encode_timestamp_tz(value: &DateTime<FixedOffset>) -> Result<Vec<u8>> {
    let mut out = encode_timestamp(&value.naive_utc())?;
    let offset = value.offset().local_minus_utc();
    if offset % 60 != 0 {
        return Err(Error::unsupported_type(format!(
            "time zone offset {} has a seconds component",
            value.offset()
        )));
    }
    let hour = u8::try_from(offset / 3600 + TZ_HOUR_BIAS).map_err(|_| {
        Error::unsupported_type(format!(
            "time zone offset {} is outside the supported range",
            value.offset()
        ))
    })?;
    // |offset % 3600 / 60| < 60, so the biased minute is in 1..=119.
    let minute = (offset % 3600 / 60 + TZ_MINUTE_BIAS) as u8;
    out.push(hour);
    out.push(minute);
    Ok(out)
}

pub fn decode_timestamp_tz(bytes: &[u8]) -> Result<DateTime<FixedOffset>> {
    if bytes.len() != TIMESTAMP_TZ_LEN {
        return Err(Error::protocol(format!(
            "TIMESTAMP WITH TIME ZONE value has {} bytes, expected {TIMESTAMP_TZ_LEN}",
            bytes.len()
        )));
    }
    let utc = decode_timestamp(&bytes[..TIMESTAMP_LEN])?;
    let hours = i32::from(bytes[11]) - TZ_HOUR_BIAS;
    let minutes = i32::from(bytes[12]) - TZ_MINUTE_BIAS;
    let offset = FixedOffset::east_opt(hours * 3600 + minutes * 60)
        .ok_or_else(|| Error::protocol(format!("invalid time zone offset {hours}:{minutes}")))?;
    Ok(DateTime::from_naive_utc_and_offset(utc, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datetime(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, n: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_nano_opt(h, mi, s, n)
            .unwrap()
    }

    #[test]
    fn test_date_layout() {
        let value = datetime(2024, 2, 29, 13, 5, 59, 0);
        assert_eq!(
            encode_date(&value).unwrap(),
            vec![120, 124, 2, 29, 14, 6, 60]
        );
        assert_eq!(decode_date(&encode_date(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn test_date_rejects_fraction() {
        let value = datetime(2024, 1, 1, 0, 0, 0, 500);
        assert!(encode_date(&value).unwrap_err().is_unsupported_type());
    }

    #[test]
    fn test_timestamp_boundaries() {
        for value in [
            datetime(1, 1, 1, 0, 0, 0, 0),
            datetime(9999, 12, 31, 23, 59, 59, 999_999_999),
            datetime(1970, 1, 1, 0, 0, 0, 1),
        ] {
            let encoded = encode_timestamp(&value).unwrap();
            assert_eq!(encoded.len(), TIMESTAMP_LEN);
            assert_eq!(decode_timestamp(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_timestamp_short_form() {
        let value = datetime(2000, 6, 15, 8, 30, 0, 0);
        let date_form = encode_date(&value).unwrap();
        assert_eq!(decode_timestamp(&date_form).unwrap(), value);
    }

    #[test]
    fn test_year_out_of_range() {
        let value = datetime(10_000, 1, 1, 0, 0, 0, 0);
        assert!(encode_timestamp(&value).unwrap_err().is_unsupported_type());
    }

    #[test]
    fn test_timestamp_tz_round_trip() {
        for offset_secs in [0, 5 * 3600 + 30 * 60, -(9 * 3600 + 45 * 60), 14 * 3600] {
            let offset = FixedOffset::east_opt(offset_secs).unwrap();
            let value = DateTime::from_naive_utc_and_offset(
                datetime(2023, 3, 26, 1, 30, 0, 123_000_000),
                offset,
            );
            let encoded = encode_timestamp_tz(&value).unwrap();
            assert_eq!(encoded.len(), TIMESTAMP_TZ_LEN);
            let decoded = decode_timestamp_tz(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(decoded.offset(), value.offset());
        }

        let odd = DateTime::from_naive_utc_and_offset(
            datetime(2020, 1, 1, 6, 29, 15, 0),
            FixedOffset::east_opt(5 * 3600 + 30 * 60 + 45).unwrap(),
        );
        assert!(encode_timestamp_tz(&odd).unwrap_err().is_unsupported_type());

        let far_west = DateTime::from_naive_utc_and_offset(
            datetime(2020, 1, 1, 12, 0, 0, 0),
            FixedOffset::west_opt(22 * 3600).unwrap(),
        );
        assert!(encode_timestamp_tz(&far_west).unwrap_err().is_unsupported_type());
    }

    #[test]
    fn test_invalid_bytes() {
        assert!(decode_date(&[120, 124, 2, 30, 1, 1, 1]).unwrap_err().is_protocol());
        assert!(decode_date(&[120, 124, 2, 1, 0, 1, 1]).unwrap_err().is_protocol());
        assert!(decode_timestamp(&[1, 2, 3]).unwrap_err().is_protocol());
    }
}
