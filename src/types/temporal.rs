//! UUID, date/time and JSON support.
//!
//! PostgreSQL binary date/time values count from 2000-01-01: DATE in days,
//! TIME in microseconds since midnight, TIMESTAMP(TZ) in microseconds.

use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use uuid::Uuid;

use super::decode::fixed;
use super::{ArrayElement, Encode, FieldValue, Format, FromField, IsNull, Oid, TypeFamily};
use crate::error::{Error, Result};

/// Microseconds between 1970-01-01 and 2000-01-01.
const PG_EPOCH_OFFSET_USEC: i64 = 946_684_800_000_000;

/// `NaiveDate::num_days_from_ce` of 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const TIMESTAMPTZ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

fn out_of_range<T: ?Sized>() -> Error {
    Error::decode(format!("value out of range for {}", std::any::type_name::<T>()))
}

fn parse_text<T, F, E>(value: &FieldValue<'_>, parse: F) -> Result<T>
where
    F: FnOnce(&str) -> std::result::Result<T, E>,
    E: std::fmt::Display,
{
    let s = value.text::<T>()?;
    parse(s).map_err(|e| {
        Error::decode(format!(
            "invalid {} {:?}: {}",
            std::any::type_name::<T>(),
            s,
            e
        ))
    })
}

fn usec_to_utc<T: ?Sized>(usec: i64) -> Result<DateTime<Utc>> {
    let unix = usec
        .checked_add(PG_EPOCH_OFFSET_USEC)
        .ok_or_else(out_of_range::<T>)?;
    let secs = unix.div_euclid(1_000_000);
    let nanos = (unix.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or_else(out_of_range::<T>)
}

fn utc_to_usec(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_micros() - PG_EPOCH_OFFSET_USEC
}

// ============================================================================
// UUID
// ============================================================================

impl Encode for Uuid {
    const OID: Oid = Oid::UUID;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.extend_from_slice(self.as_bytes());
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        let _ = write!(buf, "{}", self.hyphenated());
        IsNull::No
    }
}

impl FromField for Uuid {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;
        value.expect_family::<Self>(&[TypeFamily::Uuid, TypeFamily::Text])?;
        match value.format {
            Format::Binary if value.oid.family() != TypeFamily::Text => {
                Ok(Uuid::from_bytes(fixed::<16, Self>(data)?))
            }
            _ => parse_text(&value, Uuid::parse_str),
        }
    }
}

// ============================================================================
// DATE
// ============================================================================

impl Encode for NaiveDate {
    const OID: Oid = Oid::DATE;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.put_i32(self.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE);
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        let _ = write!(buf, "{}", self.format(DATE_FORMAT));
        IsNull::No
    }
}

impl FromField for NaiveDate {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;
        value.expect_family::<Self>(&[TypeFamily::Date])?;
        match value.format {
            Format::Binary => {
                let days = i32::from_be_bytes(fixed::<4, Self>(data)?);
                days.checked_add(PG_EPOCH_DAYS_FROM_CE)
                    .and_then(NaiveDate::from_num_days_from_ce_opt)
                    .ok_or_else(out_of_range::<Self>)
            }
            Format::Text => parse_text(&value, |s| NaiveDate::parse_from_str(s, DATE_FORMAT)),
        }
    }
}

// ============================================================================
// TIME
// ============================================================================

impl Encode for NaiveTime {
    const OID: Oid = Oid::TIME;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        let usec = self.num_seconds_from_midnight() as i64 * 1_000_000
            + (self.nanosecond() / 1_000) as i64;
        buf.put_i64(usec);
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        let _ = write!(buf, "{}", self.format(TIME_FORMAT));
        IsNull::No
    }
}

impl FromField for NaiveTime {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;
        value.expect_family::<Self>(&[TypeFamily::Time])?;
        match value.format {
            // TIMETZ appends a 4-byte zone offset; the wall-clock part comes first
            Format::Binary if value.oid == Oid::TIMETZ => {
                if data.len() != 12 {
                    return Err(Error::decode(format!("invalid TIMETZ length {}", data.len())));
                }
                time_from_usec(i64::from_be_bytes(fixed::<8, Self>(&data[..8])?))
            }
            Format::Binary => time_from_usec(i64::from_be_bytes(fixed::<8, Self>(data)?)),
            Format::Text => {
                let s = value.text::<Self>()?;
                // Drop a TIMETZ offset suffix
                let wall = s.find(['+', '-']).map_or(s, |i| &s[..i]);
                NaiveTime::parse_from_str(wall, TIME_FORMAT)
                    .map_err(|e| Error::decode(format!("invalid time {:?}: {}", s, e)))
            }
        }
    }
}

fn time_from_usec(usec: i64) -> Result<NaiveTime> {
    if !(0..=86_400_000_000).contains(&usec) {
        return Err(out_of_range::<NaiveTime>());
    }
    let secs = (usec / 1_000_000) as u32;
    let nanos = ((usec % 1_000_000) * 1_000) as u32;
    // 24:00:00 is a valid PostgreSQL time but not a chrono one
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).ok_or_else(out_of_range::<NaiveTime>)
}

// ============================================================================
// TIMESTAMP / TIMESTAMPTZ
// ============================================================================

impl Encode for NaiveDateTime {
    const OID: Oid = Oid::TIMESTAMP;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.put_i64(utc_to_usec(&self.and_utc()));
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        let _ = write!(buf, "{}", self.format(TIMESTAMP_FORMAT));
        IsNull::No
    }
}

impl FromField for NaiveDateTime {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;
        value.expect_family::<Self>(&[TypeFamily::Timestamp])?;
        match value.format {
            Format::Binary => {
                usec_to_utc::<Self>(i64::from_be_bytes(fixed::<8, Self>(data)?)).map(|dt| dt.naive_utc())
            }
            Format::Text => {
                parse_text(&value, |s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT))
            }
        }
    }
}

impl Encode for DateTime<Utc> {
    const OID: Oid = Oid::TIMESTAMPTZ;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.put_i64(utc_to_usec(self));
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        let _ = write!(buf, "{}+00", self.format(TIMESTAMP_FORMAT));
        IsNull::No
    }
}

impl FromField for DateTime<Utc> {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;
        value.expect_family::<Self>(&[TypeFamily::Timestamp])?;
        match value.format {
            Format::Binary => usec_to_utc::<Self>(i64::from_be_bytes(fixed::<8, Self>(data)?)),
            Format::Text => {
                let s = value.text::<Self>()?;
                if let Ok(dt) = DateTime::parse_from_str(s, TIMESTAMPTZ_FORMAT) {
                    return Ok(dt.with_timezone(&Utc));
                }
                // Plain TIMESTAMP columns are taken as UTC
                NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
                    .map(|naive| naive.and_utc())
                    .map_err(|e| Error::decode(format!("invalid timestamp {:?}: {}", s, e)))
            }
        }
    }
}

// ============================================================================
// JSON / JSONB
// ============================================================================

const JSONB_VERSION: u8 = 1;

impl Encode for serde_json::Value {
    const OID: Oid = Oid::JSONB;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.put_u8(JSONB_VERSION);
        buf.extend_from_slice(self.to_string().as_bytes());
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        let _ = write!(buf, "{}", self);
        IsNull::No
    }
}

impl FromField for serde_json::Value {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;
        value.expect_family::<Self>(&[TypeFamily::Json, TypeFamily::Text])?;
        let json = match (value.format, value.oid) {
            (Format::Binary, Oid::JSONB) => match data.split_first() {
                Some((&JSONB_VERSION, rest)) => rest,
                _ => return Err(Error::decode("unsupported jsonb version")),
            },
            _ => data,
        };
        serde_json::from_slice(json).map_err(|e| Error::decode(format!("invalid JSON: {}", e)))
    }
}

impl ArrayElement for Uuid {}
impl ArrayElement for NaiveDate {}
impl ArrayElement for NaiveTime {}
impl ArrayElement for NaiveDateTime {}
impl ArrayElement for DateTime<Utc> {}
impl ArrayElement for serde_json::Value {}
