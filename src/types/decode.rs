//! Column decoders for the built-in Rust types.

use bytes::Bytes;

use super::{numeric, FieldValue, Format, FromField, Oid, TypeFamily};
use crate::error::{Error, Result};
use crate::result::Row;

/// Read exactly `N` bytes of a fixed-width binary value.
pub(crate) fn fixed<const N: usize, T: ?Sized>(data: &[u8]) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        Error::decode(format!(
            "invalid length {} for {}, expected {}",
            data.len(),
            std::any::type_name::<T>(),
            N
        ))
    })
}

impl<T: FromField> FromField for Option<T> {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_field(value).map(Some)
        }
    }
}

// ============================================================================
// Boolean
// ============================================================================

impl FromField for bool {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;
        value.expect_family::<Self>(&[TypeFamily::Bool])?;

        match value.format {
            Format::Binary => Ok(fixed::<1, Self>(data)?[0] != 0),
            Format::Text => match data {
                b"t" => Ok(true),
                b"f" => Ok(false),
                _ => Err(Error::decode(format!(
                    "invalid boolean: {:?}",
                    String::from_utf8_lossy(data)
                ))),
            },
        }
    }
}

// ============================================================================
// Integers
// ============================================================================

/// Integer text, allowing a NUMERIC-style all-zero fraction (`5.000`).
fn parse_integer<T: ?Sized>(s: &str) -> Result<i128> {
    let int = match s.split_once('.') {
        Some((int, frac)) if frac.bytes().all(|b| b == b'0') => int,
        Some(_) => {
            return Err(Error::decode(format!(
                "{:?} is not an integer value for {}",
                s,
                std::any::type_name::<T>()
            )))
        }
        None => s,
    };
    int.parse::<i128>().map_err(|e| {
        Error::decode(format!(
            "invalid integer {:?} for {}: {}",
            s,
            std::any::type_name::<T>(),
            e
        ))
    })
}

fn integer_value<T: ?Sized>(value: &FieldValue<'_>) -> Result<i128> {
    let data = value.bytes::<T>()?;
    value.expect_family::<T>(&[TypeFamily::Integer, TypeFamily::Numeric])?;

    match value.format {
        Format::Text => parse_integer::<T>(value.text::<T>()?),
        Format::Binary => match value.oid {
            Oid::INT2 => Ok(i16::from_be_bytes(fixed::<2, T>(data)?) as i128),
            Oid::INT4 => Ok(i32::from_be_bytes(fixed::<4, T>(data)?) as i128),
            Oid::OID => Ok(u32::from_be_bytes(fixed::<4, T>(data)?) as i128),
            Oid::INT8 => Ok(i64::from_be_bytes(fixed::<8, T>(data)?) as i128),
            Oid::NUMERIC => parse_integer::<T>(&numeric::to_decimal_string(data)?),
            // Untyped binary: infer the width from the length
            _ => match data.len() {
                2 => Ok(i16::from_be_bytes(fixed::<2, T>(data)?) as i128),
                4 => Ok(i32::from_be_bytes(fixed::<4, T>(data)?) as i128),
                8 => Ok(i64::from_be_bytes(fixed::<8, T>(data)?) as i128),
                n => Err(Error::decode(format!("invalid integer length {}", n))),
            },
        },
    }
}

macro_rules! integer_from_field {
    ($($t:ty),*) => {
        $(
            impl FromField for $t {
                fn from_field(value: FieldValue<'_>) -> Result<Self> {
                    let v = integer_value::<$t>(&value)?;
                    <$t>::try_from(v).map_err(|_| {
                        Error::decode(format!("value {} out of range for {}", v, stringify!($t)))
                    })
                }
            }
        )*
    };
}

integer_from_field!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromField for Oid {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        u32::from_field(value).map(Oid)
    }
}

// ============================================================================
// Floats
// ============================================================================

fn parse_float<T: ?Sized>(s: &str) -> Result<f64> {
    match s {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => s.parse::<f64>().map_err(|e| {
            Error::decode(format!(
                "invalid float {:?} for {}: {}",
                s,
                std::any::type_name::<T>(),
                e
            ))
        }),
    }
}

fn float_value<T: ?Sized>(value: &FieldValue<'_>) -> Result<f64> {
    let data = value.bytes::<T>()?;
    value.expect_family::<T>(&[TypeFamily::Float, TypeFamily::Integer, TypeFamily::Numeric])?;

    match value.format {
        Format::Text => parse_float::<T>(value.text::<T>()?),
        Format::Binary => match value.oid.family() {
            TypeFamily::Integer => Ok(integer_value::<T>(value)? as f64),
            TypeFamily::Numeric => parse_float::<T>(&numeric::to_decimal_string(data)?),
            _ => match (value.oid, data.len()) {
                (Oid::FLOAT4, _) | (Oid::INVALID | Oid::UNKNOWN, 4) => {
                    Ok(f32::from_be_bytes(fixed::<4, T>(data)?) as f64)
                }
                _ => Ok(f64::from_be_bytes(fixed::<8, T>(data)?)),
            },
        },
    }
}

impl FromField for f64 {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        float_value::<Self>(&value)
    }
}

impl FromField for f32 {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let v = float_value::<Self>(&value)?;
        let narrowed = v as f32;
        if v.is_finite() && narrowed.is_infinite() {
            return Err(Error::decode(format!("value {} out of range for f32", v)));
        }
        Ok(narrowed)
    }
}

// ============================================================================
// Text and bytes
// ============================================================================

/// Every type has a text form, so text-format columns of any OID decode into
/// `String`. Binary columns must be textual on the wire.
impl FromField for String {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;

        if value.format == Format::Text {
            return value.text::<Self>().map(str::to_owned);
        }

        match value.oid.family() {
            TypeFamily::Text | TypeFamily::Unspecified | TypeFamily::Other => {
                value.text::<Self>().map(str::to_owned)
            }
            TypeFamily::Json => {
                // jsonb binary carries a version byte
                let json = if value.oid == Oid::JSONB {
                    match data.split_first() {
                        Some((&1, rest)) => rest,
                        _ => return Err(Error::decode("unsupported jsonb version")),
                    }
                } else {
                    data
                };
                std::str::from_utf8(json)
                    .map(str::to_owned)
                    .map_err(|e| Error::decode(format!("invalid UTF-8 in JSON: {}", e)))
            }
            TypeFamily::Numeric => numeric::to_decimal_string(data),
            _ => Err(value.mismatch::<Self>()),
        }
    }
}

/// Parse the bytea hex output form.
pub(crate) fn parse_bytea_hex(s: &[u8]) -> Result<Vec<u8>> {
    let hex = s
        .strip_prefix(b"\\x")
        .ok_or_else(|| Error::decode("bytea text is not in hex format"))?;
    if hex.len() % 2 != 0 {
        return Err(Error::decode("odd number of hex digits in bytea"));
    }

    fn nibble(c: u8) -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(Error::decode(format!("invalid hex digit {:?}", c as char))),
        }
    }

    hex.chunks_exact(2)
        .map(|pair| Ok(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}

fn bytea_value<T: ?Sized>(value: &FieldValue<'_>) -> Result<Vec<u8>> {
    let data = value.bytes::<T>()?;
    match (value.oid.family(), value.format) {
        (TypeFamily::Bytea, Format::Binary) => Ok(data.to_vec()),
        (TypeFamily::Bytea, Format::Text) => parse_bytea_hex(data),
        (TypeFamily::Unspecified | TypeFamily::Other | TypeFamily::Text, _) => Ok(data.to_vec()),
        _ => Err(value.mismatch::<T>()),
    }
}

impl FromField for Vec<u8> {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        bytea_value::<Self>(&value)
    }
}

impl FromField for Bytes {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        bytea_value::<Self>(&value).map(Bytes::from)
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Decoding rule for one or more consecutive columns.
pub trait FromRow: Sized {
    /// Number of columns consumed.
    const COLUMNS: usize;

    fn from_row(row: &Row<'_>) -> Result<Self>;
}

impl<T: FromField> FromRow for T {
    const COLUMNS: usize = 1;

    fn from_row(row: &Row<'_>) -> Result<Self> {
        row.get(0)
    }
}

macro_rules! tuple_from_row {
    ($($name:ident),+) => {
        impl<$($name: FromRow),+> FromRow for ($($name,)+) {
            const COLUMNS: usize = 0 $(+ $name::COLUMNS)+;

            fn from_row(row: &Row<'_>) -> Result<Self> {
                let mut offset = 0;
                Ok(($(
                    {
                        let value = $name::from_row(&row.slice(offset, $name::COLUMNS)?)?;
                        offset += $name::COLUMNS;
                        value
                    },
                )+))
            }
        }
    };
}

tuple_from_row!(A);
tuple_from_row!(A, B);
tuple_from_row!(A, B, C);
tuple_from_row!(A, B, C, D);
tuple_from_row!(A, B, C, D, E);
tuple_from_row!(A, B, C, D, E, F);
tuple_from_row!(A, B, C, D, E, F, G);
tuple_from_row!(A, B, C, D, E, F, G, H);
tuple_from_row!(A, B, C, D, E, F, G, H, I);
tuple_from_row!(A, B, C, D, E, F, G, H, I, J);
tuple_from_row!(A, B, C, D, E, F, G, H, I, J, K);
tuple_from_row!(A, B, C, D, E, F, G, H, I, J, K, L);

#[cfg(test)]
mod tests {
    use super::*;

    fn text(oid: Oid, s: &str) -> FieldValue<'_> {
        FieldValue::new(oid, Format::Text, Some(s.as_bytes()))
    }

    fn binary(oid: Oid, data: &[u8]) -> FieldValue<'_> {
        FieldValue::new(oid, Format::Binary, Some(data))
    }

    #[test]
    fn test_null_handling() {
        let null = FieldValue::new(Oid::INT4, Format::Binary, None);
        assert_eq!(Option::<i32>::from_field(null).unwrap(), None);
        assert!(matches!(
            i32::from_field(null),
            Err(Error::NullValue { target: "i32" })
        ));
        assert!(matches!(
            String::from_field(FieldValue::new(Oid::TEXT, Format::Text, None)),
            Err(Error::NullValue { .. })
        ));
    }

    #[test]
    fn test_bool_is_strict() {
        assert!(bool::from_field(text(Oid::BOOL, "t")).unwrap());
        assert!(!bool::from_field(text(Oid::BOOL, "f")).unwrap());
        assert!(matches!(
            bool::from_field(text(Oid::BOOL, "true")),
            Err(Error::Decode(_))
        ));
        assert!(bool::from_field(binary(Oid::BOOL, &[1])).unwrap());
        assert!(bool::from_field(binary(Oid::BOOL, &[1, 0])).is_err());
    }

    #[test]
    fn test_integer_widening_and_narrowing() {
        let int2 = 300i16.to_be_bytes();
        assert_eq!(i64::from_field(binary(Oid::INT2, &int2)).unwrap(), 300);
        assert!(matches!(
            i8::from_field(binary(Oid::INT2, &int2)),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            u32::from_field(text(Oid::INT4, "-1")),
            Err(Error::Decode(_))
        ));
        assert_eq!(
            u64::from_field(text(Oid::NUMERIC, "18446744073709551615")).unwrap(),
            u64::MAX
        );
        assert_eq!(i32::from_field(text(Oid::NUMERIC, "12.000")).unwrap(), 12);
        assert!(i32::from_field(text(Oid::NUMERIC, "12.5")).is_err());
    }

    #[test]
    fn test_oid() {
        let raw = u32::MAX.to_be_bytes();
        assert_eq!(Oid::from_field(binary(Oid::OID, &raw)).unwrap(), Oid(u32::MAX));
        assert_eq!(Oid::from_field(text(Oid::OID, "16385")).unwrap(), Oid(16_385));
        assert!(Oid::from_field(text(Oid::INT4, "-1")).is_err());
    }

    #[test]
    fn test_integer_rejects_bad_input() {
        assert!(i32::from_field(text(Oid::INT4, "12abc")).is_err());
        assert!(i32::from_field(text(Oid::INT4, "")).is_err());
        assert!(i32::from_field(binary(Oid::INT4, &[0, 0, 1])).is_err());
        assert!(matches!(
            i32::from_field(text(Oid::BOOL, "t")),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_untyped_text_parses() {
        assert_eq!(i64::from_field(text(Oid::INVALID, "42")).unwrap(), 42);
        assert_eq!(i64::from_field(text(Oid::UNKNOWN, "-7")).unwrap(), -7);
    }

    #[test]
    fn test_floats() {
        assert_eq!(f64::from_field(binary(Oid::FLOAT8, &2.5f64.to_be_bytes())).unwrap(), 2.5);
        assert_eq!(f64::from_field(binary(Oid::FLOAT4, &0.5f32.to_be_bytes())).unwrap(), 0.5);
        assert_eq!(f64::from_field(binary(Oid::INT4, &3i32.to_be_bytes())).unwrap(), 3.0);
        assert!(f64::from_field(text(Oid::FLOAT8, "NaN")).unwrap().is_nan());
        assert_eq!(f64::from_field(text(Oid::FLOAT8, "-Infinity")).unwrap(), f64::NEG_INFINITY);
        assert!(matches!(
            f32::from_field(text(Oid::FLOAT8, "1e300")),
            Err(Error::Decode(_))
        ));
        assert!(f64::from_field(text(Oid::TEXT, "1.0")).is_err());
    }

    #[test]
    fn test_strings() {
        assert_eq!(String::from_field(text(Oid::TEXT, "")).unwrap(), "");
        assert_eq!(String::from_field(text(Oid::INT4, "42")).unwrap(), "42");
        assert_eq!(String::from_field(binary(Oid(90_001), b"custom")).unwrap(), "custom");
        assert_eq!(String::from_field(binary(Oid::JSONB, b"\x01{}")).unwrap(), "{}");
        assert!(matches!(
            String::from_field(binary(Oid::INT4, &[0, 0, 0, 1])),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(String::from_field(binary(Oid::TEXT, &[0xff, 0xfe])).is_err());
    }

    #[test]
    fn test_bytea() {
        assert_eq!(
            Vec::<u8>::from_field(text(Oid::BYTEA, "\\xDEadbe")).unwrap(),
            vec![0xde, 0xad, 0xbe]
        );
        assert_eq!(Vec::<u8>::from_field(text(Oid::BYTEA, "\\x")).unwrap(), Vec::<u8>::new());
        assert_eq!(
            Bytes::from_field(binary(Oid::BYTEA, &[0, 1, 2])).unwrap(),
            Bytes::from_static(&[0, 1, 2])
        );
        assert!(Vec::<u8>::from_field(text(Oid::BYTEA, "abc")).is_err());
        assert!(Vec::<u8>::from_field(text(Oid::BYTEA, "\\x0g")).is_err());
        assert!(matches!(
            Vec::<u8>::from_field(binary(Oid::INT8, &[0; 8])),
            Err(Error::TypeMismatch { .. })
        ));
    }
}
