//! Parameter encoders for the built-in Rust types.

use std::borrow::Cow;
use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Encode, Format, IsNull, Null, Oid};

impl Encode for Null {
    const OID: Oid = Oid::INVALID;

    fn encode(&self, _buf: &mut BytesMut) -> IsNull {
        IsNull::Yes
    }

    fn encode_text(&self, _buf: &mut String) -> IsNull {
        IsNull::Yes
    }
}

impl<T: Encode> Encode for Option<T> {
    const OID: Oid = T::OID;
    const FORMAT: Format = T::FORMAT;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        match self {
            Some(v) => v.encode(buf),
            None => IsNull::Yes,
        }
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        match self {
            Some(v) => v.encode_text(buf),
            None => IsNull::Yes,
        }
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    const OID: Oid = T::OID;
    const FORMAT: Format = T::FORMAT;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        (**self).encode(buf)
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        (**self).encode_text(buf)
    }
}

// ============================================================================
// Boolean and numbers
// ============================================================================

impl Encode for bool {
    const OID: Oid = Oid::BOOL;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.put_u8(*self as u8);
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        buf.push(if *self { 't' } else { 'f' });
        IsNull::No
    }
}

/// Integers go out in binary in the smallest signed type that holds every
/// value of the Rust type; `u64` has no such type and is sent as NUMERIC text.
macro_rules! encode_integer {
    ($($t:ty => $wire:ty, $oid:expr;)*) => {
        $(
            impl Encode for $t {
                const OID: Oid = $oid;
                const FORMAT: Format = Format::Binary;

                fn encode(&self, buf: &mut BytesMut) -> IsNull {
                    buf.extend_from_slice(&(<$wire>::from(*self)).to_be_bytes());
                    IsNull::No
                }

                fn encode_text(&self, buf: &mut String) -> IsNull {
                    let _ = write!(buf, "{}", self);
                    IsNull::No
                }
            }
        )*
    };
}

encode_integer! {
    i8 => i16, Oid::INT2;
    u8 => i16, Oid::INT2;
    i16 => i16, Oid::INT2;
    u16 => i32, Oid::INT4;
    i32 => i32, Oid::INT4;
    u32 => i64, Oid::INT8;
    i64 => i64, Oid::INT8;
}

impl Encode for u64 {
    const OID: Oid = Oid::NUMERIC;

    fn encode_text(&self, buf: &mut String) -> IsNull {
        let _ = write!(buf, "{}", self);
        IsNull::No
    }
}

impl Encode for Oid {
    const OID: Oid = Oid::OID;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.put_u32(self.0);
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        let _ = write!(buf, "{}", self.0);
        IsNull::No
    }
}

fn write_float(buf: &mut String, v: f64) {
    if v.is_nan() {
        buf.push_str("NaN");
    } else if v.is_infinite() {
        buf.push_str(if v > 0.0 { "Infinity" } else { "-Infinity" });
    } else {
        let _ = write!(buf, "{}", v);
    }
}

impl Encode for f32 {
    const OID: Oid = Oid::FLOAT4;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.put_f32(*self);
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        if self.is_finite() {
            // Shortest f32 repr, not the widened f64 one
            let _ = write!(buf, "{}", self);
        } else {
            write_float(buf, *self as f64);
        }
        IsNull::No
    }
}

impl Encode for f64 {
    const OID: Oid = Oid::FLOAT8;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.put_f64(*self);
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        write_float(buf, *self);
        IsNull::No
    }
}

// ============================================================================
// Text
// ============================================================================

impl Encode for str {
    const OID: Oid = Oid::TEXT;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.extend_from_slice(self.as_bytes());
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        buf.push_str(self);
        IsNull::No
    }
}

impl Encode for String {
    const OID: Oid = Oid::TEXT;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        self.as_str().encode(buf)
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        self.as_str().encode_text(buf)
    }
}

impl Encode for Cow<'_, str> {
    const OID: Oid = Oid::TEXT;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        self.as_ref().encode(buf)
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        self.as_ref().encode_text(buf)
    }
}

// ============================================================================
// Binary strings
// ============================================================================

/// bytea hex output form: `\x` followed by two lowercase digits per byte.
pub(crate) fn write_bytea_hex(buf: &mut String, bytes: &[u8]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    buf.reserve(2 + bytes.len() * 2);
    buf.push_str("\\x");
    for b in bytes {
        buf.push(HEX[(b >> 4) as usize] as char);
        buf.push(HEX[(b & 0x0f) as usize] as char);
    }
}

impl Encode for [u8] {
    const OID: Oid = Oid::BYTEA;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        buf.extend_from_slice(self);
        IsNull::No
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        write_bytea_hex(buf, self);
        IsNull::No
    }
}

impl Encode for Vec<u8> {
    const OID: Oid = Oid::BYTEA;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        self.as_slice().encode(buf)
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        self.as_slice().encode_text(buf)
    }
}

impl<const N: usize> Encode for [u8; N] {
    const OID: Oid = Oid::BYTEA;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        self.as_slice().encode(buf)
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        self.as_slice().encode_text(buf)
    }
}

impl Encode for Bytes {
    const OID: Oid = Oid::BYTEA;
    const FORMAT: Format = Format::Binary;

    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        self.as_ref().encode(buf)
    }

    fn encode_text(&self, buf: &mut String) -> IsNull {
        self.as_ref().encode_text(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Parameter;

    fn text_of<T: Encode + ?Sized>(v: &T) -> String {
        let mut s = String::new();
        v.encode_text(&mut s);
        s
    }

    #[test]
    fn test_integer_widening() {
        let p = Parameter::encode(&200u8);
        assert_eq!(p.oid, Oid::INT2);
        assert_eq!(p.value.as_deref(), Some(&200i16.to_be_bytes()[..]));

        let p = Parameter::encode(&u16::MAX);
        assert_eq!(p.oid, Oid::INT4);
        assert_eq!(p.value.as_deref(), Some(&65_535i32.to_be_bytes()[..]));

        let p = Parameter::encode(&u32::MAX);
        assert_eq!(p.oid, Oid::INT8);
        assert_eq!(p.value.as_deref(), Some(&4_294_967_295i64.to_be_bytes()[..]));

        let p = Parameter::encode(&u64::MAX);
        assert_eq!(p.oid, Oid::NUMERIC);
        assert_eq!(p.format, Format::Text);
        assert_eq!(p.value.as_deref(), Some(&b"18446744073709551615"[..]));
    }

    #[test]
    fn test_oid() {
        let p = Parameter::encode(&Oid(16_385));
        assert_eq!(p.oid, Oid::OID);
        assert_eq!(p.value.as_deref(), Some(&16_385u32.to_be_bytes()[..]));
        assert_eq!(text_of(&Oid(u32::MAX)), "4294967295");
    }

    #[test]
    fn test_float_text_forms() {
        assert_eq!(text_of(&f64::NAN), "NaN");
        assert_eq!(text_of(&f64::INFINITY), "Infinity");
        assert_eq!(text_of(&f32::NEG_INFINITY), "-Infinity");
        assert_eq!(text_of(&1.5f64), "1.5");
        assert_eq!(text_of(&0.1f32), "0.1");
    }

    #[test]
    fn test_float_binary() {
        let p = Parameter::encode(&1.5f64);
        assert_eq!(p.oid, Oid::FLOAT8);
        assert_eq!(p.value.as_deref(), Some(&1.5f64.to_be_bytes()[..]));
    }

    #[test]
    fn test_bool() {
        assert_eq!(Parameter::encode(&true).value.as_deref(), Some(&[1u8][..]));
        assert_eq!(text_of(&false), "f");
    }

    #[test]
    fn test_bytea() {
        let p = Parameter::encode(&vec![0xdeu8, 0xad, 0xbe, 0xef]);
        assert_eq!(p.oid, Oid::BYTEA);
        assert_eq!(p.format, Format::Binary);
        assert_eq!(text_of(&[0xdeu8, 0xad][..]), "\\xdead");
        assert_eq!(text_of(&Vec::<u8>::new()), "\\x");
    }

    #[test]
    fn test_text_and_empty_string_is_not_null() {
        let p = Parameter::encode("");
        assert_eq!(p.oid, Oid::TEXT);
        assert_eq!(p.value.as_deref(), Some(&b""[..]));
        assert!(!p.is_null());
    }

    #[test]
    fn test_option() {
        let none: Option<String> = None;
        let p = Parameter::encode(&none);
        assert!(p.is_null());
        assert_eq!(p.oid, Oid::TEXT);

        let p = Parameter::encode(&Some(7i16));
        assert_eq!(p.value.as_deref(), Some(&7i16.to_be_bytes()[..]));
    }
}
