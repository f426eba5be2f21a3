//! PostgreSQL type registry.
//!
//! Encoding and decoding rules are selected statically by the Rust type:
//! - [`Encode`]: one Rust value → one parameter (OID, format, bytes or NULL)
//! - [`ToParams`]: a value or tuple → an ordered list of parameters
//! - [`FromField`]: one result column → one Rust value
//! - [`FromRow`]: consecutive result columns → one Rust value (tuples)
//!
//! Using a type with no rule is a compile error, never a runtime lookup.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

mod array;
mod decode;
mod encode;
mod numeric;
mod temporal;

use std::fmt;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::error::{Error, Result};

pub use array::ArrayElement;
pub use decode::FromRow;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
///
/// `INVALID`, `BYTEA` and `TEXT` are the reserved identifiers every session
/// understands; the remaining constants are well-known built-ins. Anything
/// else is server-defined and only decodes as raw text or bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Oid(pub u32);

impl Oid {
    /// Unspecified; lets the server infer the type.
    pub const INVALID: Oid = Oid(0);
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    // Array types
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const NAME_ARRAY: Oid = Oid(1003);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const OID_ARRAY: Oid = Oid(1028);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// Get the raw value.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Classify this OID for decode-time coercion checks.
    pub fn family(self) -> TypeFamily {
        match self {
            Oid::INVALID | Oid::UNKNOWN => TypeFamily::Unspecified,
            Oid::BOOL => TypeFamily::Bool,
            Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID => TypeFamily::Integer,
            Oid::FLOAT4 | Oid::FLOAT8 => TypeFamily::Float,
            Oid::NUMERIC => TypeFamily::Numeric,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME => TypeFamily::Text,
            Oid::BYTEA => TypeFamily::Bytea,
            Oid::UUID => TypeFamily::Uuid,
            Oid::JSON | Oid::JSONB => TypeFamily::Json,
            Oid::DATE => TypeFamily::Date,
            Oid::TIME | Oid::TIMETZ => TypeFamily::Time,
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => TypeFamily::Timestamp,
            Oid::INTERVAL => TypeFamily::Interval,
            _ if self.element().is_some() => TypeFamily::Array,
            _ => TypeFamily::Other,
        }
    }

    /// Element type of a built-in array type.
    pub fn element(self) -> Option<Oid> {
        let elem = match self {
            Oid::JSON_ARRAY => Oid::JSON,
            Oid::BOOL_ARRAY => Oid::BOOL,
            Oid::BYTEA_ARRAY => Oid::BYTEA,
            Oid::CHAR_ARRAY => Oid::CHAR,
            Oid::NAME_ARRAY => Oid::NAME,
            Oid::INT2_ARRAY => Oid::INT2,
            Oid::INT4_ARRAY => Oid::INT4,
            Oid::TEXT_ARRAY => Oid::TEXT,
            Oid::BPCHAR_ARRAY => Oid::BPCHAR,
            Oid::VARCHAR_ARRAY => Oid::VARCHAR,
            Oid::INT8_ARRAY => Oid::INT8,
            Oid::FLOAT4_ARRAY => Oid::FLOAT4,
            Oid::FLOAT8_ARRAY => Oid::FLOAT8,
            Oid::OID_ARRAY => Oid::OID,
            Oid::TIMESTAMP_ARRAY => Oid::TIMESTAMP,
            Oid::DATE_ARRAY => Oid::DATE,
            Oid::TIME_ARRAY => Oid::TIME,
            Oid::TIMESTAMPTZ_ARRAY => Oid::TIMESTAMPTZ,
            Oid::NUMERIC_ARRAY => Oid::NUMERIC,
            Oid::UUID_ARRAY => Oid::UUID,
            Oid::JSONB_ARRAY => Oid::JSONB,
            _ => return None,
        };
        Some(elem)
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        self.family() == TypeFamily::Text
    }

    /// True for server-defined identifiers this crate has no rule for.
    pub fn is_server_defined(self) -> bool {
        self.family() == TypeFamily::Other
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.0)
    }
}

impl From<u32> for Oid {
    fn from(v: u32) -> Self {
        Oid(v)
    }
}

/// Coarse grouping of OIDs used to reject impossible coercions early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    /// `INVALID` or `UNKNOWN`: no claim about the representation.
    Unspecified,
    Bool,
    Integer,
    Float,
    Numeric,
    Text,
    Bytea,
    Uuid,
    Json,
    Date,
    Time,
    Timestamp,
    Interval,
    Array,
    /// Server-defined type.
    Other,
}

// ============================================================================
// Formats and NULL
// ============================================================================

/// Wire format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    pub fn from_code(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// Whether an encoder produced a value or NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsNull {
    Yes,
    No,
}

/// The NULL sentinel.
///
/// Binds as "no value" with an unspecified type. Distinct from empty strings,
/// zero and every other in-domain value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Null;

/// Shorthand for [`Null`].
pub const NULL: Null = Null;

// ============================================================================
// Parameters
// ============================================================================

/// One encoded positional parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub oid: Oid,
    pub format: Format,
    /// `None` is NULL; absence is never signalled in-band.
    pub value: Option<Bytes>,
}

impl Parameter {
    /// Encode a single value with its static rule.
    pub fn encode<T: Encode + ?Sized>(value: &T) -> Self {
        let mut buf = BytesMut::new();
        let value = match value.encode(&mut buf) {
            IsNull::Yes => None,
            IsNull::No => Some(buf.freeze()),
        };
        Parameter {
            oid: T::OID,
            format: T::FORMAT,
            value,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// Parameter list; most statements bind only a handful.
pub type Params = SmallVec<[Parameter; 8]>;

/// Encoding rule for one column value.
pub trait Encode {
    /// Type identifier sent with the parameter.
    const OID: Oid;

    /// Representation produced by [`Encode::encode`].
    const FORMAT: Format = Format::Text;

    /// Write the value in [`Encode::FORMAT`].
    fn encode(&self, buf: &mut BytesMut) -> IsNull {
        let mut text = String::new();
        let is_null = self.encode_text(&mut text);
        if is_null == IsNull::No {
            buf.extend_from_slice(text.as_bytes());
        }
        is_null
    }

    /// Write the text representation, used for array elements.
    fn encode_text(&self, buf: &mut String) -> IsNull;
}

/// Anything that expands into zero or more ordered parameters.
pub trait ToParams {
    fn append_params(&self, params: &mut Params);

    /// Append the text form of each value, `None` for NULL. COPY rows are
    /// built from these.
    fn append_text(&self, fields: &mut Vec<Option<String>>);

    fn to_params(&self) -> Params {
        let mut params = Params::new();
        self.append_params(&mut params);
        params
    }
}

impl<T: Encode + ?Sized> ToParams for T {
    fn append_params(&self, params: &mut Params) {
        params.push(Parameter::encode(self));
    }

    fn append_text(&self, fields: &mut Vec<Option<String>>) {
        let mut text = String::new();
        fields.push(match self.encode_text(&mut text) {
            IsNull::No => Some(text),
            IsNull::Yes => None,
        });
    }
}

impl ToParams for () {
    fn append_params(&self, _params: &mut Params) {}

    fn append_text(&self, _fields: &mut Vec<Option<String>>) {}
}

macro_rules! tuple_to_params {
    ($($name:ident . $idx:tt),+) => {
        impl<$($name: ToParams),+> ToParams for ($($name,)+) {
            fn append_params(&self, params: &mut Params) {
                $(self.$idx.append_params(params);)+
            }

            fn append_text(&self, fields: &mut Vec<Option<String>>) {
                $(self.$idx.append_text(fields);)+
            }
        }
    };
}

tuple_to_params!(A.0);
tuple_to_params!(A.0, B.1);
tuple_to_params!(A.0, B.1, C.2);
tuple_to_params!(A.0, B.1, C.2, D.3);
tuple_to_params!(A.0, B.1, C.2, D.3, E.4);
tuple_to_params!(A.0, B.1, C.2, D.3, E.4, F.5);
tuple_to_params!(A.0, B.1, C.2, D.3, E.4, F.5, G.6);
tuple_to_params!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7);
tuple_to_params!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8);
tuple_to_params!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8, J.9);
tuple_to_params!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8, J.9, K.10);
tuple_to_params!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8, J.9, K.10, L.11);

// ============================================================================
// Decoding
// ============================================================================

/// One raw column value as received from the server.
#[derive(Debug, Clone, Copy)]
pub struct FieldValue<'a> {
    pub oid: Oid,
    pub format: Format,
    /// `None` is NULL.
    pub data: Option<&'a [u8]>,
}

impl<'a> FieldValue<'a> {
    pub fn new(oid: Oid, format: Format, data: Option<&'a [u8]>) -> Self {
        Self { oid, format, data }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    /// The bytes, or `NullValue` for NULL.
    pub fn bytes<T: ?Sized>(&self) -> Result<&'a [u8]> {
        self.data.ok_or(Error::NullValue {
            target: std::any::type_name::<T>(),
        })
    }

    /// The bytes as UTF-8, or `NullValue` for NULL.
    pub fn text<T: ?Sized>(&self) -> Result<&'a str> {
        let bytes = self.bytes::<T>()?;
        std::str::from_utf8(bytes).map_err(|e| Error::decode(format!("invalid UTF-8: {}", e)))
    }

    /// Reject known type families the target cannot be coerced from.
    pub fn expect_family<T: ?Sized>(&self, accept: &[TypeFamily]) -> Result<()> {
        let family = self.oid.family();
        if family == TypeFamily::Unspecified || accept.contains(&family) {
            Ok(())
        } else {
            Err(self.mismatch::<T>())
        }
    }

    pub fn mismatch<T: ?Sized>(&self) -> Error {
        Error::TypeMismatch {
            oid: self.oid,
            target: std::any::type_name::<T>(),
        }
    }
}

/// Decoding rule for one column value.
pub trait FromField: Sized {
    /// Decode; implementations must check for NULL before reading bytes.
    fn from_field(value: FieldValue<'_>) -> Result<Self>;
}
