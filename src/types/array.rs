//! PostgreSQL arrays.
//!
//! Arrays are sent as text literals (`{1,2,"a b",NULL}`) and read back from
//! either the text literal or the binary one-dimensional layout.

use std::borrow::Cow;

use bytes::Bytes;

use super::{Encode, FieldValue, Format, FromField, IsNull, Null, Oid, TypeFamily};
use crate::error::{Error, Result};

/// Marker for types that may appear as elements of a PostgreSQL array.
///
/// `u8` deliberately does not implement this: `Vec<u8>` and `[u8]` are
/// bytea, not `int2[]`.
pub trait ArrayElement {
    /// Sub-arrays are written unquoted so they nest.
    const IS_ARRAY: bool = false;
}

macro_rules! array_element {
    ($($t:ty),*) => {
        $(impl ArrayElement for $t {})*
    };
}

array_element!(bool, i8, i16, u16, i32, u32, i64, u64, f32, f64, str, String, Bytes, Null);
array_element!(Vec<u8>, Cow<'_, str>);

impl<T: ArrayElement> ArrayElement for Option<T> {
    const IS_ARRAY: bool = T::IS_ARRAY;
}

impl<T: ArrayElement + ?Sized> ArrayElement for &T {
    const IS_ARRAY: bool = T::IS_ARRAY;
}

impl<T: ArrayElement> ArrayElement for Vec<T> {
    const IS_ARRAY: bool = true;
}

impl<T: ArrayElement> ArrayElement for [T] {
    const IS_ARRAY: bool = true;
}

impl<T: ArrayElement, const N: usize> ArrayElement for [T; N] {
    const IS_ARRAY: bool = true;
}

// ============================================================================
// Literal writer
// ============================================================================

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.eq_ignore_ascii_case("NULL")
        || s
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_ascii_whitespace())
}

fn write_element<T: Encode + ArrayElement + ?Sized>(buf: &mut String, elem: &T) {
    let mut text = String::new();
    match elem.encode_text(&mut text) {
        IsNull::Yes => buf.push_str("NULL"),
        IsNull::No if T::IS_ARRAY => buf.push_str(&text),
        IsNull::No if needs_quotes(&text) => {
            buf.push('"');
            for c in text.chars() {
                if c == '"' || c == '\\' {
                    buf.push('\\');
                }
                buf.push(c);
            }
            buf.push('"');
        }
        IsNull::No => buf.push_str(&text),
    }
}

/// Write `{e1,e2,...}`.
pub(crate) fn write_literal<T: Encode + ArrayElement>(buf: &mut String, elems: &[T]) {
    buf.push('{');
    for (i, elem) in elems.iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        write_element(buf, elem);
    }
    buf.push('}');
}

impl<T: Encode + ArrayElement> Encode for [T] {
    const OID: Oid = Oid::INVALID;

    fn encode_text(&self, buf: &mut String) -> IsNull {
        write_literal(buf, self);
        IsNull::No
    }
}

impl<T: Encode + ArrayElement> Encode for Vec<T> {
    const OID: Oid = Oid::INVALID;

    fn encode_text(&self, buf: &mut String) -> IsNull {
        write_literal(buf, self);
        IsNull::No
    }
}

impl<T: Encode + ArrayElement, const N: usize> Encode for [T; N] {
    const OID: Oid = Oid::INVALID;

    fn encode_text(&self, buf: &mut String) -> IsNull {
        write_literal(buf, self);
        IsNull::No
    }
}

// ============================================================================
// Literal parser
// ============================================================================

/// One top-level item of a text array literal.
#[derive(Debug, PartialEq)]
pub(crate) enum Element<'a> {
    Null,
    Text(Cow<'a, str>),
    /// A complete `{...}` sub-array.
    Nested(&'a str),
}

fn skip_ws(b: &[u8], mut i: usize) -> usize {
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Split a text array literal into its top-level elements.
///
/// Accepts an optional `[lo:hi]=` dimension prefix.
pub(crate) fn parse_literal(s: &str) -> Result<Vec<Element<'_>>> {
    let s = s.trim();
    let s = if s.starts_with('[') {
        match s.find('=') {
            Some(eq) => s[eq + 1..].trim_start(),
            None => return Err(Error::decode("array dimension prefix without '='")),
        }
    } else {
        s
    };

    if !s.starts_with('{') || !s.ends_with('}') || s.len() < 2 {
        return Err(Error::decode(format!("malformed array literal: {:?}", s)));
    }
    let body = &s[1..s.len() - 1];
    let b = body.as_bytes();

    let mut out = Vec::new();
    let mut i = skip_ws(b, 0);
    if i == b.len() {
        return Ok(out);
    }

    loop {
        i = skip_ws(b, i);
        if i == b.len() {
            return Err(Error::decode("array literal ends with a separator"));
        }

        match b[i] {
            b'{' => {
                let start = i;
                let end = matching_brace(b, i)?;
                out.push(Element::Nested(&body[start..=end]));
                i = end + 1;
            }
            b'"' => {
                let mut text = String::new();
                let mut j = i + 1;
                let mut run = j;
                loop {
                    match b.get(j) {
                        None => return Err(Error::decode("unterminated quoted array element")),
                        Some(b'"') => break,
                        Some(b'\\') => {
                            text.push_str(&body[run..j]);
                            if j + 1 >= b.len() {
                                return Err(Error::decode("dangling escape in array literal"));
                            }
                            run = j + 1;
                            j += 2;
                        }
                        Some(_) => j += 1,
                    }
                }
                text.push_str(&body[run..j]);
                out.push(Element::Text(Cow::Owned(text)));
                i = j + 1;
            }
            _ => {
                let start = i;
                let mut escaped = false;
                while i < b.len() && b[i] != b',' {
                    match b[i] {
                        b'{' | b'}' | b'"' => {
                            return Err(Error::decode(format!(
                                "unexpected '{}' in array element",
                                b[i] as char
                            )))
                        }
                        b'\\' => {
                            escaped = true;
                            i += 2;
                        }
                        _ => i += 1,
                    }
                }
                let i_end = i.min(b.len());
                let raw = body[start..i_end].trim_end();
                i = i_end;
                if escaped {
                    let mut text = String::with_capacity(raw.len());
                    let mut chars = raw.chars();
                    while let Some(c) = chars.next() {
                        if c == '\\' {
                            if let Some(next) = chars.next() {
                                text.push(next);
                            }
                        } else {
                            text.push(c);
                        }
                    }
                    out.push(Element::Text(Cow::Owned(text)));
                } else if raw.eq_ignore_ascii_case("NULL") {
                    out.push(Element::Null);
                } else {
                    out.push(Element::Text(Cow::Borrowed(raw)));
                }
            }
        }

        i = skip_ws(b, i);
        match b.get(i) {
            None => return Ok(out),
            Some(b',') => i += 1,
            Some(c) => {
                return Err(Error::decode(format!(
                    "expected ',' in array literal, found '{}'",
                    *c as char
                )))
            }
        }
    }
}

/// Index of the `}` closing the `{` at `open`, skipping quoted sections.
fn matching_brace(b: &[u8], open: usize) -> Result<usize> {
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut i = open;
    while i < b.len() {
        match b[i] {
            b'\\' => i += 1,
            b'"' => in_quotes = !in_quotes,
            b'{' if !in_quotes => depth += 1,
            b'}' if !in_quotes => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(Error::decode("unbalanced braces in array literal"))
}

// ============================================================================
// Binary layout
// ============================================================================

fn read_i32(data: &[u8], pos: &mut usize) -> Result<i32> {
    let bytes = data
        .get(*pos..*pos + 4)
        .ok_or_else(|| Error::decode("binary array truncated"))?;
    *pos += 4;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// A decoded binary array: element type, `(length, lower bound)` per
/// dimension, and the flattened elements in row-major order.
pub(crate) struct BinaryArray<'a> {
    pub elem_oid: Oid,
    pub dims: Vec<(i32, i32)>,
    pub elems: Vec<Option<&'a [u8]>>,
}

impl BinaryArray<'_> {
    /// Re-encode the `index`-th slice along the outer dimension as an array
    /// of one fewer dimension.
    fn sub_array(&self, index: usize) -> Vec<u8> {
        let inner = &self.dims[1..];
        let stride = inner.iter().map(|&(len, _)| len as usize).product::<usize>();
        let elems = &self.elems[index * stride..(index + 1) * stride];
        let has_null = elems.iter().any(Option::is_none);

        let mut out = Vec::new();
        out.extend_from_slice(&(inner.len() as i32).to_be_bytes());
        out.extend_from_slice(&i32::from(has_null).to_be_bytes());
        out.extend_from_slice(&self.elem_oid.0.to_be_bytes());
        for &(len, lower) in inner {
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&lower.to_be_bytes());
        }
        for elem in elems {
            match elem {
                Some(bytes) => {
                    out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    out.extend_from_slice(bytes);
                }
                None => out.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        out
    }
}

/// Decode the binary array header and elements.
pub(crate) fn parse_binary(data: &[u8]) -> Result<BinaryArray<'_>> {
    let mut pos = 0;
    let ndim = read_i32(data, &mut pos)?;
    let _has_null = read_i32(data, &mut pos)?;
    let elem_oid = Oid(read_i32(data, &mut pos)? as u32);

    if ndim < 0 {
        return Err(Error::decode(format!("invalid array dimensions: {}", ndim)));
    }

    let mut dims = Vec::new();
    let mut total: usize = if ndim == 0 { 0 } else { 1 };
    for _ in 0..ndim {
        let len = read_i32(data, &mut pos)?;
        let lower = read_i32(data, &mut pos)?;
        if len < 0 {
            return Err(Error::decode(format!("invalid array length: {}", len)));
        }
        total = total
            .checked_mul(len as usize)
            .ok_or_else(|| Error::decode("array element count overflows"))?;
        dims.push((len, lower));
    }
    if total == 0 {
        // Any zero-length dimension means no elements; the server sends
        // such arrays with ndim 0.
        dims.clear();
    }

    // Every element carries at least a 4-byte length word.
    let mut elems = Vec::with_capacity(total.min((data.len() - pos) / 4));
    for _ in 0..total {
        let n = read_i32(data, &mut pos)?;
        if n < 0 {
            elems.push(None);
            continue;
        }
        let end = pos + n as usize;
        let bytes = data
            .get(pos..end)
            .ok_or_else(|| Error::decode("binary array element truncated"))?;
        elems.push(Some(bytes));
        pos = end;
    }

    if pos != data.len() {
        return Err(Error::decode("trailing bytes after binary array"));
    }
    Ok(BinaryArray {
        elem_oid,
        dims,
        elems,
    })
}

impl<T: FromField + ArrayElement> FromField for Vec<T> {
    fn from_field(value: FieldValue<'_>) -> Result<Self> {
        let data = value.bytes::<Self>()?;
        value.expect_family::<Self>(&[TypeFamily::Array])?;

        match value.format {
            Format::Binary => {
                let array = parse_binary(data)?;
                if array.dims.len() > 1 {
                    return (0..array.dims[0].0 as usize)
                        .map(|i| {
                            let sub = array.sub_array(i);
                            T::from_field(FieldValue::new(value.oid, Format::Binary, Some(&sub)))
                        })
                        .collect();
                }
                array
                    .elems
                    .into_iter()
                    .map(|d| T::from_field(FieldValue::new(array.elem_oid, Format::Binary, d)))
                    .collect()
            }
            Format::Text => {
                let text = value.text::<Self>()?;
                let elem_oid = value.oid.element().unwrap_or(Oid::INVALID);
                parse_literal(text)?
                    .into_iter()
                    .map(|elem| match elem {
                        Element::Null => T::from_field(FieldValue::new(elem_oid, Format::Text, None)),
                        Element::Text(s) => T::from_field(FieldValue::new(
                            elem_oid,
                            Format::Text,
                            Some(s.as_bytes()),
                        )),
                        Element::Nested(s) => T::from_field(FieldValue::new(
                            value.oid,
                            Format::Text,
                            Some(s.as_bytes()),
                        )),
                    })
                    .collect()
            }
        }
    }
}
