//! Frontend message encoders and backend message decoders for protocol
//! version 3.0.
//!
//! Message layouts follow
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result, ServerError};
use crate::types::{Format, Oid, Parameter};

/// Major 3, minor 0.
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Upper bound for a single backend message; anything larger means the
/// stream is out of sync.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Session transaction state carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`
    Idle,
    /// `T`
    InTransaction,
    /// `E`: statements are rejected until rollback.
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::Protocol(format!(
                "invalid transaction status: {:?}",
                other as char
            ))),
        }
    }
}

// ============================================================================
// Frontend messages
// ============================================================================

/// A message the client sends.
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Write `tag`, a length placeholder, the body, then patch the length.
fn framed(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// First message on a new channel; untagged.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(64);
        out.put_i32(0);
        out.put_i32(PROTOCOL_VERSION);
        let buf = &mut out;

        let database = self.database.as_deref().map(|db| ("database", db));
        let pairs = std::iter::once(("user", self.user.as_str()))
            .chain(database)
            .chain(self.options.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        for (key, value) in pairs {
            put_cstring(buf, key);
            put_cstring(buf, value);
        }
        buf.put_u8(0);

        // The length counts itself but there is no tag
        let len = out.len() as i32;
        out[..4].copy_from_slice(&len.to_be_bytes());
        out
    }
}

/// `p`: cleartext or MD5-hashed password.
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |buf| put_cstring(buf, &self.password))
    }
}

/// `p`: chosen SASL mechanism plus the client-first message.
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |buf| {
            put_cstring(buf, &self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(&self.data);
        })
    }
}

/// `p`: a later SASL step.
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |buf| buf.put_slice(&self.data))
    }
}

/// `Q`: simple query protocol.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        framed(b'Q', |buf| put_cstring(buf, &self.query))
    }
}

/// `P`: parse a statement, optionally naming it.
#[derive(Debug, Clone)]
pub struct ParseMessage {
    /// Empty for the unnamed statement.
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'P', |buf| {
            put_cstring(buf, &self.name);
            put_cstring(buf, &self.query);
            buf.put_u16(self.param_types.len() as u16);
            for oid in &self.param_types {
                buf.put_u32(oid.as_u32());
            }
        })
    }
}

/// `B`: bind parameters to a parsed statement, creating a portal.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: String,
    pub statement: String,
    pub params: &'a [Parameter],
    pub result_formats: Vec<Format>,
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self) -> BytesMut {
        framed(b'B', |buf| {
            put_cstring(buf, &self.portal);
            put_cstring(buf, &self.statement);

            // One format code per parameter
            buf.put_u16(self.params.len() as u16);
            for param in self.params {
                buf.put_i16(param.format as i16);
            }

            buf.put_u16(self.params.len() as u16);
            for param in self.params {
                match &param.value {
                    None => buf.put_i32(-1),
                    Some(value) => {
                        buf.put_i32(value.len() as i32);
                        buf.put_slice(value);
                    }
                }
            }

            buf.put_u16(self.result_formats.len() as u16);
            for fmt in &self.result_formats {
                buf.put_i16(*fmt as i16);
            }
        })
    }
}

/// `E`: run a portal.
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        framed(b'E', |buf| {
            put_cstring(buf, &self.portal);
            buf.put_i32(self.max_rows);
        })
    }
}

/// `D`: ask for a RowDescription.
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        framed(b'D', |buf| {
            buf.put_u8(self.kind);
            put_cstring(buf, &self.name);
        })
    }
}

/// `C`: release a statement or portal.
#[derive(Debug, Clone)]
pub struct CloseMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'C', |buf| {
            buf.put_u8(self.kind);
            put_cstring(buf, &self.name);
        })
    }
}

/// `S`: end of an extended-protocol batch.
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        framed(b'S', |_| {})
    }
}

/// `d`: a chunk of COPY FROM STDIN data.
#[derive(Debug, Clone, Copy)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self) -> BytesMut {
        framed(b'd', |buf| buf.put_slice(self.data))
    }
}

/// `c`: end of COPY FROM STDIN data.
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self) -> BytesMut {
        framed(b'c', |_| {})
    }
}

/// `f`: abort COPY FROM STDIN; the server answers with an error.
#[derive(Debug, Clone)]
pub struct CopyFailMessage {
    pub message: String,
}

impl FrontendMessage for CopyFailMessage {
    fn encode(&self) -> BytesMut {
        framed(b'f', |buf| put_cstring(buf, &self.message))
    }
}

/// `X`: orderly disconnect.
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        framed(b'X', |_| {})
    }
}

// ============================================================================
// Backend messages
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// A decoded server message.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },

    CopyInResponse { format: Format, column_formats: Vec<Format> },
    CopyOutResponse { format: Format, column_formats: Vec<Format> },
    CopyData { data: Bytes },
    CopyDone,
}

/// Total length of the first complete message in `buf`, if one is buffered.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "invalid length {} for message type {:?}",
            len, buf[0] as char
        )));
    }
    let total = 1 + len as usize;
    Ok((buf.len() >= total).then_some(total))
}

/// Guard against short message bodies before a fixed-width read.
fn need(body: &Bytes, n: usize, what: &str) -> Result<()> {
    if body.remaining() < n {
        Err(Error::Protocol(format!("truncated {} message", what)))
    } else {
        Ok(())
    }
}

impl BackendMessage {
    /// Decode one framed message (tag, length, body) from the front of
    /// `buf`.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let total = frame_len(buf)?
            .ok_or_else(|| Error::Protocol("incomplete message".to_string()))?;
        let tag = buf.get_u8();
        buf.advance(4);
        let body = buf.split_to(total - 5);

        match tag {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: read_cstring(&mut body.clone())?,
            }),
            b'Z' => {
                need(&body, 1, "ReadyForQuery")?;
                Ok(BackendMessage::ReadyForQuery {
                    status: TransactionStatus::try_from(body[0])?,
                })
            }
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => {
                let mut body = body;
                let name = read_cstring(&mut body)?;
                let value = read_cstring(&mut body)?;
                Ok(BackendMessage::ParameterStatus { name, value })
            }
            b'K' => {
                let mut body = body;
                need(&body, 8, "BackendKeyData")?;
                Ok(BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            b'G' => {
                let (format, column_formats) = Self::decode_copy_response(body)?;
                Ok(BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                })
            }
            b'H' => {
                let (format, column_formats) = Self::decode_copy_response(body)?;
                Ok(BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                })
            }
            b'd' => Ok(BackendMessage::CopyData { data: body }),
            b'c' => Ok(BackendMessage::CopyDone),
            other => Err(Error::Protocol(format!(
                "unknown message type {:?}",
                other as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        need(&body, 4, "Authentication")?;
        let code = body.get_i32();

        match code {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4, "AuthenticationMD5Password")?;
                let salt = [body[0], body[1], body[2], body[3]];
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    match read_cstring(&mut body)? {
                        name if name.is_empty() => break,
                        name => mechanisms.push(name),
                    }
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(Error::Connection(format!(
                "unsupported authentication method (code {})",
                code
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        need(&body, 2, "RowDescription")?;
        let count = body.get_u16() as usize;
        let mut fields = Vec::with_capacity(count);
        while fields.len() < count {
            let name = read_cstring(&mut body)?;
            need(&body, 18, "RowDescription")?;
            fields.push(FieldDescription {
                name,
                table_oid: body.get_u32(),
                column_attr: body.get_i16(),
                type_oid: Oid(body.get_u32()),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: Format::from_code(body.get_i16()),
            });
        }
        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        need(&body, 2, "DataRow")?;
        let count = body.get_u16() as usize;
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            need(&body, 4, "DataRow")?;
            // Negative length is NULL
            let value = match usize::try_from(body.get_i32()) {
                Ok(len) => {
                    need(&body, len, "DataRow")?;
                    Some(body.split_to(len))
                }
                Err(_) => None,
            };
            values.push(value);
        }
        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(mut body: Bytes) -> Result<Self> {
        need(&body, 2, "ParameterDescription")?;
        let num_params = body.get_u16() as usize;
        need(&body, num_params * 4, "ParameterDescription")?;
        let type_oids = (0..num_params).map(|_| Oid(body.get_u32())).collect();
        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    /// Overall format, then one format code per column.
    fn decode_copy_response(mut body: Bytes) -> Result<(Format, Vec<Format>)> {
        need(&body, 3, "CopyResponse")?;
        let format = Format::from_code(i16::from(body.get_u8()));
        let count = body.get_u16() as usize;
        need(&body, count * 2, "CopyResponse")?;
        let column_formats = (0..count).map(|_| Format::from_code(body.get_i16())).collect();
        Ok((format, column_formats))
    }

    fn decode_notification_response(mut body: Bytes) -> Result<Self> {
        need(&body, 4, "NotificationResponse")?;
        Ok(BackendMessage::NotificationResponse {
            process_id: body.get_i32(),
            channel: read_cstring(&mut body)?,
            payload: read_cstring(&mut body)?,
        })
    }
}

// ============================================================================
// Field readers
// ============================================================================

/// NUL-terminated string; invalid UTF-8 is replaced, not rejected.
fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Protocol("unterminated string".to_string()))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Code/value pairs of an ErrorResponse or NoticeResponse, up to the
/// terminating zero code.
fn read_error_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.has_remaining() {
        match body.get_u8() {
            0 => break,
            code => {
                fields.insert(code, read_cstring(&mut body)?);
            }
        }
    }
    Ok(fields)
}

/// Build a [`ServerError`] from ErrorResponse/NoticeResponse fields.
pub fn server_error(fields: &HashMap<u8, String>) -> ServerError {
    ServerError {
        // 'V' is the non-localized severity
        severity: fields
            .get(&b'V')
            .or_else(|| fields.get(&b'S'))
            .cloned()
            .unwrap_or_default(),
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
        position: fields.get(&b'P').and_then(|p| p.parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToParams;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_startup_message_structure() {
        let msg = StartupMessage {
            user: "test".to_string(),
            database: Some("testdb".to_string()),
            options: vec![("application_name".to_string(), "pgbind".to_string())],
        };

        let encoded = msg.encode();

        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());
        assert_eq!(&encoded[4..8], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(
            &encoded[8..],
            &b"user\0test\0database\0testdb\0application_name\0pgbind\0\0"[..]
        );
    }

    #[test]
    fn test_query_message_structure() {
        let encoded = QueryMessage {
            query: "SELECT 1".to_string(),
        }
        .encode();

        assert_eq!(encoded[0], b'Q');
        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1);
        assert_eq!(&encoded[5..], b"SELECT 1\0");
    }

    #[test]
    fn test_bind_message_carries_null_out_of_band() {
        let params = (7i32, crate::types::Null, "x").to_params();
        let encoded = BindMessage {
            portal: String::new(),
            statement: String::new(),
            params: &params,
            result_formats: vec![Format::Binary],
        }
        .encode();

        let mut expected = BytesMut::new();
        expected.put_slice(b"\0\0");
        expected.put_i16(3);
        expected.put_i16(1);
        expected.put_i16(0);
        expected.put_i16(0);
        expected.put_i16(3);
        expected.put_i32(4);
        expected.put_i32(7);
        expected.put_i32(-1);
        expected.put_i32(1);
        expected.put_slice(b"x");
        expected.put_i16(1);
        expected.put_i16(1);

        assert_eq!(encoded[0], b'B');
        assert_eq!(&encoded[5..], &expected[..]);
    }

    #[test]
    fn test_bind_count_is_unsigned() {
        let params: Vec<Parameter> = (0..40_000)
            .map(|_| Parameter::encode(&crate::types::NULL))
            .collect();
        let bind = BindMessage {
            portal: String::new(),
            statement: String::new(),
            params: &params,
            result_formats: vec![Format::Binary],
        }
        .encode();

        // type + length + two empty names, then the format-code count
        assert_eq!(&bind[7..9], &40_000u16.to_be_bytes());
        let values_at = 9 + 2 * params.len();
        assert_eq!(&bind[values_at..values_at + 2], &40_000u16.to_be_bytes());
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(frame_len(b"Z\0\0").unwrap(), None);
        assert_eq!(frame_len(b"Z\0\0\0\x05I").unwrap(), Some(6));
        assert_eq!(frame_len(b"Z\0\0\0\x05").unwrap(), None);
        assert!(frame_len(b"Z\0\0\0\x01").is_err());
    }

    #[test]
    fn test_decode_data_row_with_null() {
        let mut raw = BytesMut::new();
        raw.put_u8(b'D');
        raw.put_i32(4 + 2 + 4 + 2 + 4);
        raw.put_i16(2);
        raw.put_i32(2);
        raw.put_slice(b"hi");
        raw.put_i32(-1);

        match BackendMessage::decode(&mut raw.freeze()).unwrap() {
            BackendMessage::DataRow { values } => {
                assert_eq!(values, vec![Some(Bytes::from_static(b"hi")), None]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated_data_row() {
        let mut raw = BytesMut::new();
        raw.put_u8(b'D');
        raw.put_i32(4 + 2 + 4);
        raw.put_i16(1);
        raw.put_i32(10);

        assert!(matches!(
            BackendMessage::decode(&mut raw.freeze()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_copy_out_response() {
        let mut raw = BytesMut::new();
        raw.put_u8(b'H');
        raw.put_i32(4 + 1 + 2 + 4);
        raw.put_u8(0);
        raw.put_i16(2);
        raw.put_i16(0);
        raw.put_i16(0);

        match BackendMessage::decode(&mut raw.freeze()).unwrap() {
            BackendMessage::CopyOutResponse {
                format,
                column_formats,
            } => {
                assert_eq!(format, Format::Text);
                assert_eq!(column_formats, vec![Format::Text, Format::Text]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_copy_frontend_messages() {
        let data = CopyDataMessage { data: b"1\tx\n" }.encode();
        assert_eq!(data[0], b'd');
        assert_eq!(&data[5..], b"1\tx\n");

        assert_eq!(&CopyDoneMessage.encode()[..], b"c\0\0\0\x04");

        let fail = CopyFailMessage {
            message: "stop".to_string(),
        }
        .encode();
        assert_eq!(&fail[..], b"f\0\0\0\x09stop\0");
    }

    #[test]
    fn test_server_error_fields() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "FEHLER".to_string());
        fields.insert(b'V', "ERROR".to_string());
        fields.insert(b'C', "42601".to_string());
        fields.insert(b'M', "syntax error".to_string());
        fields.insert(b'P', "8".to_string());

        let err = server_error(&fields);
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "42601");
        assert_eq!(err.position, Some(8));
        assert_eq!(err.detail, None);
    }
}
