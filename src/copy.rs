//! Bulk transfer with `COPY`.
//!
//! A [`TableWriter`] streams rows into `COPY ... FROM STDIN`; a
//! [`TableReader`] pulls them out of `COPY ... TO STDOUT`. Both use the text
//! format: fields separated by tabs, one row per line, `\N` for NULL and
//! backslash escapes for control characters.
//!
//! While either is active the connection serves nothing else; other
//! operations fail with [`Error::CopyInProgress`]. Dropping an unfinished
//! writer aborts its COPY, dropping an unfinished reader discards the rest
//! of the data. Both happen ahead of the next operation.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};

use crate::connection::{CopyDirection, Shared};
use crate::error::{Error, Result};
use crate::result::{Column, QueryResult, Row};
use crate::types::{Format, FromField, FromRow, Oid, ToParams};

/// Buffered rows are sent once they reach this size.
const CHUNK_SIZE: usize = 64 * 1024;

// ============================================================================
// Writer
// ============================================================================

/// Rows going into `COPY ... FROM STDIN`.
///
/// ```ignore
/// let mut writer = conn.table_writer("COPY notes (id, body) FROM STDIN").await?;
/// writer.insert((1, "first")).await?;
/// writer.insert((2, NULL)).await?;
/// assert_eq!(writer.finish().await?, 2);
/// ```
pub struct TableWriter {
    shared: Weak<Shared>,
    id: u64,
    columns: usize,
    buffer: BytesMut,
    open: bool,
}

impl TableWriter {
    pub(crate) fn new(shared: Weak<Shared>, id: u64, columns: usize) -> Self {
        Self {
            shared,
            id,
            columns,
            buffer: BytesMut::new(),
            open: true,
        }
    }

    /// Number of columns the COPY expects per row.
    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Append one row. Each value is written in its text form; the number
    /// of values must match [`columns`](Self::columns).
    pub async fn insert<P: ToParams>(&mut self, row: P) -> Result<()> {
        let mut fields = Vec::with_capacity(self.columns);
        row.append_text(&mut fields);
        if fields.len() != self.columns {
            return Err(Error::Copy(format!(
                "row has {} values but the COPY expects {}",
                fields.len(),
                self.columns
            )));
        }
        self.connection()?;

        write_row(&mut self.buffer, &fields);
        self.flush_full().await
    }

    /// Append data already in COPY text format, e.g. `"1\tfirst\n"`.
    pub async fn insert_raw(&mut self, data: &[u8]) -> Result<()> {
        self.connection()?;
        self.buffer.extend_from_slice(data);
        self.flush_full().await
    }

    /// End the COPY. Returns the number of rows the server stored.
    ///
    /// The writer is closed afterwards even if the server rejects the data.
    pub async fn finish(&mut self) -> Result<u64> {
        let shared = self.connection()?;
        let data = self.buffer.split();
        let result = shared.copy_done(self.id, &data).await;
        self.restore(&shared, data);
        result
    }

    /// Abort the COPY; nothing written so far is stored.
    pub async fn cancel(&mut self, reason: &str) -> Result<()> {
        let shared = self.connection()?;
        self.buffer.clear();
        let result = shared.copy_fail(self.id, reason).await;
        self.open = shared.copy_active(self.id);
        result
    }

    async fn flush_full(&mut self) -> Result<()> {
        if self.buffer.len() < CHUNK_SIZE {
            return Ok(());
        }
        let shared = self.connection()?;
        let data = self.buffer.split();
        let result = shared.copy_write(self.id, &data).await;
        self.restore(&shared, data);
        result
    }

    /// Refresh `open`; keep unsent data if the COPY is still running.
    fn restore(&mut self, shared: &Shared, data: BytesMut) {
        self.open = shared.copy_active(self.id);
        if self.open && self.buffer.is_empty() {
            self.buffer.unsplit(data);
        }
    }

    fn connection(&self) -> Result<Arc<Shared>> {
        if !self.open {
            return Err(Error::AlreadyClosed);
        }
        let shared = self.shared.upgrade().ok_or(Error::UseAfterClose)?;
        if shared.is_closed() {
            return Err(Error::UseAfterClose);
        }
        Ok(shared)
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.abandon_copy(self.id, CopyDirection::In);
        }
    }
}

impl fmt::Debug for TableWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableWriter")
            .field("columns", &self.columns)
            .field("buffered", &self.buffer.len())
            .field("open", &self.open)
            .finish()
    }
}

/// Append one text-format line.
fn write_row(buf: &mut BytesMut, fields: &[Option<String>]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            buf.extend_from_slice(b"\t");
        }
        match field {
            None => buf.extend_from_slice(b"\\N"),
            Some(value) => {
                for b in value.bytes() {
                    match b {
                        b'\\' => buf.extend_from_slice(b"\\\\"),
                        b'\t' => buf.extend_from_slice(b"\\t"),
                        b'\n' => buf.extend_from_slice(b"\\n"),
                        b'\r' => buf.extend_from_slice(b"\\r"),
                        0x08 => buf.extend_from_slice(b"\\b"),
                        0x0b => buf.extend_from_slice(b"\\v"),
                        0x0c => buf.extend_from_slice(b"\\f"),
                        b => buf.extend_from_slice(&[b]),
                    }
                }
            }
        }
    }
    buf.extend_from_slice(b"\n");
}

// ============================================================================
// Reader
// ============================================================================

/// Rows coming out of `COPY ... TO STDOUT`.
///
/// Columns carry no type information, so values decode from their text
/// form the way an untyped text column does. `bytea` values arrive in hex.
pub struct TableReader {
    shared: Weak<Shared>,
    id: u64,
    columns: Arc<[Column]>,
    buffer: BytesMut,
    open: bool,
}

impl TableReader {
    pub(crate) fn new(shared: Weak<Shared>, id: u64, columns: usize) -> Self {
        let columns = (0..columns)
            .map(|_| Column {
                name: String::new(),
                oid: Oid::INVALID,
                format: Format::Text,
            })
            .collect();
        Self {
            shared,
            id,
            columns,
            buffer: BytesMut::new(),
            open: true,
        }
    }

    pub fn columns(&self) -> usize {
        self.columns.len()
    }

    /// `false` once every row has been read or the COPY failed.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The next row, or `None` once the COPY is complete.
    pub async fn next_row(&mut self) -> Result<Option<TableRow>> {
        loop {
            if let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(end + 1);
                let values = parse_row(&line[..end], self.columns.len())?;
                return Ok(Some(TableRow {
                    result: QueryResult::new(self.columns.clone(), vec![values], String::new()),
                }));
            }
            if !self.open {
                if !self.buffer.is_empty() {
                    return Err(Error::Copy("COPY data ends inside a row".to_string()));
                }
                return Ok(None);
            }

            let shared = self.shared.upgrade().ok_or(Error::UseAfterClose)?;
            let chunk = shared.copy_read(self.id).await;
            self.open = shared.copy_active(self.id);
            if let Some(data) = chunk? {
                self.buffer.extend_from_slice(&data);
            }
        }
    }

    /// Read every remaining row into one result.
    pub async fn read_all(&mut self) -> Result<QueryResult> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.extend(row.result.into_rows());
        }
        let tag = format!("COPY {}", rows.len());
        Ok(QueryResult::new(self.columns.clone(), rows, tag))
    }

    /// Decode every remaining row.
    pub async fn to_vec<T: FromRow>(&mut self) -> Result<Vec<T>> {
        self.read_all().await?.to_vec()
    }
}

impl Drop for TableReader {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.abandon_copy(self.id, CopyDirection::Out);
        }
    }
}

impl fmt::Debug for TableReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableReader")
            .field("columns", &self.columns.len())
            .field("open", &self.open)
            .finish()
    }
}

/// One row read by a [`TableReader`].
#[derive(Debug, Clone)]
pub struct TableRow {
    result: QueryResult,
}

impl TableRow {
    pub fn len(&self) -> usize {
        self.result.columns().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self) -> Result<Row<'_>> {
        self.result.at(0)
    }

    pub fn is_null(&self, column: usize) -> Result<bool> {
        Ok(self.row()?.at(column)?.is_null())
    }

    pub fn get<T: FromField>(&self, column: usize) -> Result<T> {
        self.row()?.get(column)
    }

    /// Decode the whole row; the column count must match `T::COLUMNS`.
    pub fn decode<T: FromRow>(&self) -> Result<T> {
        self.row()?.decode()
    }
}

/// Split one line (without its newline) into fields and undo the escapes.
fn parse_row(line: &[u8], columns: usize) -> Result<Vec<Option<Bytes>>> {
    let values: Vec<Option<Bytes>> = line
        .split(|b| *b == b'\t')
        .map(parse_field)
        .collect::<Result<_>>()?;
    if values.len() != columns {
        return Err(Error::Copy(format!(
            "COPY row has {} fields, expected {}",
            values.len(),
            columns
        )));
    }
    Ok(values)
}

fn parse_field(raw: &[u8]) -> Result<Option<Bytes>> {
    if raw == b"\\N" {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        out.push(match bytes.next() {
            Some(b'\\') => b'\\',
            Some(b't') => b'\t',
            Some(b'n') => b'\n',
            Some(b'r') => b'\r',
            Some(b'b') => 0x08,
            Some(b'v') => 0x0b,
            Some(b'f') => 0x0c,
            Some(other) => {
                return Err(Error::Copy(format!(
                    "unsupported escape \\{} in COPY data",
                    *other as char
                )))
            }
            None => return Err(Error::Copy("COPY field ends with a backslash".to_string())),
        });
    }
    Ok(Some(Bytes::from(out)))
}
