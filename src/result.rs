//! Query results.
//!
//! A [`QueryResult`] owns the rows returned by one `execute` call. [`Row`]
//! and [`Field`] are borrowed views into it; decoding happens on access via
//! [`FromField`] and [`FromRow`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, LinkedList, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::FieldDescription;
use crate::types::{FieldValue, Format, FromField, FromRow, Oid};

/// Column metadata from the row description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub oid: Oid,
    pub format: Format,
}

impl From<FieldDescription> for Column {
    fn from(field: FieldDescription) -> Self {
        Self {
            name: field.name,
            oid: field.type_oid,
            format: field.format,
        }
    }
}

/// Rows and metadata produced by one statement.
#[derive(Clone)]
pub struct QueryResult {
    columns: Arc<[Column]>,
    rows: Vec<Vec<Option<Bytes>>>,
    command_tag: String,
}

impl QueryResult {
    pub(crate) fn new(
        columns: Arc<[Column]>,
        rows: Vec<Vec<Option<Bytes>>>,
        command_tag: String,
    ) -> Self {
        Self {
            columns,
            rows,
            command_tag,
        }
    }

    pub(crate) fn into_rows(self) -> Vec<Vec<Option<Bytes>>> {
        self.rows
    }

    /// Result of a statement that returned no row description.
    pub(crate) fn without_rows(command_tag: String) -> Self {
        Self::new(Arc::from(Vec::new()), Vec::new(), command_tag)
    }

    /// Number of rows.
    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Position of the column called `name`. Names are case-sensitive.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        find_column(&self.columns, name)
    }

    pub fn at(&self, index: usize) -> Result<Row<'_>> {
        if index >= self.rows.len() {
            return Err(Error::Range {
                index,
                size: self.rows.len(),
            });
        }
        Ok(Row {
            result: self,
            index,
            offset: 0,
            width: self.columns.len(),
        })
    }

    pub fn iter(&self) -> Rows<'_> {
        Rows {
            result: self,
            next: 0,
        }
    }

    /// Command tag, e.g. `INSERT 0 3`.
    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// Rows affected as reported by the command tag, 0 if it carries no count.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    /// Decode the only row. Fails unless exactly one row was returned.
    pub fn one<T: FromRow>(&self) -> Result<T> {
        if self.rows.len() != 1 {
            return Err(Error::UnexpectedRowCount {
                expected: "exactly one",
                actual: self.rows.len(),
            });
        }
        self.at(0)?.decode()
    }

    /// Decode the row if there is one. Fails on more than one row.
    pub fn optional<T: FromRow>(&self) -> Result<Option<T>> {
        match self.rows.len() {
            0 => Ok(None),
            1 => self.at(0)?.decode().map(Some),
            actual => Err(Error::UnexpectedRowCount {
                expected: "at most one",
                actual,
            }),
        }
    }

    /// Decode every row into a container, in row order.
    ///
    /// ```ignore
    /// let ids: BTreeSet<i64> = result.collect()?;
    /// let names: HashMap<i32, String> = result.collect()?;
    /// ```
    pub fn collect<C, T>(&self) -> Result<C>
    where
        C: RowContainer<T>,
        T: FromRow,
    {
        let mut container = C::default();
        container.reserve_rows(self.rows.len());
        for row in self.iter() {
            container.push_row(row.decode()?);
        }
        Ok(container)
    }

    pub fn to_vec<T: FromRow>(&self) -> Result<Vec<T>> {
        self.collect()
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("columns", &self.columns)
            .field("rows", &self.rows.len())
            .field("command_tag", &self.command_tag)
            .finish()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = Row<'a>;
    type IntoIter = Rows<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the rows of a [`QueryResult`].
pub struct Rows<'a> {
    result: &'a QueryResult,
    next: usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = Row<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.result.at(self.next).ok()?;
        self.next += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.result.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Rows<'_> {}

/// Parse the row count from a command tag.
///
/// `INSERT 0 5` → 5, `UPDATE 3` → 3, `SELECT 10` → 10, `CREATE TABLE` → 0.
pub(crate) fn parse_rows_affected(tag: &str) -> u64 {
    let mut words = tag.split_whitespace();
    match words.next() {
        Some("INSERT") => words.nth(1),
        Some(_) => words.next(),
        None => None,
    }
    .and_then(|n| n.parse().ok())
    .unwrap_or(0)
}

fn find_column(columns: &[Column], name: &str) -> Result<usize> {
    let mut matches = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.name == name)
        .map(|(i, _)| i);
    match (matches.next(), matches.next()) {
        (Some(i), None) => Ok(i),
        (Some(_), Some(_)) => Err(Error::AmbiguousColumn(name.to_string())),
        (None, _) => Err(Error::UnknownColumn(name.to_string())),
    }
}

// ============================================================================
// Row
// ============================================================================

/// A window of consecutive columns of one row.
#[derive(Clone, Copy)]
pub struct Row<'a> {
    result: &'a QueryResult,
    index: usize,
    offset: usize,
    width: usize,
}

impl<'a> Row<'a> {
    /// Row number within the result.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of columns in this view.
    pub fn len(&self) -> usize {
        self.width
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0
    }

    pub fn columns(&self) -> &'a [Column] {
        &self.result.columns[self.offset..self.offset + self.width]
    }

    pub fn at<I: ColumnIndex>(&self, column: I) -> Result<Field<'a>> {
        let position = column.position(self.columns())?;
        Ok(Field {
            column: &self.result.columns[self.offset + position],
            data: self.result.rows[self.index]
                .get(self.offset + position)
                .and_then(Option::as_deref),
        })
    }

    pub fn get<T: FromField, I: ColumnIndex>(&self, column: I) -> Result<T> {
        self.at(column)?.get()
    }

    /// Decode the whole view. The column count must match `T::COLUMNS`.
    pub fn decode<T: FromRow>(&self) -> Result<T> {
        if T::COLUMNS != self.width {
            return Err(Error::decode(format!(
                "row has {} columns but {} expects {}",
                self.width,
                std::any::type_name::<T>(),
                T::COLUMNS
            )));
        }
        T::from_row(self)
    }

    /// Sub-view of `len` columns starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Row<'a>> {
        if offset + len > self.width {
            return Err(Error::Range {
                index: offset + len,
                size: self.width,
            });
        }
        Ok(Row {
            offset: self.offset + offset,
            width: len,
            ..*self
        })
    }

    pub fn fields(&self) -> impl Iterator<Item = Field<'a>> + '_ {
        (0..self.width).filter_map(move |i| self.at(i).ok())
    }
}

impl fmt::Debug for Row<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.fields()).finish()
    }
}

/// Column lookup by position or by name.
pub trait ColumnIndex {
    fn position(&self, columns: &[Column]) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn position(&self, columns: &[Column]) -> Result<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(Error::Range {
                index: *self,
                size: columns.len(),
            })
        }
    }
}

impl ColumnIndex for &str {
    fn position(&self, columns: &[Column]) -> Result<usize> {
        find_column(columns, self)
    }
}

impl ColumnIndex for String {
    fn position(&self, columns: &[Column]) -> Result<usize> {
        find_column(columns, self)
    }
}

impl ColumnIndex for &String {
    fn position(&self, columns: &[Column]) -> Result<usize> {
        find_column(columns, self)
    }
}

// ============================================================================
// Field
// ============================================================================

/// One column of one row.
#[derive(Clone, Copy)]
pub struct Field<'a> {
    column: &'a Column,
    data: Option<&'a [u8]>,
}

impl<'a> Field<'a> {
    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    pub fn get<T: FromField>(&self) -> Result<T> {
        T::from_field(self.value())
    }

    pub fn name(&self) -> &'a str {
        &self.column.name
    }

    pub fn oid(&self) -> Oid {
        self.column.oid
    }

    pub fn format(&self) -> Format {
        self.column.format
    }

    /// Raw wire bytes, `None` for NULL.
    pub fn raw(&self) -> Option<&'a [u8]> {
        self.data
    }

    fn value(&self) -> FieldValue<'a> {
        FieldValue::new(self.column.oid, self.column.format, self.data)
    }
}

impl fmt::Debug for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Field");
        s.field("name", &self.column.name).field("oid", &self.column.oid);
        match (self.data, self.column.format) {
            (None, _) => s.field("value", &"NULL"),
            (Some(data), Format::Text) => s.field("value", &String::from_utf8_lossy(data)),
            (Some(data), Format::Binary) => s.field("value", &data),
        };
        s.finish()
    }
}

// ============================================================================
// Containers
// ============================================================================

/// Target of [`QueryResult::collect`].
///
/// `reserve_rows` is a sizing hint; containers that cannot pre-size ignore
/// it. Either way rows arrive in result order.
pub trait RowContainer<T>: Default {
    fn reserve_rows(&mut self, _rows: usize) {}

    fn push_row(&mut self, item: T);
}

impl<T> RowContainer<T> for Vec<T> {
    fn reserve_rows(&mut self, rows: usize) {
        self.reserve(rows);
    }

    fn push_row(&mut self, item: T) {
        self.push(item);
    }
}

impl<T> RowContainer<T> for VecDeque<T> {
    fn reserve_rows(&mut self, rows: usize) {
        self.reserve(rows);
    }

    fn push_row(&mut self, item: T) {
        self.push_back(item);
    }
}

impl<T: Eq + Hash> RowContainer<T> for HashSet<T> {
    fn reserve_rows(&mut self, rows: usize) {
        self.reserve(rows);
    }

    fn push_row(&mut self, item: T) {
        self.insert(item);
    }
}

impl<K: Eq + Hash, V> RowContainer<(K, V)> for HashMap<K, V> {
    fn reserve_rows(&mut self, rows: usize) {
        self.reserve(rows);
    }

    fn push_row(&mut self, (key, value): (K, V)) {
        self.insert(key, value);
    }
}

impl<T: Ord> RowContainer<T> for BTreeSet<T> {
    fn push_row(&mut self, item: T) {
        self.insert(item);
    }
}

impl<K: Ord, V> RowContainer<(K, V)> for BTreeMap<K, V> {
    fn push_row(&mut self, (key, value): (K, V)) {
        self.insert(key, value);
    }
}

impl<T> RowContainer<T> for LinkedList<T> {
    fn push_row(&mut self, item: T) {
        self.push_back(item);
    }
}
