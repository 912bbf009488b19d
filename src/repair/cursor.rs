//! Transient row view handed to progress callbacks
//!
//! A [`RepairCursor`] borrows the row being emitted, so it cannot outlive
//! the callback invocation it was passed to.

use std::borrow::Cow;

use rusqlite::types::{Type, Value};

/// A row recovered from a table leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredRow {
    pub(crate) rowid: i64,
    pub(crate) values: Vec<Value>,
    pub(crate) truncated: bool,
}

impl RecoveredRow {
    pub fn rowid(&self) -> i64 {
        self.rowid
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Read-only view over the current row.
///
/// Getters follow the engine's conversion rules: a missing column reads as
/// NULL, NULL reads as 0 / 0.0 / `None`, and numbers read as text in their
/// decimal form.
#[derive(Debug, Clone, Copy)]
pub struct RepairCursor<'r> {
    row: &'r RecoveredRow,
}

impl<'r> RepairCursor<'r> {
    pub(crate) fn new(row: &'r RecoveredRow) -> Self {
        Self { row }
    }

    pub fn column_count(&self) -> usize {
        self.row.values.len()
    }

    fn value(&self, column: usize) -> &'r Value {
        const NULL: &Value = &Value::Null;
        self.row.values.get(column).unwrap_or(NULL)
    }

    pub fn column_type(&self, column: usize) -> Type {
        match self.value(column) {
            Value::Null => Type::Null,
            Value::Integer(_) => Type::Integer,
            Value::Real(_) => Type::Real,
            Value::Text(_) => Type::Text,
            Value::Blob(_) => Type::Blob,
        }
    }

    pub fn is_null(&self, column: usize) -> bool {
        matches!(self.value(column), Value::Null)
    }

    pub fn get_i64(&self, column: usize) -> i64 {
        match self.value(column) {
            Value::Integer(i) => *i,
            Value::Real(f) => *f as i64,
            Value::Text(s) => leading_number(s) as i64,
            Value::Blob(b) => leading_number(&String::from_utf8_lossy(b)) as i64,
            Value::Null => 0,
        }
    }

    pub fn get_f64(&self, column: usize) -> f64 {
        match self.value(column) {
            Value::Integer(i) => *i as f64,
            Value::Real(f) => *f,
            Value::Text(s) => leading_number(s),
            Value::Blob(b) => leading_number(&String::from_utf8_lossy(b)),
            Value::Null => 0.0,
        }
    }

    pub fn get_string(&self, column: usize) -> Option<Cow<'r, str>> {
        match self.value(column) {
            Value::Null => None,
            Value::Integer(i) => Some(Cow::Owned(i.to_string())),
            Value::Real(f) => Some(Cow::Owned(f.to_string())),
            Value::Text(s) => Some(Cow::Borrowed(s.as_str())),
            Value::Blob(b) => Some(String::from_utf8_lossy(b)),
        }
    }

    pub fn get_blob(&self, column: usize) -> Option<Cow<'r, [u8]>> {
        match self.value(column) {
            Value::Null => None,
            Value::Integer(i) => Some(Cow::Owned(i.to_string().into_bytes())),
            Value::Real(f) => Some(Cow::Owned(f.to_string().into_bytes())),
            Value::Text(s) => Some(Cow::Borrowed(s.as_bytes())),
            Value::Blob(b) => Some(Cow::Borrowed(b.as_slice())),
        }
    }

    pub fn rowid(&self) -> i64 {
        self.row.rowid
    }

    /// True when an overflow chain ended early and trailing data is missing.
    pub fn is_truncated(&self) -> bool {
        self.row.truncated
    }
}

/// Longest numeric prefix of `text`, or 0.
///
/// Accepts an optional sign, digits with at most one point, and an
/// exponent only when digits follow it. Words such as "inf" are not
/// numbers here.
fn leading_number(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let int_end = digits_from(end);
    let mut mantissa_digits = int_end - end;
    end = int_end;
    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        mantissa_digits += frac_end - (end + 1);
        end = frac_end;
    }
    if mantissa_digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e') | Some(b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+') | Some(b'-')) {
            exp += 1;
        }
        let exp_end = digits_from(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }
    trimmed[..end].parse().unwrap_or(0.0)
}
