//! Canonical change model and the target bulk-load text encoding.
//!
//! Every upstream dialect is decoded into [`Row`]; everything downstream of
//! the transform stage works on this one representation. Key and tuple
//! fields are stored pre-encoded in the target's COPY text format so that
//! merging and loading never have to re-serialize values.

use std::collections::{HashMap, HashSet};

use crate::ack::CommitCallback;

/// Kind of a single change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Insert,
    Update,
    Delete,
}

/// One change event in canonical form.
///
/// `keys` and `tuple` are serialized in the COPY text format (see
/// [`encode_tuple`]): re-encoding the same logical values yields
/// byte-identical output, so they double as identity for merging.
#[derive(Debug, Clone)]
pub struct Row {
    pub kind: RowKind,
    /// Upstream event timestamp, epoch milliseconds.
    pub produce_time: i64,
    /// Source-side qualified table name.
    pub origin_table: String,
    /// Target-side qualified table name resolved via the table mapping.
    pub mapped_table: String,
    /// Encoded primary-key tuple. Never empty.
    pub keys: String,
    /// Encoded full row. `None` iff `kind == Delete`.
    pub tuple: Option<String>,
    /// Encoded previous key tuple, set on an update that changed the key.
    pub old_keys: Option<String>,
}

/// An ordered run of rows for one mapped table, closed either on a
/// row-count threshold or on an upstream poll boundary. Carries exactly one
/// commit callback for the batch it belongs to.
#[derive(Debug)]
pub struct RowSet {
    pub mapped_table: String,
    pub rows: Vec<Row>,
    pub callback: CommitCallback,
}

/// A merged delta batch for one mapped table: the unit of work for a loader.
///
/// After merging a window of row sets:
/// - `insert[k]` holds the chronologically last non-delete state of `k`
/// - `delete` holds `k` iff the window deleted `k` or an update moved a row
///   off key `k`
/// - `callbacks` preserves row-set arrival order and is non-empty
#[derive(Debug, Default)]
pub struct LoadTask {
    pub delete: HashSet<String>,
    pub insert: HashMap<String, String>,
    pub callbacks: Vec<CommitCallback>,
}

impl LoadTask {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.insert.is_empty()
    }

    /// Total number of key slots this task will touch on the target.
    pub fn change_count(&self) -> usize {
        self.delete.len() + self.insert.len()
    }
}

/// Field delimiter of the target COPY text format.
pub const COPY_DELIMITER: char = '|';

/// Append one field in COPY text form: NULL is the empty string, everything
/// else is CSV-quoted with `"` and backslash-escaped.
pub fn encode_field(out: &mut String, value: Option<&str>) {
    let Some(v) = value else { return };
    out.push('"');
    for c in v.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

/// Encode an ordered tuple of nullable fields into one COPY text line
/// (without the trailing newline).
pub fn encode_tuple<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut out = String::new();
    let mut first = true;
    for v in values {
        if !first {
            out.push(COPY_DELIMITER);
        }
        first = false;
        encode_field(&mut out, v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_plain_fields() {
        let line = encode_tuple([Some("1"), Some("a")]);
        assert_eq!(line, r#""1"|"a""#);
    }

    #[test]
    fn encode_null_is_empty() {
        let line = encode_tuple([Some("1"), None, Some("z")]);
        assert_eq!(line, r#""1"||"z""#);
    }

    #[test]
    fn encode_escapes_quote_and_backslash() {
        let line = encode_tuple([Some(r#"say "hi""#), Some(r"c:\tmp")]);
        assert_eq!(line, r#""say \"hi\""|"c:\\tmp""#);
    }

    #[test]
    fn encode_keeps_delimiter_inside_quotes() {
        // The delimiter needs no escaping: quoting already protects it.
        let line = encode_tuple([Some("a|b")]);
        assert_eq!(line, r#""a|b""#);
    }

    #[test]
    fn encoding_is_stable() {
        let a = encode_tuple([Some("42"), Some("x"), None]);
        let b = encode_tuple([Some("42"), Some("x"), None]);
        assert_eq!(a, b);
    }
}
