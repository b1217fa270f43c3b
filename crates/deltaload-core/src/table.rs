//! Target-side table descriptors, discovered once at startup and read-only
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;

/// One target column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Formatted SQL type, e.g. `numeric(10,2)`. Informational; the COPY
    /// text format does not need it.
    pub type_name: String,
}

/// Descriptor for one mapped target table: ordered columns and ordered
/// primary-key column names.
#[derive(Debug, Clone)]
pub struct Table {
    /// Fully-qualified name, e.g. `analytics.orders`.
    pub name: String,
    pub columns: Vec<Column>,
    pub key_names: Vec<String>,
}

impl Table {
    /// Quoted, comma-separated full column list for COPY statements.
    pub fn column_list(&self) -> String {
        quote_join(self.columns.iter().map(|c| c.name.as_str()))
    }

    /// Quoted, comma-separated key column list.
    pub fn key_list(&self) -> String {
        quote_join(self.key_names.iter().map(|k| k.as_str()))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Mapped-table name → descriptor, built at startup, shared read-only.
pub type TableMap = Arc<HashMap<String, Table>>;

fn quote_join<'a, I: Iterator<Item = &'a str>>(names: I) -> String {
    names
        .map(|n| format!("\"{}\"", n.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(", ")
}
