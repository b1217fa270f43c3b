//! # deltaload transforms - dialect decoding, dispatch and merge
//!
//! The stages between "bytes arrived from the broker" and "a load task is
//! ready for a table":
//!
//! - [`debezium::DebeziumDecoder`] / [`maxwell::MaxwellDecoder`]: one
//!   upstream record → one canonical [`deltaload_core::Row`]
//! - [`transform::Transformer`]: the per-pipeline decode stage
//! - [`dispatch::Dispatcher`]: rows → per-table row sets with sibling
//!   commit callbacks
//! - [`merge::Merger`]: a bounded window of row sets → one compact
//!   [`deltaload_core::LoadTask`]

pub mod debezium;
pub mod decode;
pub mod dispatch;
pub mod maxwell;
pub mod merge;
pub mod transform;

use deltaload_core::{RawRecord, Row, Table, TransformError};

/// Source → target binding for one replicated table.
#[derive(Debug, Clone)]
pub struct TableBinding {
    /// Source-side qualified name (`database.table` or Debezium's
    /// `schema.table` suffix).
    pub origin: String,
    /// Target-side qualified name.
    pub mapped: String,
    /// Target descriptor: ordered columns and key names.
    pub table: Table,
}

/// Decode one upstream record into the canonical row model.
///
/// `Ok(None)` is a benign skip (tombstone, heartbeat, unmapped table);
/// `Err` means the payload is malformed.
pub trait RecordDecoder: Send + Sync {
    fn decode(&self, record: &RawRecord) -> Result<Option<Row>, TransformError>;
}
