//! # deltaload core - canonical change model and pipeline plumbing
//!
//! This crate provides the foundational types shared by every deltaload
//! pipeline stage: the canonical [`Row`]/[`LoadTask`] change model, the
//! commit-callback chain that gates upstream offset commits on target
//! commits, the YAML configuration structures, and the error taxonomy.
//!
//! ## Key Components
//!
//! - **Change model**: [`Row`], [`RowSet`] and [`LoadTask`] — one change
//!   event, one per-table batch of changes, one merged delta ready to load
//! - **Ack chain**: [`AckChain`] and [`CommitCallback`] — upstream positions
//!   advance only once every table touched by a poll batch has committed
//! - **Configuration**: YAML-based daemon and per-pipeline specification
//! - **Stage messages**: the record/row batch types flowing between the
//!   consumer, transform, dispatch, merge and load stages

pub mod ack;
pub mod config;
pub mod error;
pub mod row;
pub mod state;
pub mod table;

pub use ack::{AckChain, BatchPosition, CommitCallback, TopicOffset};
pub use config::{Config, MergeConfig, PipelineConfig, TargetConfig, WatchdogConfig};
pub use error::{MergeError, TransformError};
pub use row::{encode_field, encode_tuple, LoadTask, Row, RowKind, RowSet, COPY_DELIMITER};
pub use state::{PipelineState, StateCell};
pub use table::{Column, Table, TableMap};

use tokio::sync::mpsc;

/// One record as pulled off the upstream log broker, before decoding.
///
/// The payload is kept opaque here; the dialect decoders in `deltaload-tx`
/// know how to interpret it. A `None` payload is a tombstone.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// One upstream poll batch: the records plus the position to commit once
/// every table touched by this batch has been loaded.
#[derive(Debug)]
pub struct SourceBatch {
    pub records: Vec<RawRecord>,
    pub position: BatchPosition,
}

/// A decoded poll batch, ready for per-table dispatch.
#[derive(Debug)]
pub struct RowBatch {
    pub rows: Vec<Row>,
    pub position: BatchPosition,
}

/// Sender half of the consumer → transform channel
pub type SourceTx = mpsc::Sender<SourceBatch>;
/// Receiver half of the consumer → transform channel
pub type SourceRx = mpsc::Receiver<SourceBatch>;
/// Sender half of the transform → dispatch channel
pub type RowBatchTx = mpsc::Sender<RowBatch>;
/// Receiver half of the transform → dispatch channel
pub type RowBatchRx = mpsc::Receiver<RowBatch>;
/// Sender half of a per-table dispatch → merge channel
pub type RowSetTx = mpsc::Sender<RowSet>;
/// Receiver half of a per-table dispatch → merge channel
pub type RowSetRx = mpsc::Receiver<RowSet>;
/// Sender half of a per-table merge → load channel
pub type LoadTaskTx = mpsc::Sender<LoadTask>;
/// Receiver half of a per-table merge → load channel
pub type LoadTaskRx = mpsc::Receiver<LoadTask>;
