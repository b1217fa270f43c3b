//! # deltaload io - broker and target plumbing
//!
//! The edges of the pipeline: the Kafka consumer feeding poll batches in,
//! and the target-side machinery applying merged load tasks — a fixed
//! connection pool with analytic planner settings, startup table-metadata
//! discovery, and the COPY + delete-exists change loader with its adaptive
//! optimistic/pessimistic insert strategy.

pub mod error;
pub mod loader;
pub mod pool;
pub mod source_kafka;
pub mod table_meta;

pub use error::LoadError;
pub use loader::{ChangeLoader, LoadMode};
pub use pool::{ConnectionPool, PooledConn};
pub use source_kafka::KafkaSource;
