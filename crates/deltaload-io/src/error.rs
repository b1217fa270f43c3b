//! Load-side error taxonomy.

use thiserror::Error;

/// Failure while applying a load task to the target.
///
/// `DuplicateKey` is the one recoverable case: an optimistic loader flips
/// to pessimistic mode and retries the task. Everything else is fatal for
/// the task, closes the borrowed connection and bubbles to the watchdog.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("duplicate key on bulk insert: {0}")]
    DuplicateKey(String),

    #[error("bulk copy failed: {0}")]
    CopyIo(tokio_postgres::Error),

    #[error("copy pipe failed: {0}")]
    PipeIo(String),

    #[error("commit failed: {0}")]
    CommitFailed(tokio_postgres::Error),

    #[error("no target connection available")]
    NoConnection,

    #[error("target statement failed: {0}")]
    Db(#[from] tokio_postgres::Error),
}
