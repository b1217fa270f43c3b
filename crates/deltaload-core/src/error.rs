//! Error taxonomy for the transform and merge stages.
//!
//! Load-side errors live in `deltaload-io` next to the driver types they
//! wrap. A [`TransformError`] is recoverable (the record is skipped with a
//! warning and its callback share still fires); a [`MergeError`] is not —
//! the pipeline degrades and then stops.

use thiserror::Error;

/// A malformed upstream change record.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed change record: {0}")]
    Malformed(String),

    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown change operation `{0}`")]
    UnknownOp(String),

    #[error("cannot decode column `{column}`: {reason}")]
    BadValue { column: String, reason: String },

    #[error("change for `{table}` produced an empty key tuple")]
    EmptyKey { table: String },
}

/// A failure observed while folding row sets into a load task.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("merge input channel closed: {0}")]
    ChannelClosed(&'static str),
}
