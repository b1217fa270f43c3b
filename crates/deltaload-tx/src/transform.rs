//! The per-pipeline transform stage: raw records in, canonical rows out.

use std::sync::Arc;

use deltaload_core::{RowBatch, RowBatchTx, SourceRx};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::RecordDecoder;

pub struct Transformer {
    pipeline: String,
    decoder: Arc<dyn RecordDecoder>,
}

impl Transformer {
    pub fn new(pipeline: impl Into<String>, decoder: Arc<dyn RecordDecoder>) -> Self {
        Self {
            pipeline: pipeline.into(),
            decoder,
        }
    }

    /// Decode every record of every incoming poll batch. A malformed record
    /// is skipped with a warning — its batch still flows on, so the
    /// batch's callbacks fire and the offset advances past it.
    pub async fn run(
        self,
        mut rx: SourceRx,
        tx: RowBatchTx,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                b = rx.recv() => match b {
                    Some(b) => b,
                    None => return Ok(()),
                },
            };

            let mut rows = Vec::with_capacity(batch.records.len());
            for record in &batch.records {
                match self.decoder.decode(record) {
                    Ok(Some(row)) => rows.push(row),
                    Ok(None) => {
                        metrics::counter!("deltaload_records_skipped_total", 1);
                    }
                    Err(e) => {
                        warn!(
                            pipeline = %self.pipeline,
                            topic = %record.topic,
                            offset = record.offset,
                            "skipping malformed record: {e}"
                        );
                        metrics::counter!("deltaload_records_malformed_total", 1);
                    }
                }
            }
            metrics::counter!("deltaload_rows_transformed_total", rows.len() as u64);

            let out = RowBatch {
                rows,
                position: batch.position,
            };
            if tx.send(out).await.is_err() {
                return Ok(());
            }
        }
    }
}
