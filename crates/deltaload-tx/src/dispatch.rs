//! The per-pipeline dispatch stage: rows → per-table row sets.
//!
//! Each poll batch yields at most one row set per mapped table; the batch
//! registers one ack group whose sibling callbacks ride on those row sets.
//! Row sets close at the poll boundary — the poll itself is already capped
//! at the configured row threshold, so both close conditions collapse into
//! one here.

use std::collections::HashMap;
use std::sync::Arc;

use deltaload_core::{AckChain, Row, RowBatchRx, RowSet, RowSetTx};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct Dispatcher {
    pipeline: String,
    outs: HashMap<String, RowSetTx>,
    chain: Arc<AckChain>,
}

impl Dispatcher {
    pub fn new(
        pipeline: impl Into<String>,
        outs: HashMap<String, RowSetTx>,
        chain: Arc<AckChain>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            outs,
            chain,
        }
    }

    pub async fn run(self, mut rx: RowBatchRx, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                b = rx.recv() => match b {
                    Some(b) => b,
                    None => return Ok(()),
                },
            };

            // Partition by mapped table, preserving arrival order within
            // each table.
            let mut groups: Vec<(String, Vec<Row>)> = Vec::new();
            let mut index: HashMap<String, usize> = HashMap::new();
            for row in batch.rows {
                match index.get(&row.mapped_table) {
                    Some(&i) => groups[i].1.push(row),
                    None => {
                        index.insert(row.mapped_table.clone(), groups.len());
                        groups.push((row.mapped_table.clone(), vec![row]));
                    }
                }
            }
            groups.retain(|(table, rows)| {
                if self.outs.contains_key(table) {
                    true
                } else {
                    warn!(
                        pipeline = %self.pipeline,
                        table = %table,
                        "dropping {} rows: no merger for table",
                        rows.len()
                    );
                    false
                }
            });

            // One sibling callback per table touched; a batch that decoded
            // to nothing completes immediately so its offset still commits.
            let callbacks = self.chain.begin(batch.position, groups.len());
            for ((table, rows), callback) in groups.into_iter().zip(callbacks) {
                let set = RowSet {
                    mapped_table: table.clone(),
                    rows,
                    callback,
                };
                if self.outs[&table].send(set).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltaload_core::{BatchPosition, RowBatch, RowKind, TopicOffset};
    use tokio::sync::mpsc;

    fn row(table: &str, key: &str) -> Row {
        Row {
            kind: RowKind::Insert,
            produce_time: 0,
            origin_table: "src".into(),
            mapped_table: table.into(),
            keys: format!("\"{key}\""),
            tuple: Some(format!("\"{key}\"|\"v\"")),
            old_keys: None,
        }
    }

    fn pos(offset: i64) -> BatchPosition {
        BatchPosition(vec![TopicOffset {
            topic: "t".into(),
            partition: 0,
            offset,
        }])
    }

    #[tokio::test]
    async fn one_row_set_per_table_with_sibling_callbacks() {
        let (set_tx1, mut set_rx1) = mpsc::channel(4);
        let (set_tx2, mut set_rx2) = mpsc::channel(4);
        let mut outs = HashMap::new();
        outs.insert("t1".to_string(), set_tx1);
        outs.insert("t2".to_string(), set_tx2);

        let chain = Arc::new(AckChain::new());
        let dispatcher = Dispatcher::new("p", outs, Arc::clone(&chain));
        let (batch_tx, batch_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(batch_rx, cancel.clone()));

        batch_tx
            .send(RowBatch {
                rows: vec![row("t1", "1"), row("t2", "2"), row("t1", "3")],
                position: pos(10),
            })
            .await
            .unwrap();

        let s1 = set_rx1.recv().await.unwrap();
        let s2 = set_rx2.recv().await.unwrap();
        assert_eq!(s1.rows.len(), 2);
        assert_eq!(s2.rows.len(), 1);

        // Offset advances only after both siblings fire.
        s1.callback.fire();
        assert_eq!(chain.completed(), None);
        s2.callback.fire();
        assert_eq!(chain.completed(), Some(pos(10)));

        drop(batch_tx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_batch_advances_offset() {
        let (set_tx, _set_rx) = mpsc::channel(4);
        let mut outs = HashMap::new();
        outs.insert("t1".to_string(), set_tx);

        let chain = Arc::new(AckChain::new());
        let dispatcher = Dispatcher::new("p", outs, Arc::clone(&chain));
        let (batch_tx, batch_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(batch_rx, cancel.clone()));

        batch_tx
            .send(RowBatch {
                rows: vec![],
                position: pos(3),
            })
            .await
            .unwrap();
        drop(batch_tx);
        handle.await.unwrap().unwrap();

        assert_eq!(chain.completed(), Some(pos(3)));
    }
}
