//! The per-table merge stage: a bounded window of row sets folds into one
//! compact load task.
//!
//! The fold keeps only the net effect of the window: the last non-delete
//! state per key survives in `insert`, keys that were deleted (or vacated
//! by a key-changing update) land in `delete`. Applying the resulting task
//! is equivalent to replaying the window row by row.

use std::time::Duration;

use deltaload_core::{LoadTask, LoadTaskTx, MergeError, RowKind, RowSet, RowSetRx};
use tokio_util::sync::CancellationToken;

/// Fold one row set into a load task, in arrival order.
pub fn merge_into(task: &mut LoadTask, set: RowSet) {
    for row in set.rows {
        match row.kind {
            RowKind::Insert | RowKind::Update => {
                // A key-changing update vacates the old key first.
                if let Some(old) = row.old_keys {
                    if old != row.keys {
                        task.insert.remove(&old);
                        task.delete.insert(old);
                    }
                }
                task.delete.remove(&row.keys);
                if let Some(tuple) = row.tuple {
                    task.insert.insert(row.keys, tuple);
                }
            }
            RowKind::Delete => {
                task.insert.remove(&row.keys);
                task.delete.insert(row.keys);
            }
        }
    }
    task.callbacks.push(set.callback);
}

/// Per-table merger: waits for a first row set, then folds in more until
/// the window fills or the flush interval expires, and emits the task.
pub struct Merger {
    mapped_table: String,
    window_sets: usize,
    flush_interval: Duration,
}

impl Merger {
    pub fn new(mapped_table: impl Into<String>, window_sets: usize, flush_interval: Duration) -> Self {
        Self {
            mapped_table: mapped_table.into(),
            window_sets: window_sets.max(1),
            flush_interval,
        }
    }

    pub async fn run(
        self,
        mut rx: RowSetRx,
        tx: LoadTaskTx,
        cancel: CancellationToken,
    ) -> Result<(), MergeError> {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                set = rx.recv() => match set {
                    Some(set) => set,
                    None => return Ok(()),
                },
            };

            let mut task = LoadTask::default();
            merge_into(&mut task, first);

            let mut sets = 1;
            let flush = tokio::time::sleep(self.flush_interval);
            tokio::pin!(flush);
            while sets < self.window_sets {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = &mut flush => break,
                    set = rx.recv() => match set {
                        Some(set) => {
                            merge_into(&mut task, set);
                            sets += 1;
                        }
                        None => break,
                    },
                }
            }

            metrics::counter!("deltaload_rows_merged_total", task.change_count() as u64);
            tracing::debug!(
                table = %self.mapped_table,
                inserts = task.insert.len(),
                deletes = task.delete.len(),
                sets,
                "merged load task"
            );
            if tx.send(task).await.is_err() {
                return Err(MergeError::ChannelClosed("load queue"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltaload_core::{AckChain, BatchPosition, CommitCallback, Row};

    fn callback() -> CommitCallback {
        AckChain::new().begin(BatchPosition::default(), 1).remove(0)
    }

    fn row(kind: RowKind, key: &str, value: Option<&str>) -> Row {
        Row {
            kind,
            produce_time: 0,
            origin_table: "src".into(),
            mapped_table: "t".into(),
            keys: format!("\"{key}\""),
            tuple: value.map(|v| format!("\"{key}\"|\"{v}\"")),
            old_keys: None,
        }
    }

    fn set(rows: Vec<Row>) -> RowSet {
        RowSet {
            mapped_table: "t".into(),
            rows,
            callback: callback(),
        }
    }

    fn merged(rows: Vec<Row>) -> LoadTask {
        let mut task = LoadTask::default();
        merge_into(&mut task, set(rows));
        task
    }

    #[test]
    fn insert_then_update_keeps_last_state() {
        let task = merged(vec![
            row(RowKind::Insert, "1", Some("a")),
            row(RowKind::Update, "1", Some("b")),
        ]);
        assert_eq!(task.insert.len(), 1);
        assert_eq!(task.insert[r#""1""#], r#""1"|"b""#);
        assert!(task.delete.is_empty());
    }

    #[test]
    fn insert_then_delete_cancels_out() {
        let task = merged(vec![
            row(RowKind::Insert, "1", Some("a")),
            row(RowKind::Delete, "1", None),
        ]);
        assert!(task.insert.is_empty());
        assert_eq!(task.delete.len(), 1);
        assert!(task.delete.contains(r#""1""#));
    }

    #[test]
    fn key_change_splits_into_delete_and_insert() {
        let mut update = row(RowKind::Update, "2", Some("a"));
        update.old_keys = Some(r#""1""#.into());
        let task = merged(vec![update]);
        assert!(task.delete.contains(r#""1""#));
        assert_eq!(task.insert[r#""2""#], r#""2"|"a""#);
        assert!(!task.delete.contains(r#""2""#));
    }

    #[test]
    fn delete_then_reinsert_rescinds_the_delete() {
        let task = merged(vec![
            row(RowKind::Delete, "1", None),
            row(RowKind::Insert, "1", Some("z")),
        ]);
        assert!(task.delete.is_empty());
        assert_eq!(task.insert[r#""1""#], r#""1"|"z""#);
    }

    #[test]
    fn callbacks_preserve_arrival_order() {
        let chain = AckChain::new();
        let mut first = chain.begin(BatchPosition::default(), 1);
        let mut second = chain.begin(BatchPosition::default(), 1);

        let mut task = LoadTask::default();
        merge_into(
            &mut task,
            RowSet {
                mapped_table: "t".into(),
                rows: vec![row(RowKind::Insert, "1", Some("a"))],
                callback: first.remove(0),
            },
        );
        merge_into(
            &mut task,
            RowSet {
                mapped_table: "t".into(),
                rows: vec![row(RowKind::Insert, "2", Some("b"))],
                callback: second.remove(0),
            },
        );
        assert_eq!(task.callbacks.len(), 2);

        // Firing in stored order drains the chain in arrival order.
        for cb in task.callbacks {
            cb.fire();
        }
        assert!(chain.completed().is_some());
        assert_eq!(chain.in_flight(), 0);
    }

    /// Replaying rows one by one against a model map must equal applying
    /// the merged task.
    #[test]
    fn merge_is_equivalent_to_sequential_replay() {
        use std::collections::HashMap;

        let rows = vec![
            row(RowKind::Insert, "1", Some("a")),
            row(RowKind::Insert, "2", Some("b")),
            row(RowKind::Update, "1", Some("c")),
            row(RowKind::Delete, "2", None),
            row(RowKind::Insert, "3", Some("d")),
            row(RowKind::Delete, "3", None),
            row(RowKind::Insert, "3", Some("e")),
        ];

        // Model: apply row by row.
        let mut model: HashMap<String, String> = HashMap::new();
        for r in &rows {
            match r.kind {
                RowKind::Insert | RowKind::Update => {
                    model.insert(r.keys.clone(), r.tuple.clone().unwrap());
                }
                RowKind::Delete => {
                    model.remove(&r.keys);
                }
            }
        }

        // Merged task applied to an empty target.
        let task = merged(rows);
        let mut target: HashMap<String, String> = HashMap::new();
        for k in &task.delete {
            target.remove(k);
        }
        for (k, v) in &task.insert {
            target.insert(k.clone(), v.clone());
        }
        assert_eq!(target, model);
    }
}
