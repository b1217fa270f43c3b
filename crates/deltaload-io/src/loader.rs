//! The per-table change loader: applies one merged load task to the target
//! inside a single transaction using COPY + delete-exists, fires the
//! task's callbacks in order, and returns the connection to the pool.
//!
//! Insert strategy is adaptive. In optimistic mode only the explicit
//! delete set is applied before the bulk insert; a duplicate-key failure
//! rolls the transaction back, flips the loader to pessimistic mode and
//! retries the task with every insert key added to the delete set. The
//! loader flips back to optimistic once a pessimistic delete phase shows
//! no extra collisions (affected rows equal to the explicit delete count).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use deltaload_core::{LoadTask, LoadTaskRx, Table};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{SimpleQueryMessage, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::pool::{ConnectionPool, PooledConn};

const SLOW_DELETE: Duration = Duration::from_secs(10);
const PIPE_DEPTH: usize = 16;
const CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Optimistic,
    Pessimistic,
}

pub struct ChangeLoader {
    table: Table,
    quoted_target: String,
    temp_table: String,
    pool: Arc<ConnectionPool>,
    mode: LoadMode,
    /// Process-wide loaded-batch counter, sampled by the watchdog.
    progress: Arc<AtomicU64>,
}

impl ChangeLoader {
    pub fn new(table: Table, pool: Arc<ConnectionPool>, progress: Arc<AtomicU64>) -> Self {
        let quoted_target = quote_qualified(&table.name);
        let temp_table = temp_table_name(&table.name);
        Self {
            table,
            quoted_target,
            temp_table,
            pool,
            mode: LoadMode::Optimistic,
            progress,
        }
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    pub async fn run(
        mut self,
        mut rx: LoadTaskRx,
        cancel: CancellationToken,
    ) -> Result<(), LoadError> {
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                t = rx.recv() => match t {
                    Some(t) => t,
                    None => return Ok(()),
                },
            };
            self.apply(task, &cancel).await?;
        }
    }

    /// Apply one task: borrow, load, commit, fire callbacks, return the
    /// connection. A failed task closes the connection instead.
    pub async fn apply(
        &mut self,
        task: LoadTask,
        cancel: &CancellationToken,
    ) -> Result<(), LoadError> {
        let mut conn = self.pool.borrow().await?;
        match self.apply_on(&mut conn, &task, cancel).await {
            Ok(()) => {
                metrics::counter!("deltaload_rows_loaded_total", task.change_count() as u64);
                metrics::counter!("deltaload_batches_loaded_total", 1);
                self.progress.fetch_add(1, Ordering::Relaxed);
                for cb in task.callbacks {
                    cb.fire();
                }
                self.pool.put(conn);
                Ok(())
            }
            Err(e) => {
                self.pool.discard(conn);
                Err(e)
            }
        }
    }

    async fn apply_on(
        &mut self,
        conn: &mut PooledConn,
        task: &LoadTask,
        cancel: &CancellationToken,
    ) -> Result<(), LoadError> {
        self.ensure_temp_table(conn).await?;
        match self.attempt(conn, task, self.mode, cancel).await {
            Ok(flip_back) => {
                if flip_back && self.mode == LoadMode::Pessimistic {
                    info!(table = %self.table.name, "no collisions left, back to optimistic loads");
                    self.mode = LoadMode::Optimistic;
                }
                Ok(())
            }
            Err(LoadError::DuplicateKey(detail)) if self.mode == LoadMode::Optimistic => {
                warn!(
                    table = %self.table.name,
                    "duplicate key on optimistic insert ({detail}), retrying pessimistically"
                );
                metrics::counter!("deltaload_mode_flips_total", 1);
                self.mode = LoadMode::Pessimistic;
                let flip_back = self
                    .attempt(conn, task, LoadMode::Pessimistic, cancel)
                    .await?;
                if flip_back {
                    self.mode = LoadMode::Optimistic;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One transactional attempt. Returns whether a pessimistic delete
    /// phase earned the flip back to optimistic mode.
    async fn attempt(
        &self,
        conn: &mut PooledConn,
        task: &LoadTask,
        mode: LoadMode,
        cancel: &CancellationToken,
    ) -> Result<bool, LoadError> {
        let explicit_deletes = task.delete.len();
        let mut delete_keys: Vec<&String> = task.delete.iter().collect();
        if mode == LoadMode::Pessimistic {
            // Delete-for-all-affected-keys: clear the way for every insert.
            for k in task.insert.keys() {
                if !task.delete.contains(k) {
                    delete_keys.push(k);
                }
            }
        }

        let tx = conn.client.transaction().await?;
        let mut flip_back = false;

        if !delete_keys.is_empty() {
            let copy_sql = copy_into_sql(&self.temp_table, &self.table.key_list());
            let lines: Vec<String> = delete_keys.iter().map(|k| (*k).clone()).collect();
            copy_stream(&tx, &copy_sql, lines, cancel).await?;

            let delete_sql = delete_exists_sql(&self.quoted_target, &self.temp_table, &self.table);
            let started = Instant::now();
            let affected = tx.execute(delete_sql.as_str(), &[]).await?;
            if started.elapsed() > SLOW_DELETE {
                explain_slow_delete(&tx, &delete_sql, started.elapsed()).await;
            }
            flip_back = flip_back_after_delete(mode, affected as usize, explicit_deletes);
        }

        if !task.insert.is_empty() {
            let copy_sql = copy_into_sql(&self.quoted_target, &self.table.column_list());
            let lines: Vec<String> = task.insert.values().cloned().collect();
            match copy_stream(&tx, &copy_sql, lines, cancel).await {
                Ok(_) => {}
                Err(LoadError::CopyIo(e)) if is_duplicate_key(&e) => {
                    // Leave the session clean for the pessimistic retry.
                    let _ = tx.rollback().await;
                    return Err(LoadError::DuplicateKey(e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit().await.map_err(LoadError::CommitFailed)?;
        Ok(flip_back)
    }

    /// Create the per-connection temp table on first use, in its own
    /// autocommit window, and remember it on the connection.
    async fn ensure_temp_table(&self, conn: &mut PooledConn) -> Result<(), LoadError> {
        if conn.has_temp_table(&self.temp_table) {
            return Ok(());
        }
        let sql = format!(
            "CREATE TEMP TABLE {} ON COMMIT DELETE ROWS AS SELECT * FROM {} LIMIT 0;",
            self.temp_table, self.quoted_target
        );
        conn.client.batch_execute(&sql).await?;
        conn.mark_temp_table(self.temp_table.clone());
        debug!(table = %self.table.name, temp = %self.temp_table, "created temp key table");
        Ok(())
    }
}

/// Pessimistic flip-back: the delete phase touched exactly the explicit
/// delete set, so the insert keys had no surviving collisions.
fn flip_back_after_delete(mode: LoadMode, affected: usize, explicit_deletes: usize) -> bool {
    mode == LoadMode::Pessimistic && affected == explicit_deletes
}

fn is_duplicate_key(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

/// `schema.table` → `"schema"."table"`.
fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(|p| format!("\"{}\"", p.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Session temp table holding the delete key set for one target table.
fn temp_table_name(target: &str) -> String {
    let sanitized: String = target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("dl_tmp_{sanitized}")
}

fn copy_into_sql(target: &str, columns: &str) -> String {
    format!(
        "COPY {target} ({columns}) FROM STDIN WITH DELIMITER '|' NULL '' CSV QUOTE '\"' ESCAPE E'\\\\'"
    )
}

fn delete_exists_sql(quoted_target: &str, temp_table: &str, table: &Table) -> String {
    let conditions = table
        .key_names
        .iter()
        .map(|k| {
            let k = format!("\"{}\"", k.replace('"', "\"\""));
            format!("{quoted_target}.{k} = {temp_table}.{k}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "DELETE FROM {quoted_target} WHERE EXISTS (SELECT 1 FROM {temp_table} WHERE {conditions})"
    )
}

/// Diagnostic only: log the plan of a delete that ran long. An empty or
/// failing EXPLAIN never fails the task.
async fn explain_slow_delete(tx: &Transaction<'_>, delete_sql: &str, took: Duration) {
    match tx.simple_query(&format!("EXPLAIN {delete_sql}")).await {
        Ok(messages) => {
            let plan: Vec<String> = messages
                .iter()
                .filter_map(|m| match m {
                    SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
                    _ => None,
                })
                .collect();
            if plan.is_empty() {
                debug!("slow delete ({took:?}) produced an empty plan");
            } else {
                warn!("slow delete ({took:?}), plan:\n{}", plan.join("\n"));
            }
        }
        Err(e) => debug!("explain for slow delete failed: {e}"),
    }
}

/// Spawn the COPY text producer: joins encoded lines into chunks and
/// feeds them through the bounded in-process pipe. The producer closes
/// its end by returning; a dropped receiver surfaces as `PipeIo`.
fn spawn_copy_producer(
    lines: Vec<String>,
) -> (JoinHandle<Result<(), LoadError>>, mpsc::Receiver<Bytes>) {
    let (pipe_tx, pipe_rx) = mpsc::channel::<Bytes>(PIPE_DEPTH);
    let handle = tokio::spawn(async move {
        let mut buf = String::new();
        for line in &lines {
            buf.push_str(line);
            buf.push('\n');
            if buf.len() >= CHUNK_BYTES {
                let chunk = Bytes::from(std::mem::take(&mut buf));
                if pipe_tx.send(chunk).await.is_err() {
                    return Err(LoadError::PipeIo("copy pipe receiver dropped".into()));
                }
            }
        }
        if !buf.is_empty() && pipe_tx.send(Bytes::from(buf)).await.is_err() {
            return Err(LoadError::PipeIo("copy pipe receiver dropped".into()));
        }
        Ok(())
    });
    (handle, pipe_rx)
}

/// Stream encoded lines through the pipe into a COPY-from-STDIN sink.
///
/// The consumer side polls the stop flag between chunks — the single
/// cancellation point inside a task. Whatever happens, the producer handle
/// is awaited before this returns, so both halves always terminate; a
/// producer error is re-raised only after the sink side has wound down.
async fn copy_stream(
    tx: &Transaction<'_>,
    sql: &str,
    lines: Vec<String>,
    cancel: &CancellationToken,
) -> Result<u64, LoadError> {
    let (producer, mut pipe_rx) = spawn_copy_producer(lines);

    let mut sink = match tx.copy_in(sql).await {
        Ok(s) => Box::pin(s),
        Err(e) => {
            pipe_rx.close();
            let _ = producer.await;
            return Err(LoadError::CopyIo(e));
        }
    };

    let mut copy_err = None;
    let mut cancelled = false;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            c = pipe_rx.recv() => match c {
                Some(c) => c,
                None => break,
            },
        };
        if let Err(e) = sink.as_mut().send(chunk).await {
            copy_err = Some(e);
            break;
        }
    }

    pipe_rx.close();
    let producer_result = producer.await;

    if let Some(e) = copy_err {
        return Err(LoadError::CopyIo(e));
    }
    if cancelled {
        return Err(LoadError::PipeIo("stopped during copy".into()));
    }
    match producer_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(join) => return Err(LoadError::PipeIo(format!("copy producer died: {join}"))),
    }
    sink.as_mut().finish().await.map_err(LoadError::CopyIo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltaload_core::Column;

    fn orders() -> Table {
        Table {
            name: "analytics.orders".into(),
            columns: vec![
                Column {
                    name: "id".into(),
                    type_name: "bigint".into(),
                },
                Column {
                    name: "note".into(),
                    type_name: "text".into(),
                },
            ],
            key_names: vec!["id".into()],
        }
    }

    #[test]
    fn copy_statement_shape() {
        let sql = copy_into_sql("\"analytics\".\"orders\"", "\"id\", \"note\"");
        assert_eq!(
            sql,
            "COPY \"analytics\".\"orders\" (\"id\", \"note\") FROM STDIN \
             WITH DELIMITER '|' NULL '' CSV QUOTE '\"' ESCAPE E'\\\\'"
        );
    }

    #[test]
    fn delete_exists_statement_shape() {
        let t = orders();
        let sql = delete_exists_sql("\"analytics\".\"orders\"", "dl_tmp_analytics_orders", &t);
        assert_eq!(
            sql,
            "DELETE FROM \"analytics\".\"orders\" WHERE EXISTS \
             (SELECT 1 FROM dl_tmp_analytics_orders WHERE \
             \"analytics\".\"orders\".\"id\" = dl_tmp_analytics_orders.\"id\")"
        );
    }

    #[test]
    fn delete_exists_ands_composite_keys() {
        let mut t = orders();
        t.key_names = vec!["id".into(), "note".into()];
        let sql = delete_exists_sql("\"s\".\"t\"", "dl_tmp_s_t", &t);
        assert!(sql.contains("\"s\".\"t\".\"id\" = dl_tmp_s_t.\"id\" AND \"s\".\"t\".\"note\" = dl_tmp_s_t.\"note\""));
    }

    #[test]
    fn temp_table_names_are_identifier_safe() {
        assert_eq!(temp_table_name("analytics.orders"), "dl_tmp_analytics_orders");
        assert_eq!(temp_table_name("odd name.t-1"), "dl_tmp_odd_name_t_1");
    }

    #[test]
    fn quoting_qualified_names() {
        assert_eq!(quote_qualified("a.b"), "\"a\".\"b\"");
        assert_eq!(quote_qualified("plain"), "\"plain\"");
    }

    #[test]
    fn flip_back_requires_pessimistic_and_equality() {
        use LoadMode::*;
        assert!(flip_back_after_delete(Pessimistic, 3, 3));
        // Extra collisions: the union deleted more than the explicit set.
        assert!(!flip_back_after_delete(Pessimistic, 4, 3));
        // No-op deletes keep the loader pessimistic too.
        assert!(!flip_back_after_delete(Pessimistic, 2, 3));
        assert!(!flip_back_after_delete(Optimistic, 3, 3));
    }

    #[tokio::test]
    async fn producer_streams_all_lines_and_terminates() {
        let lines = vec!["\"1\"|\"a\"".to_string(), "\"2\"|\"b\"".to_string()];
        let (producer, mut rx) = spawn_copy_producer(lines);
        let mut all = Vec::new();
        while let Some(chunk) = rx.recv().await {
            all.extend_from_slice(&chunk);
        }
        producer.await.unwrap().unwrap();
        assert_eq!(all, b"\"1\"|\"a\"\n\"2\"|\"b\"\n");
    }

    #[tokio::test]
    async fn producer_fails_cleanly_when_receiver_drops() {
        // Enough data to outgrow the pipe depth so the producer blocks.
        let lines: Vec<String> = (0..10_000).map(|i| format!("\"{i}\"|\"{i}\"")).collect();
        let (producer, rx) = spawn_copy_producer(lines);
        drop(rx);
        match producer.await.unwrap() {
            Err(LoadError::PipeIo(_)) => {}
            other => panic!("expected PipeIo, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn producer_chunks_large_payloads() {
        let line = "x".repeat(1000);
        let lines: Vec<String> = (0..200).map(|_| line.clone()).collect();
        let (producer, mut rx) = spawn_copy_producer(lines);
        let mut chunks = 0usize;
        let mut total = 0usize;
        while let Some(chunk) = rx.recv().await {
            chunks += 1;
            total += chunk.len();
        }
        producer.await.unwrap().unwrap();
        assert_eq!(total, 200 * 1001);
        assert!(chunks > 1, "expected the payload split across chunks");
    }
}
