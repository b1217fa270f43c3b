//! Fixed-size FIFO pool of target connections.
//!
//! Connections are created once at startup with planner settings suited to
//! analytic targets. A loader borrows one connection per task and either
//! returns it on success or discards it on failure — the pool shrinks and
//! is not refilled, which keeps a flapping target from being hammered by
//! reconnect storms. Operators see the shrinkage on the pool gauge.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deltaload_core::TargetConfig;
use tokio::sync::{mpsc, Mutex};
use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::error::LoadError;

/// Session settings applied to every pooled connection. The delete phase
/// joins the temp key table against the target; nested-loop index plans
/// beat hash/seqscan plans there on append-optimized storage.
const SESSION_SETUP: &str =
    "SET enable_nestloop = on; SET enable_seqscan = off; SET enable_hashjoin = off;";

/// Greenplum-only knob; best-effort on plain Postgres.
const AUTOSTATS_SETUP: &str = "SET gp_autostats_mode = none;";

/// One borrowed target connection plus its scratch state: the temp tables
/// already created on this session. Temp tables live for the connection's
/// lifetime and empty themselves on commit.
pub struct PooledConn {
    pub client: Client,
    temp_tables: HashSet<String>,
}

impl PooledConn {
    pub fn has_temp_table(&self, name: &str) -> bool {
        self.temp_tables.contains(name)
    }

    pub fn mark_temp_table(&mut self, name: String) {
        self.temp_tables.insert(name);
    }
}

pub struct ConnectionPool {
    give: mpsc::UnboundedSender<PooledConn>,
    take: Mutex<mpsc::UnboundedReceiver<PooledConn>>,
    borrow_timeout: Duration,
    live: AtomicUsize,
}

impl ConnectionPool {
    /// Open the configured number of connections and park them in the pool.
    pub async fn connect(cfg: &TargetConfig) -> anyhow::Result<Arc<Self>> {
        let (give, take) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            give,
            take: Mutex::new(take),
            borrow_timeout: Duration::from_millis(cfg.borrow_timeout_ms),
            live: AtomicUsize::new(0),
        });

        for i in 0..cfg.connections {
            let (client, connection) = tokio_postgres::connect(&cfg.conn_string(), NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("target connection terminated: {e}");
                }
            });

            client.batch_execute(SESSION_SETUP).await?;
            if let Err(e) = client.batch_execute(AUTOSTATS_SETUP).await {
                if i == 0 {
                    info!("target does not accept gp_autostats_mode, skipping: {e}");
                }
            }

            pool.live.fetch_add(1, Ordering::Relaxed);
            let conn = PooledConn {
                client,
                temp_tables: HashSet::new(),
            };
            // Channel cannot be closed here; both ends are alive.
            let _ = pool.give.send(conn);
        }
        metrics::gauge!("deltaload_pool_connections", cfg.connections as f64);
        info!("target pool ready with {} connections", cfg.connections);
        Ok(pool)
    }

    /// Borrow the oldest idle connection, waiting up to the configured
    /// timeout. An exhausted pool (every connection borrowed or dropped)
    /// fails the task with `NoConnection`.
    pub async fn borrow(&self) -> Result<PooledConn, LoadError> {
        if self.live.load(Ordering::Relaxed) == 0 {
            return Err(LoadError::NoConnection);
        }
        let mut take = self.take.lock().await;
        match tokio::time::timeout(self.borrow_timeout, take.recv()).await {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) | Err(_) => Err(LoadError::NoConnection),
        }
    }

    /// Return a healthy connection.
    pub fn put(&self, conn: PooledConn) {
        let _ = self.give.send(conn);
    }

    /// Close a connection after a failed task. The pool shrinks by one.
    pub fn discard(&self, conn: PooledConn) {
        drop(conn);
        let left = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("deltaload_pool_connections", left as f64);
        warn!("dropped a target connection, {left} left in pool");
    }

    /// Connections not yet discarded.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}
