//! Pipeline assembly: one consumer, one transformer, one dispatcher, and a
//! merger/loader pair per mapped table, all tied to one ack chain.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use deltaload_core::{
    AckChain, MergeConfig, PipelineState, StateCell, Table,
};
use deltaload_io::{ChangeLoader, ConnectionPool, KafkaSource};
use deltaload_tx::dispatch::Dispatcher;
use deltaload_tx::merge::Merger;
use deltaload_tx::transform::Transformer;
use deltaload_tx::RecordDecoder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const STAGE_CHANNEL_DEPTH: usize = 4;
const ROWSET_CHANNEL_DEPTH: usize = 8;
const LOADTASK_CHANNEL_DEPTH: usize = 2;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// One running pipeline: the worker set plus its observable state.
pub struct PipeLine {
    pub name: String,
    pub state: Arc<StateCell>,
    pub chain: Arc<AckChain>,
    handles: Vec<JoinHandle<()>>,
}

impl PipeLine {
    /// Wait for every stage to wind down.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Everything a pipeline needs besides the shared pool.
pub struct PipelineSpec {
    pub name: String,
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub partition: Option<i32>,
    pub decoder: Arc<dyn RecordDecoder>,
    /// Mapped-table descriptors served by this pipeline.
    pub tables: Vec<Table>,
}

pub fn spawn_pipeline(
    spec: PipelineSpec,
    pool: Arc<ConnectionPool>,
    merge_cfg: &MergeConfig,
    progress: Arc<AtomicU64>,
    cancel: &CancellationToken,
) -> PipeLine {
    let state = Arc::new(StateCell::default());
    let chain = Arc::new(AckChain::new());
    let mut handles = Vec::new();

    let (source_tx, source_rx) = mpsc::channel(STAGE_CHANNEL_DEPTH);
    let (rows_tx, rows_rx) = mpsc::channel(STAGE_CHANNEL_DEPTH);

    let source = KafkaSource {
        pipeline: spec.name.clone(),
        brokers: spec.brokers,
        group_id: spec.group_id,
        topics: spec.topics,
        partition: spec.partition,
        max_poll_rows: merge_cfg.batch_rows,
        poll_timeout: POLL_TIMEOUT,
        chain: Arc::clone(&chain),
        state: Arc::clone(&state),
    };
    handles.push(supervise(
        "consumer",
        spec.name.clone(),
        Arc::clone(&state),
        source.run(source_tx, cancel.child_token()),
    ));

    let transformer = Transformer::new(spec.name.clone(), Arc::clone(&spec.decoder));
    handles.push(supervise(
        "transform",
        spec.name.clone(),
        Arc::clone(&state),
        transformer.run(source_rx, rows_tx, cancel.child_token()),
    ));

    let mut set_txs = HashMap::new();
    for table in &spec.tables {
        let (set_tx, set_rx) = mpsc::channel(ROWSET_CHANNEL_DEPTH);
        let (task_tx, task_rx) = mpsc::channel(LOADTASK_CHANNEL_DEPTH);
        set_txs.insert(table.name.clone(), set_tx);

        let merger = Merger::new(
            table.name.clone(),
            merge_cfg.window_sets,
            Duration::from_millis(merge_cfg.flush_interval_ms),
        );
        handles.push(supervise(
            "merge",
            spec.name.clone(),
            Arc::clone(&state),
            merger.run(set_rx, task_tx, cancel.child_token()),
        ));

        let loader = ChangeLoader::new(table.clone(), Arc::clone(&pool), Arc::clone(&progress));
        handles.push(supervise(
            "load",
            spec.name.clone(),
            Arc::clone(&state),
            loader.run(task_rx, cancel.child_token()),
        ));
    }

    let dispatcher = Dispatcher::new(spec.name.clone(), set_txs, Arc::clone(&chain));
    handles.push(supervise(
        "dispatch",
        spec.name.clone(),
        Arc::clone(&state),
        dispatcher.run(rows_rx, cancel.child_token()),
    ));

    PipeLine {
        name: spec.name,
        state,
        chain,
        handles,
    }
}

/// Run one stage to completion; a stage error stops the whole pipeline,
/// which the watchdog then escalates.
fn supervise<F, E>(
    stage: &'static str,
    pipeline: String,
    state: Arc<StateCell>,
    fut: F,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => debug!(pipeline = %pipeline, stage, "stage drained"),
            Err(e) => {
                error!(pipeline = %pipeline, stage, "stage failed: {e}");
                state.set(PipelineState::Stopped);
            }
        }
    })
}
