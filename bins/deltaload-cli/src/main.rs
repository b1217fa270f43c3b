//! # deltaload - incremental CDC replication daemon
//!
//! Consumes row-level change streams from Kafka (Debezium topic-per-table
//! or Maxwell partitioned-topic), merges them into compact per-table delta
//! batches and bulk-loads each batch into an analytic Postgres-family
//! target with COPY + delete-exists semantics.
//!
//! ## Usage
//!
//! ```bash
//! deltaload-cli --config deltaload.yml
//!
//! # Enable debug logging
//! RUST_LOG=debug deltaload-cli --config deltaload.yml
//! ```
//!
//! Upstream offsets are committed only after every table touched by a poll
//! batch has committed on the target, so a crash replays the un-acked tail
//! instead of losing it.

mod pipeline;
mod watchdog;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use deltaload_core::{Config, PipelineConfig, PipelineState};
use deltaload_io::{pool::ConnectionPool, table_meta};
use deltaload_tx::{debezium::DebeziumDecoder, maxwell::MaxwellDecoder, TableBinding};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::pipeline::{spawn_pipeline, PipelineSpec};
use crate::watchdog::Watchdog;

/// Command-line arguments for the deltaload daemon
#[derive(Parser, Debug)]
#[command(name = "deltaload-cli")]
#[command(about = "Incremental CDC replication into analytic targets")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let cfg: Config = {
        let y = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        Config::from_yaml(&y).context("parsing configuration")?
    };

    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        warn!("metrics exporter not started: {e}");
    }

    let pool = ConnectionPool::connect(&cfg.target)
        .await
        .context("connecting to target")?;

    // Describe every mapped table once, through a briefly borrowed
    // connection.
    let mapped: Vec<&str> = cfg
        .pipelines
        .iter()
        .flat_map(|p| match p {
            PipelineConfig::Debezium(d) => d.tables.values(),
            PipelineConfig::Maxwell(m) => m.tables.values(),
        })
        .map(String::as_str)
        .collect();
    let tables = {
        let conn = pool.borrow().await?;
        let tables = table_meta::discover_tables(&conn.client, mapped).await?;
        pool.put(conn);
        tables
    };

    let cancel = CancellationToken::new();
    let progress = Arc::new(AtomicU64::new(0));
    let mut pipelines = Vec::new();

    for pc in &cfg.pipelines {
        match pc {
            // Topic-per-table: one pipeline per mapped table, each on its
            // own derived topic.
            PipelineConfig::Debezium(d) => {
                for (source, target) in &d.tables {
                    let topic = d.topic_for(source);
                    let table = tables[target].clone();
                    let mut bindings = HashMap::new();
                    bindings.insert(
                        topic.clone(),
                        TableBinding {
                            origin: source.clone(),
                            mapped: target.clone(),
                            table: table.clone(),
                        },
                    );
                    let spec = PipelineSpec {
                        name: format!("{}:{}", d.name, source),
                        brokers: d.brokers.clone(),
                        group_id: d.group_id.clone(),
                        topics: vec![topic],
                        partition: None,
                        decoder: Arc::new(DebeziumDecoder::new(bindings)),
                        tables: vec![table],
                    };
                    pipelines.push(spawn_pipeline(
                        spec,
                        Arc::clone(&pool),
                        &cfg.merge,
                        Arc::clone(&progress),
                        &cancel,
                    ));
                }
            }
            // Partitioned single topic: one pipeline per partition, each
            // serving every mapped table.
            PipelineConfig::Maxwell(m) => {
                let bindings: HashMap<String, TableBinding> = m
                    .tables
                    .iter()
                    .map(|(source, target)| {
                        (
                            source.clone(),
                            TableBinding {
                                origin: source.clone(),
                                mapped: target.clone(),
                                table: tables[target].clone(),
                            },
                        )
                    })
                    .collect();
                let served: Vec<_> = m.tables.values().map(|t| tables[t].clone()).collect();
                for partition in 0..m.partitions {
                    let spec = PipelineSpec {
                        name: format!("{}:{partition}", m.name),
                        brokers: m.brokers.clone(),
                        group_id: m.group_id.clone(),
                        topics: vec![m.topic.clone()],
                        partition: Some(partition),
                        decoder: Arc::new(MaxwellDecoder::new(bindings.clone())),
                        tables: served.clone(),
                    };
                    pipelines.push(spawn_pipeline(
                        spec,
                        Arc::clone(&pool),
                        &cfg.merge,
                        Arc::clone(&progress),
                        &cancel,
                    ));
                }
            }
        }
    }
    info!("started {} pipelines", pipelines.len());

    let watchdog = Watchdog {
        cfg: cfg.watchdog.clone(),
        pipelines: pipelines
            .iter()
            .map(|p| (p.name.clone(), Arc::clone(&p.state), Arc::clone(&p.chain)))
            .collect(),
        progress,
    };
    let watchdog_handle = tokio::spawn(watchdog.run(cancel.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, draining");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    let mut failed = false;
    for p in pipelines {
        let state = Arc::clone(&p.state);
        p.join().await;
        if state.get() == PipelineState::Stopped {
            failed = true;
        }
    }
    let _ = watchdog_handle.await;

    if failed {
        anyhow::bail!("one or more pipelines stopped on error");
    }
    info!("drained cleanly");
    Ok(())
}
