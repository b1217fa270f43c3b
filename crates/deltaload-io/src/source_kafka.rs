//! Upstream consumer: polls bounded record batches off Kafka and commits
//! offsets for fully-applied batches.
//!
//! Offsets are committed manually: after each poll cycle the consumer asks
//! the ack chain for the newest contiguous fully-applied position and
//! commits that. A crash before then re-reads the un-acked tail, which the
//! loader's pessimistic mode absorbs on replay.

use std::sync::Arc;
use std::time::Duration;

use deltaload_core::{
    AckChain, BatchPosition, PipelineState, RawRecord, SourceBatch, SourceTx, StateCell,
    TopicOffset,
};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct KafkaSource {
    pub pipeline: String,
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    /// Pin this consumer to one partition of a shared topic (partitioned
    /// single-topic dialect runs one pipeline per partition). `None`
    /// subscribes through the consumer group instead.
    pub partition: Option<i32>,
    /// Poll batch row cap; doubles as the row-set close threshold.
    pub max_poll_rows: usize,
    /// Poll window; a partial batch is cut at this boundary.
    pub poll_timeout: Duration,
    pub chain: Arc<AckChain>,
    pub state: Arc<StateCell>,
}

impl KafkaSource {
    pub async fn run(self, tx: SourceTx, cancel: CancellationToken) -> anyhow::Result<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .create()?;

        match self.partition {
            Some(partition) => {
                let mut tpl = TopicPartitionList::new();
                for topic in &self.topics {
                    tpl.add_partition_offset(topic, partition, Offset::Stored)?;
                }
                consumer.assign(&tpl)?;
                info!(
                    pipeline = %self.pipeline,
                    topics = ?self.topics,
                    partition,
                    "consumer assigned"
                );
            }
            None => {
                let topic_refs: Vec<&str> = self.topics.iter().map(String::as_str).collect();
                consumer.subscribe(&topic_refs)?;
                info!(pipeline = %self.pipeline, topics = ?self.topics, "consumer subscribed");
            }
        }

        let mut stream = consumer.stream();
        loop {
            if cancel.is_cancelled() {
                self.commit_completed(&consumer);
                return Ok(());
            }

            let mut records: Vec<RawRecord> = Vec::new();
            let mut position: Vec<TopicOffset> = Vec::new();
            let window = tokio::time::sleep(self.poll_timeout);
            tokio::pin!(window);

            while records.len() < self.max_poll_rows {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut window => break,
                    msg = stream.next() => match msg {
                        Some(Ok(m)) => {
                            records.push(RawRecord {
                                topic: m.topic().to_string(),
                                partition: m.partition(),
                                offset: m.offset(),
                                payload: m.payload().map(<[u8]>::to_vec),
                            });
                            note_position(&mut position, m.topic(), m.partition(), m.offset() + 1);
                            if self.state.get() == PipelineState::Degraded {
                                self.state.set(PipelineState::Normal);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(pipeline = %self.pipeline, "consumer error, retrying: {e}");
                            self.state.set(PipelineState::Degraded);
                        }
                        None => break,
                    },
                }
            }

            // Offsets acked since the last cycle, batch or no batch.
            self.commit_completed(&consumer);

            if records.is_empty() {
                continue;
            }
            metrics::counter!("deltaload_records_polled_total", records.len() as u64);
            let batch = SourceBatch {
                records,
                position: BatchPosition(position),
            };
            if tx.send(batch).await.is_err() {
                return Ok(());
            }
        }
    }

    fn commit_completed(&self, consumer: &StreamConsumer) {
        let Some(position) = self.chain.completed() else {
            return;
        };
        let mut tpl = TopicPartitionList::new();
        for to in &position.0 {
            if let Err(e) = tpl.add_partition_offset(&to.topic, to.partition, Offset::Offset(to.offset))
            {
                warn!(pipeline = %self.pipeline, "bad commit position: {e}");
                return;
            }
        }
        match consumer.commit(&tpl, CommitMode::Async) {
            Ok(()) => debug!(pipeline = %self.pipeline, "committed {:?}", position),
            Err(e) => warn!(pipeline = %self.pipeline, "offset commit failed: {e}"),
        }
    }
}

/// Track the highest next-offset per topic/partition within one poll.
fn note_position(position: &mut Vec<TopicOffset>, topic: &str, partition: i32, next: i64) {
    for to in position.iter_mut() {
        if to.topic == topic && to.partition == partition {
            if next > to.offset {
                to.offset = next;
            }
            return;
        }
    }
    position.push(TopicOffset {
        topic: topic.to_string(),
        partition,
        offset: next,
    });
}
