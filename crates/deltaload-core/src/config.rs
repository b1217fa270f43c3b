//! Daemon configuration loaded from YAML.
//!
//! # Example Configuration
//!
//! ```yaml
//! target:
//!   host: "gp-master"
//!   port: 5432
//!   user: "loader"
//!   password: "secret"
//!   dbname: "warehouse"
//!   connections: 4
//! pipelines:
//!   - type: debezium
//!     name: "inventory"
//!     brokers: "localhost:9092"
//!     group_id: "deltaload"
//!     topic_prefix: "dbz.inventory"
//!     tables:
//!       public.orders: analytics.orders
//!       public.items: analytics.items
//!   - type: maxwell
//!     name: "shop"
//!     brokers: "localhost:9092"
//!     group_id: "deltaload"
//!     topic: "maxwell"
//!     tables:
//!       shop.carts: analytics.carts
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target: TargetConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// One entry per upstream source; each becomes one or more pipelines.
    pub pipelines: Vec<PipelineConfig>,
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// Target database connection block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub dbname: String,

    /// Fixed number of pooled connections shared by all loaders.
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// How long a loader waits for a free connection before the task fails.
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,
}

impl TargetConfig {
    /// Connection string in the key/value form the driver accepts.
    pub fn conn_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.dbname
        )
    }
}

/// Batching thresholds for the dispatch and merge stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Row-count threshold that closes a row set early.
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,

    /// Upper bound on row sets folded into one load task.
    #[serde(default = "default_window_sets")]
    pub window_sets: usize,

    /// Merger flush tick, so trickle traffic still reaches the target.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            batch_rows: default_batch_rows(),
            window_sets: default_window_sets(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Watchdog sampling and stall detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// With work in flight and no batch loaded for this long, the watchdog
    /// stops the process.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
        }
    }
}

/// One upstream source. The two variants mirror the two CDC producer
/// dialects deltaload understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineConfig {
    /// Topic-per-table CDC: one pipeline per mapped table, subscribed to
    /// `<topic_prefix>.<source-table>`.
    #[serde(rename = "debezium")]
    Debezium(DebeziumConfig),

    /// Partitioned single-topic CDC: the source table rides in each record.
    #[serde(rename = "maxwell")]
    Maxwell(MaxwellConfig),
}

impl PipelineConfig {
    pub fn name(&self) -> &str {
        match self {
            PipelineConfig::Debezium(c) => &c.name,
            PipelineConfig::Maxwell(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebeziumConfig {
    pub name: String,
    pub brokers: String,
    pub group_id: String,
    pub topic_prefix: String,
    /// `source.qualified.name` → `target.qualified.name`
    pub tables: BTreeMap<String, String>,
}

impl DebeziumConfig {
    /// Topic carrying changes for one source table.
    pub fn topic_for(&self, source_table: &str) -> String {
        format!("{}.{}", self.topic_prefix, source_table)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxwellConfig {
    pub name: String,
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    /// Partition count of the shared topic; one pipeline runs per
    /// partition.
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    /// `database.table` → `target.qualified.name`
    pub tables: BTreeMap<String, String>,
}

fn default_port() -> u16 {
    5432
}

fn default_partitions() -> i32 {
    1
}

fn default_connections() -> usize {
    4
}

fn default_borrow_timeout_ms() -> u64 {
    10_000
}

fn default_batch_rows() -> usize {
    50_000
}

fn default_window_sets() -> usize {
    8
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_stall_timeout_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
target:
  host: localhost
  user: loader
  dbname: warehouse
pipelines:
  - type: debezium
    name: inv
    brokers: localhost:9092
    group_id: deltaload
    topic_prefix: dbz.inventory
    tables:
      public.orders: analytics.orders
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.target.port, 5432);
        assert_eq!(cfg.target.connections, 4);
        assert_eq!(cfg.merge.batch_rows, 50_000);
        match &cfg.pipelines[0] {
            PipelineConfig::Debezium(d) => {
                assert_eq!(d.topic_for("public.orders"), "dbz.inventory.public.orders");
            }
            other => panic!("unexpected pipeline: {other:?}"),
        }
    }

    #[test]
    fn parses_maxwell_variant() {
        let yaml = r#"
target:
  host: localhost
  user: loader
  dbname: warehouse
pipelines:
  - type: maxwell
    name: shop
    brokers: localhost:9092
    group_id: deltaload
    topic: maxwell
    tables:
      shop.carts: analytics.carts
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert!(matches!(cfg.pipelines[0], PipelineConfig::Maxwell(_)));
    }
}
