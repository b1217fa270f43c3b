//! Startup discovery of target table metadata: ordered columns and ordered
//! primary-key names, straight from the catalogs. Built once, read-only
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use deltaload_core::{Column, Table, TableMap};
use tokio_postgres::Client;
use tracing::info;

const COLUMNS_SQL: &str = "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
     FROM pg_attribute a \
     WHERE a.attrelid = $1::regclass AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";

const KEYS_SQL: &str = "SELECT a.attname::text \
     FROM pg_constraint c \
     JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = ANY(c.conkey) \
     WHERE c.conrelid = $1::regclass AND c.contype = 'p' \
     ORDER BY array_position(c.conkey, a.attnum)";

pub async fn discover_table(client: &Client, qualified: &str) -> anyhow::Result<Table> {
    let rows = client
        .query(COLUMNS_SQL, &[&qualified])
        .await
        .with_context(|| format!("describing target table `{qualified}`"))?;
    let columns: Vec<Column> = rows
        .iter()
        .map(|r| Column {
            name: r.get(0),
            type_name: r.get(1),
        })
        .collect();
    if columns.is_empty() {
        bail!("target table `{qualified}` has no columns (does it exist?)");
    }

    let rows = client
        .query(KEYS_SQL, &[&qualified])
        .await
        .with_context(|| format!("resolving primary key of `{qualified}`"))?;
    let key_names: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
    if key_names.is_empty() {
        bail!("target table `{qualified}` has no primary key; cannot merge changes");
    }

    Ok(Table {
        name: qualified.to_string(),
        columns,
        key_names,
    })
}

/// Describe every mapped table once. Duplicate mapped names resolve to one
/// descriptor.
pub async fn discover_tables<'a, I>(client: &Client, mapped: I) -> anyhow::Result<TableMap>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tables = HashMap::new();
    for name in mapped {
        if tables.contains_key(name) {
            continue;
        }
        let table = discover_table(client, name).await?;
        info!(
            table = name,
            columns = table.columns.len(),
            keys = ?table.key_names,
            "discovered target table"
        );
        tables.insert(name.to_string(), table);
    }
    Ok(Arc::new(tables))
}
