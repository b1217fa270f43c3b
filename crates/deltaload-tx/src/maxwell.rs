//! Partitioned single-topic CDC decoding (Maxwell envelope).
//!
//! One record per change on a shared topic; the source table rides in the
//! record itself (`database` + `table`). Values are plain JSON — no
//! Connect schema envelope. `old` carries the previous values of changed
//! columns only, so old-key reconstruction falls back to `data` for
//! untouched key columns.

use std::collections::HashMap;

use deltaload_core::{encode_tuple, RawRecord, Row, RowKind, TransformError};
use serde_json::Value;

use crate::debezium::{keys_from, render_fields};
use crate::{RecordDecoder, TableBinding};

pub struct MaxwellDecoder {
    /// `database.table` → table binding.
    bindings: HashMap<String, TableBinding>,
}

impl MaxwellDecoder {
    pub fn new(bindings: HashMap<String, TableBinding>) -> Self {
        Self { bindings }
    }
}

impl RecordDecoder for MaxwellDecoder {
    fn decode(&self, record: &RawRecord) -> Result<Option<Row>, TransformError> {
        let Some(payload) = record.payload.as_deref() else {
            return Ok(None);
        };
        if payload.is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| TransformError::Malformed(e.to_string()))?;

        let database = value
            .get("database")
            .and_then(Value::as_str)
            .ok_or(TransformError::MissingField("database"))?;
        let table = value
            .get("table")
            .and_then(Value::as_str)
            .ok_or(TransformError::MissingField("table"))?;
        let origin = format!("{database}.{table}");
        let Some(binding) = self.bindings.get(&origin) else {
            return Ok(None);
        };

        let kind = match value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(TransformError::MissingField("type"))?
        {
            "insert" | "bootstrap-insert" => RowKind::Insert,
            "update" => RowKind::Update,
            "delete" => RowKind::Delete,
            // Bootstrap markers and DDL notifications carry no row data.
            "bootstrap-start" | "bootstrap-complete" => return Ok(None),
            other if other.starts_with("table-") || other.starts_with("database-") => {
                return Ok(None)
            }
            other => return Err(TransformError::UnknownOp(other.to_string())),
        };

        let produce_time = value
            .get("ts")
            .and_then(Value::as_i64)
            .ok_or(TransformError::MissingField("ts"))?
            * 1000;

        let data = match value.get("data") {
            Some(d) if d.is_object() => d,
            _ => return Err(TransformError::MissingField("data")),
        };

        let rendered = render_fields(&binding.table, None, data)?;
        let keys = keys_from(&binding.table, &rendered)?;
        if keys.is_empty() {
            return Err(TransformError::EmptyKey {
                table: binding.mapped.clone(),
            });
        }
        let tuple = match kind {
            RowKind::Delete => None,
            _ => Some(encode_tuple(rendered.iter().map(Option::as_deref))),
        };

        let old_keys = if kind == RowKind::Update {
            match value.get("old") {
                Some(old) if old.is_object() => {
                    // `old` is sparse; untouched key columns keep their
                    // `data` value.
                    let merged: Vec<Option<String>> = binding
                        .table
                        .column_names()
                        .map(|col| {
                            let v = old.get(col).unwrap_or_else(|| {
                                data.get(col).unwrap_or(&Value::Null)
                            });
                            crate::decode::render_plain(v)
                        })
                        .collect();
                    let old_encoded = keys_from(&binding.table, &merged)?;
                    (!old_encoded.is_empty() && old_encoded != keys).then_some(old_encoded)
                }
                _ => None,
            }
        } else {
            None
        };

        Ok(Some(Row {
            kind,
            produce_time,
            origin_table: binding.origin.clone(),
            mapped_table: binding.mapped.clone(),
            keys,
            tuple,
            old_keys,
        }))
    }
}
