//! Topic-per-table CDC decoding (Debezium envelope).
//!
//! Each record value is a JSON object with a Connect `schema` envelope and
//! a `payload`. `payload.op` maps `r`/`c` → insert, `u` → update, `d` →
//! delete; row fields come from `payload.after`, except deletes which read
//! `payload.before`. A missing or null payload is a benign skip, as is a
//! topic no table is mapped to.

use std::collections::HashMap;

use deltaload_core::{encode_tuple, RawRecord, Row, RowKind, Table, TransformError};
use serde_json::Value;

use crate::decode::{render_value, FieldSchema};
use crate::{RecordDecoder, TableBinding};

pub struct DebeziumDecoder {
    /// Subscribed topic → table binding.
    bindings: HashMap<String, TableBinding>,
}

impl DebeziumDecoder {
    pub fn new(bindings: HashMap<String, TableBinding>) -> Self {
        Self { bindings }
    }
}

impl RecordDecoder for DebeziumDecoder {
    fn decode(&self, record: &RawRecord) -> Result<Option<Row>, TransformError> {
        let Some(binding) = self.bindings.get(&record.topic) else {
            return Ok(None);
        };
        let Some(payload_bytes) = record.payload.as_deref() else {
            // Tombstone.
            return Ok(None);
        };
        if payload_bytes.is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_slice(payload_bytes)
            .map_err(|e| TransformError::Malformed(e.to_string()))?;
        let payload = match value.get("payload") {
            Some(p) if !p.is_null() => p,
            _ => return Ok(None),
        };

        let op = payload
            .get("op")
            .and_then(Value::as_str)
            .ok_or(TransformError::MissingField("op"))?;
        let kind = match op {
            "r" | "c" => RowKind::Insert,
            "u" => RowKind::Update,
            "d" => RowKind::Delete,
            other => return Err(TransformError::UnknownOp(other.to_string())),
        };
        let produce_time = payload
            .get("ts_ms")
            .and_then(Value::as_i64)
            .ok_or(TransformError::MissingField("ts_ms"))?;

        let schemas = field_schemas(&value, if kind == RowKind::Delete { "before" } else { "after" });
        let source = match kind {
            RowKind::Delete => payload.get("before"),
            _ => payload.get("after"),
        };
        let source = match source {
            Some(s) if s.is_object() => s,
            _ => {
                return Err(TransformError::MissingField(if kind == RowKind::Delete {
                    "before"
                } else {
                    "after"
                }))
            }
        };

        let rendered = render_fields(&binding.table, schemas.as_ref(), source)?;
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

        // An update whose before-image carries different key values splits
        // into delete-old + insert-new downstream.
        let old_keys = if kind == RowKind::Update {
            match payload.get("before") {
                Some(before) if before.is_object() => {
                    let before_schemas = field_schemas(&value, "before");
                    let old_rendered =
                        render_fields(&binding.table, before_schemas.as_ref(), before)?;
                    let old = keys_from(&binding.table, &old_rendered)?;
                    (!old.is_empty() && old != keys).then_some(old)
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

/// Column name → declared shape, pulled from the Connect schema envelope
/// for the given struct field (`before` / `after`). Absent envelope means
/// plain rendering.
fn field_schemas(value: &Value, side: &str) -> Option<HashMap<String, FieldSchema>> {
    let fields = value.get("schema")?.get("fields")?.as_array()?;
    let side_schema = fields
        .iter()
        .find(|f| f.get("field").and_then(Value::as_str) == Some(side))?;
    let cols = side_schema.get("fields")?.as_array()?;

    let mut out = HashMap::with_capacity(cols.len());
    for col in cols {
        let Some(name) = col.get("field").and_then(Value::as_str) else {
            continue;
        };
        let params = col.get("parameters");
        out.insert(
            name.to_string(),
            FieldSchema {
                type_name: col
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                logical: col.get("name").and_then(Value::as_str).map(str::to_string),
                scale: params
                    .and_then(|p| p.get("scale"))
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                length: params
                    .and_then(|p| p.get("length"))
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok()),
            },
        );
    }
    Some(out)
}

/// Render every target column from the change image, in column order.
pub(crate) fn render_fields(
    table: &Table,
    schemas: Option<&HashMap<String, FieldSchema>>,
    image: &Value,
) -> Result<Vec<Option<String>>, TransformError> {
    table
        .column_names()
        .map(|col| {
            let v = image.get(col).unwrap_or(&Value::Null);
            render_value(v, schemas.and_then(|s| s.get(col)), col)
        })
        .collect()
}

/// Encode the key tuple out of already-rendered column values.
pub(crate) fn keys_from(table: &Table, rendered: &[Option<String>]) -> Result<String, TransformError> {
    let mut key_vals = Vec::with_capacity(table.key_names.len());
    for key in &table.key_names {
        let idx = table
            .columns
            .iter()
            .position(|c| &c.name == key)
            .ok_or_else(|| {
                TransformError::Malformed(format!(
                    "key column `{key}` not in column list of `{}`",
                    table.name
                ))
            })?;
        key_vals.push(rendered[idx].as_deref());
    }
    Ok(encode_tuple(key_vals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltaload_core::Column;
    use serde_json::json;

    fn binding() -> HashMap<String, TableBinding> {
        let table = Table {
            name: "analytics.orders".into(),
            columns: vec![
                Column {
                    name: "id".into(),
                    type_name: "bigint".into(),
                },
                Column {
                    name: "price".into(),
                    type_name: "numeric(12,2)".into(),
                },
            ],
            key_names: vec!["id".into()],
        };
        let mut m = HashMap::new();
        m.insert(
            "dbz.inventory.public.orders".to_string(),
            TableBinding {
                origin: "public.orders".into(),
                mapped: "analytics.orders".into(),
                table,
            },
        );
        m
    }

    fn record(value: serde_json::Value) -> RawRecord {
        RawRecord {
            topic: "dbz.inventory.public.orders".into(),
            partition: 0,
            offset: 1,
            payload: Some(value.to_string().into_bytes()),
        }
    }

    fn schema_envelope() -> serde_json::Value {
        let cols = json!([
            {"field": "id", "type": "int64"},
            {"field": "price", "type": "bytes",
             "name": "org.apache.kafka.connect.data.Decimal",
             "parameters": {"scale": "2"}}
        ]);
        json!({"type": "struct", "fields": [
            {"field": "before", "type": "struct", "fields": cols.clone()},
            {"field": "after", "type": "struct", "fields": cols}
        ]})
    }

    #[test]
    fn decodes_create_with_decimal() {
        let dec = DebeziumDecoder::new(binding());
        // base64 of 0x00989680 == 10_000_000, scale 2 -> "100000.00"
        let rec = record(json!({
            "schema": schema_envelope(),
            "payload": {
                "op": "c", "ts_ms": 0,
                "before": null,
                "after": {"id": 1, "price": "AJiWgA=="}
            }
        }));
        let row = dec.decode(&rec).unwrap().unwrap();
        assert_eq!(row.kind, RowKind::Insert);
        assert_eq!(row.keys, r#""1""#);
        assert_eq!(row.tuple.as_deref(), Some(r#""1"|"100000.00""#));
        assert!(row.old_keys.is_none());
    }

    #[test]
    fn decodes_delete_from_before_image() {
        let dec = DebeziumDecoder::new(binding());
        let rec = record(json!({
            "schema": schema_envelope(),
            "payload": {
                "op": "d", "ts_ms": 7,
                "before": {"id": 9, "price": null},
                "after": null
            }
        }));
        let row = dec.decode(&rec).unwrap().unwrap();
        assert_eq!(row.kind, RowKind::Delete);
        assert_eq!(row.keys, r#""9""#);
        assert!(row.tuple.is_none());
    }

    #[test]
    fn update_with_key_change_carries_old_keys() {
        let dec = DebeziumDecoder::new(binding());
        let rec = record(json!({
            "schema": schema_envelope(),
            "payload": {
                "op": "u", "ts_ms": 7,
                "before": {"id": 1, "price": "AJiWgA=="},
                "after": {"id": 2, "price": "AJiWgA=="}
            }
        }));
        let row = dec.decode(&rec).unwrap().unwrap();
        assert_eq!(row.keys, r#""2""#);
        assert_eq!(row.old_keys.as_deref(), Some(r#""1""#));
    }

    #[test]
    fn update_without_key_change_has_no_old_keys() {
        let dec = DebeziumDecoder::new(binding());
        let rec = record(json!({
            "schema": schema_envelope(),
            "payload": {
                "op": "u", "ts_ms": 7,
                "before": {"id": 1, "price": "AA=="},
                "after": {"id": 1, "price": "AJiWgA=="}
            }
        }));
        let row = dec.decode(&rec).unwrap().unwrap();
        assert!(row.old_keys.is_none());
    }

    #[test]
    fn null_payload_is_benign_skip() {
        let dec = DebeziumDecoder::new(binding());
        let rec = record(json!({"schema": {}, "payload": null}));
        assert!(dec.decode(&rec).unwrap().is_none());
    }

    #[test]
    fn tombstone_is_benign_skip() {
        let dec = DebeziumDecoder::new(binding());
        let rec = RawRecord {
            topic: "dbz.inventory.public.orders".into(),
            partition: 0,
            offset: 1,
            payload: None,
        };
        assert!(dec.decode(&rec).unwrap().is_none());
    }

    #[test]
    fn unmapped_topic_is_benign_skip() {
        let dec = DebeziumDecoder::new(binding());
        let rec = RawRecord {
            topic: "dbz.other.topic".into(),
            partition: 0,
            offset: 1,
            payload: Some(b"{}".to_vec()),
        };
        assert!(dec.decode(&rec).unwrap().is_none());
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let dec = DebeziumDecoder::new(binding());
        let rec = RawRecord {
            topic: "dbz.inventory.public.orders".into(),
            partition: 0,
            offset: 1,
            payload: Some(b"not json".to_vec()),
        };
        assert!(matches!(
            dec.decode(&rec),
            Err(TransformError::Malformed(_))
        ));
    }
}
