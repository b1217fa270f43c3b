//! Connect logical-type decoding.
//!
//! Debezium ships column values pre-encoded per the Kafka Connect schema:
//! decimals as base64 big-endian two's-complement integers with a declared
//! scale, temporal types as epoch-based integers, bit strings as base64
//! little-endian bytes. The transformer rewrites all of them into the
//! target's textual forms; unknown types pass through verbatim.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::DateTime;
use deltaload_core::TransformError;
use serde_json::Value;

const LOGICAL_DECIMAL: &str = "org.apache.kafka.connect.data.Decimal";
const LOGICAL_CONNECT_DATE: &str = "org.apache.kafka.connect.data.Date";
const LOGICAL_CONNECT_TIME: &str = "org.apache.kafka.connect.data.Time";
const LOGICAL_CONNECT_TIMESTAMP: &str = "org.apache.kafka.connect.data.Timestamp";
const LOGICAL_DATE: &str = "io.debezium.time.Date";
const LOGICAL_TIME: &str = "io.debezium.time.Time";
const LOGICAL_MICRO_TIME: &str = "io.debezium.time.MicroTime";
const LOGICAL_TIMESTAMP: &str = "io.debezium.time.Timestamp";
const LOGICAL_MICRO_TIMESTAMP: &str = "io.debezium.time.MicroTimestamp";
const LOGICAL_ZONED_TIME: &str = "io.debezium.time.ZonedTime";
const LOGICAL_ZONED_TIMESTAMP: &str = "io.debezium.time.ZonedTimestamp";
const LOGICAL_BITS: &str = "io.debezium.data.Bits";

/// Declared shape of one column in the Connect schema envelope.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    /// Connect primitive type: `int32`, `int64`, `bytes`, `string`, ...
    pub type_name: String,
    /// Logical (semantic) type name, when present.
    pub logical: Option<String>,
    /// Decimal scale from `parameters.scale`.
    pub scale: i32,
    /// Bit-string length from `parameters.length`.
    pub length: Option<usize>,
}

/// Render one column value into the target's textual form.
/// `Ok(None)` is SQL NULL.
pub fn render_value(
    value: &Value,
    schema: Option<&FieldSchema>,
    column: &str,
) -> Result<Option<String>, TransformError> {
    if value.is_null() {
        return Ok(None);
    }
    let Some(fs) = schema else {
        return Ok(render_plain(value));
    };

    match fs.logical.as_deref() {
        Some(LOGICAL_DECIMAL) => {
            let b64 = expect_str(value, column)?;
            Ok(Some(decode_decimal(b64, fs.scale, column)?))
        }
        Some(LOGICAL_DATE) | Some(LOGICAL_CONNECT_DATE) => {
            let days = expect_i64(value, column)?;
            Ok(Some(decode_date(days, column)?))
        }
        Some(LOGICAL_TIME) | Some(LOGICAL_CONNECT_TIME) | Some(LOGICAL_TIMESTAMP)
        | Some(LOGICAL_CONNECT_TIMESTAMP) => {
            let millis = expect_i64(value, column)?;
            Ok(Some(decode_timestamp_millis(millis, column)?))
        }
        Some(LOGICAL_MICRO_TIME) | Some(LOGICAL_MICRO_TIMESTAMP) => {
            let micros = expect_i64(value, column)?;
            Ok(Some(decode_timestamp_micros(micros, column)?))
        }
        // Already carries a zone marker: pass through as sent.
        Some(LOGICAL_ZONED_TIME) | Some(LOGICAL_ZONED_TIMESTAMP) => Ok(render_plain(value)),
        Some(LOGICAL_BITS) => {
            let b64 = expect_str(value, column)?;
            Ok(Some(decode_bits(b64, fs.length, column)?))
        }
        Some(_) => Ok(render_plain(value)),
        None if fs.type_name == "bytes" => {
            let b64 = expect_str(value, column)?;
            Ok(Some(decode_bytea(b64, column)?))
        }
        None => Ok(render_plain(value)),
    }
}

/// Render a schema-less JSON value (Maxwell payloads, unknown types).
pub fn render_plain(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        // Nested structures pass through verbatim as compact JSON.
        other => Some(other.to_string()),
    }
}

/// Base64 big-endian two's-complement integer, scaled by the declared
/// precision. Handles widths beyond 128 bits.
pub fn decode_decimal(b64: &str, scale: i32, column: &str) -> Result<String, TransformError> {
    let bytes = B64.decode(b64).map_err(|e| bad(column, format!("bad base64: {e}")))?;
    if bytes.is_empty() {
        return Err(bad(column, "empty decimal payload".into()));
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut mag = bytes;
    if negative {
        for b in mag.iter_mut() {
            *b = !*b;
        }
        for b in mag.iter_mut().rev() {
            let (v, carry) = b.overflowing_add(1);
            *b = v;
            if !carry {
                break;
            }
        }
    }
    let mut digits = magnitude_to_decimal(&mag);

    if scale < 0 {
        // Negative scale multiplies by a power of ten.
        if digits != "0" {
            digits.extend(std::iter::repeat('0').take(scale.unsigned_abs() as usize));
        }
    } else if scale > 0 {
        let scale = scale as usize;
        if digits.len() <= scale {
            let pad = scale + 1 - digits.len();
            digits.insert_str(0, &"0".repeat(pad));
        }
        digits.insert(digits.len() - scale, '.');
    }
    if negative && digits.trim_matches(|c| c == '0' || c == '.') != "" {
        digits.insert(0, '-');
    }
    Ok(digits)
}

/// Convert a big-endian unsigned magnitude to its decimal digits.
fn magnitude_to_decimal(bytes: &[u8]) -> String {
    let mut mag = bytes.to_vec();
    let mut digits = Vec::new();
    while mag.iter().any(|&b| b != 0) {
        let mut rem: u32 = 0;
        for b in mag.iter_mut() {
            let cur = (rem << 8) | u32::from(*b);
            *b = (cur / 10) as u8;
            rem = cur % 10;
        }
        digits.push((b'0' + rem as u8) as char);
    }
    if digits.is_empty() {
        digits.push('0');
    }
    digits.iter().rev().collect()
}

/// Epoch days → `YYYY-MM-DD`.
pub fn decode_date(days: i64, column: &str) -> Result<String, TransformError> {
    let secs = days
        .checked_mul(86_400)
        .ok_or_else(|| bad(column, format!("date out of range: {days} days")))?;
    let dt = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| bad(column, format!("date out of range: {days} days")))?;
    Ok(dt.date_naive().format("%Y-%m-%d").to_string())
}

/// Epoch milliseconds → `YYYY-MM-DD HH:MM:SS.fff` (UTC).
pub fn decode_timestamp_millis(millis: i64, column: &str) -> Result<String, TransformError> {
    let dt = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| bad(column, format!("timestamp out of range: {millis} ms")))?;
    Ok(dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
}

/// Epoch microseconds → `YYYY-MM-DD HH:MM:SS.fff` (UTC, truncated to ms).
pub fn decode_timestamp_micros(micros: i64, column: &str) -> Result<String, TransformError> {
    let dt = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| bad(column, format!("timestamp out of range: {micros} us")))?;
    Ok(dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
}

/// Base64 little-endian bytes → bit string, right-trimmed to the declared
/// length, most significant bit first.
pub fn decode_bits(b64: &str, length: Option<usize>, column: &str) -> Result<String, TransformError> {
    let bytes = B64.decode(b64).map_err(|e| bad(column, format!("bad base64: {e}")))?;
    let len = length.unwrap_or(bytes.len() * 8).min(bytes.len() * 8);
    let mut out = String::with_capacity(len);
    for i in (0..len).rev() {
        let bit = (bytes[i / 8] >> (i % 8)) & 1;
        out.push(if bit == 1 { '1' } else { '0' });
    }
    Ok(out)
}

/// Base64 bytes → hex bytea literal (`\x...`).
pub fn decode_bytea(b64: &str, column: &str) -> Result<String, TransformError> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let bytes = B64.decode(b64).map_err(|e| bad(column, format!("bad base64: {e}")))?;
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    Ok(out)
}

fn expect_str<'a>(value: &'a Value, column: &str) -> Result<&'a str, TransformError> {
    value
        .as_str()
        .ok_or_else(|| bad(column, format!("expected string, got {value}")))
}

fn expect_i64(value: &Value, column: &str) -> Result<i64, TransformError> {
    value
        .as_i64()
        .ok_or_else(|| bad(column, format!("expected integer, got {value}")))
}

fn bad(column: &str, reason: String) -> TransformError {
    TransformError::BadValue {
        column: column.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decimal_scale_two() {
        // 0x00989680 == 10_000_000, scale 2 -> 100000.00
        assert_eq!(decode_decimal("AJiWgA==", 2, "price").unwrap(), "100000.00");
    }

    #[test]
    fn decimal_negative() {
        // -1 in one byte two's complement, scale 2 -> -0.01
        assert_eq!(decode_decimal("/w==", 2, "price").unwrap(), "-0.01");
    }

    #[test]
    fn decimal_zero_scale() {
        // 0x2A == 42
        assert_eq!(decode_decimal("Kg==", 0, "n").unwrap(), "42");
    }

    #[test]
    fn decimal_small_fraction_pads() {
        // 7, scale 3 -> 0.007
        assert_eq!(decode_decimal("Bw==", 3, "n").unwrap(), "0.007");
    }

    #[test]
    fn decimal_wider_than_128_bits() {
        // 10^40 = 0x1D6329F1C35CA4BFABB9F5610000000000
        let b = B64.encode(
            [
                0x1Du8, 0x63, 0x29, 0xF1, 0xC3, 0x5C, 0xA4, 0xBF, 0xAB, 0xB9, 0xF5, 0x61, 0x00,
                0x00, 0x00, 0x00, 0x00,
            ]
            .as_slice(),
        );
        assert_eq!(
            decode_decimal(&b, 0, "n").unwrap(),
            "10000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn date_from_epoch_days() {
        assert_eq!(decode_date(0, "d").unwrap(), "1970-01-01");
        assert_eq!(decode_date(19_723, "d").unwrap(), "2024-01-01");
        assert_eq!(decode_date(-1, "d").unwrap(), "1969-12-31");
    }

    #[test]
    fn timestamp_millis_format() {
        assert_eq!(
            decode_timestamp_millis(0, "ts").unwrap(),
            "1970-01-01 00:00:00.000"
        );
        assert_eq!(
            decode_timestamp_millis(1_700_000_000_123, "ts").unwrap(),
            "2023-11-14 22:13:20.123"
        );
    }

    #[test]
    fn timestamp_micros_truncates_to_millis() {
        assert_eq!(
            decode_timestamp_micros(1_500_999, "ts").unwrap(),
            "1970-01-01 00:00:01.500"
        );
    }

    #[test]
    fn bits_little_endian_trimmed() {
        // value 5 in one byte, declared length 3 -> "101"
        let b = B64.encode([0b0000_0101u8].as_slice());
        assert_eq!(decode_bits(&b, Some(3), "flags").unwrap(), "101");
    }

    #[test]
    fn bits_span_byte_boundary() {
        // bytes are little-endian: bit 8 lives in the second byte
        let b = B64.encode([0x00u8, 0x01].as_slice());
        assert_eq!(decode_bits(&b, Some(9), "flags").unwrap(), "100000000");
    }

    #[test]
    fn bytea_hex() {
        let b = B64.encode([0xDEu8, 0xAD, 0x00, 0xEF].as_slice());
        assert_eq!(decode_bytea(&b, "blob").unwrap(), "\\xdead00ef");
    }

    #[test]
    fn plain_values() {
        assert_eq!(render_plain(&json!(null)), None);
        assert_eq!(render_plain(&json!("a")), Some("a".into()));
        assert_eq!(render_plain(&json!(3.5)), Some("3.5".into()));
        assert_eq!(render_plain(&json!(true)), Some("true".into()));
    }

    #[test]
    fn zoned_timestamp_passes_through() {
        let fs = FieldSchema {
            type_name: "string".into(),
            logical: Some(LOGICAL_ZONED_TIMESTAMP.into()),
            ..Default::default()
        };
        let v = json!("2024-01-01T00:00:00Z");
        assert_eq!(
            render_value(&v, Some(&fs), "ts").unwrap(),
            Some("2024-01-01T00:00:00Z".into())
        );
    }

    #[test]
    fn unknown_logical_passes_through() {
        let fs = FieldSchema {
            type_name: "string".into(),
            logical: Some("io.debezium.data.Json".into()),
            ..Default::default()
        };
        let v = json!("{\"k\":1}");
        assert_eq!(
            render_value(&v, Some(&fs), "doc").unwrap(),
            Some("{\"k\":1}".into())
        );
    }
}
