//! Data point definitions and boundary validation for ingested batches.
//!
//! Incoming payloads arrive as raw JSON. Every record is checked here before
//! the pipeline sees it, so a malformed record rejects the whole batch with no
//! side effects.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A single telemetry measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(rename = "type")]
    pub point_type: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, JsonValue>>,
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    pub fn new(point_type: impl Into<String>, value: f64) -> Self {
        Self {
            point_type: point_type.into(),
            value,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, JsonValue>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Parse and validate a raw batch.
///
/// Returns the first violation found; nothing is partially accepted.
pub fn parse_batch(records: &[JsonValue]) -> Result<Vec<DataPoint>, String> {
    if records.is_empty() {
        return Err("batch must contain at least one data point".to_string());
    }

    let received_at = Utc::now();
    records
        .iter()
        .enumerate()
        .map(|(idx, record)| parse_point(record, idx, received_at))
        .collect()
}

/// Validate points constructed in-process (not parsed from JSON).
pub fn validate_points(points: &[DataPoint]) -> Result<(), String> {
    if points.is_empty() {
        return Err("batch must contain at least one data point".to_string());
    }
    for (idx, point) in points.iter().enumerate() {
        if point.point_type.trim().is_empty() {
            return Err(format!("point {}: field 'type' must be a non-empty string", idx));
        }
        if !point.value.is_finite() {
            return Err(format!("point {}: field 'value' must be a finite number", idx));
        }
    }
    Ok(())
}

fn parse_point(
    json: &JsonValue,
    idx: usize,
    received_at: DateTime<Utc>,
) -> Result<DataPoint, String> {
    let obj = json.as_object().ok_or_else(|| {
        format!(
            "point {}: expected object, got {}",
            idx,
            json_type_name(json)
        )
    })?;

    let point_type = match obj.get("type") {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(JsonValue::String(_)) => {
            return Err(format!("point {}: field 'type' must not be empty", idx));
        }
        Some(other) => {
            return Err(format!(
                "point {}: field 'type' has wrong type, expected string, got {}. Point: {}",
                idx,
                json_type_name(other),
                truncate_json(json, 200)
            ));
        }
        None => {
            return Err(format!(
                "point {}: missing required field 'type'. Point: {}",
                idx,
                truncate_json(json, 200)
            ));
        }
    };

    let value = match obj.get("value") {
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("point {}: field 'value' is not a finite number", idx))?,
        Some(other) => {
            return Err(format!(
                "point {}: field 'value' has wrong type, expected number, got {}",
                idx,
                json_type_name(other)
            ));
        }
        None => {
            return Err(format!(
                "point {}: missing required field 'value'. Point: {}",
                idx,
                truncate_json(json, 200)
            ));
        }
    };

    let metadata = match obj.get("metadata") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::Object(map)) => Some(map.clone()),
        Some(other) => {
            return Err(format!(
                "point {}: field 'metadata' must be an object, got {}",
                idx,
                json_type_name(other)
            ));
        }
    };

    let timestamp = match obj.get("timestamp") {
        None | Some(JsonValue::Null) => received_at,
        Some(value) => parse_timestamp(value)
            .ok_or_else(|| format!("point {}: field 'timestamp' is not a valid time", idx))?,
    };

    Ok(DataPoint {
        point_type,
        value,
        metadata,
        timestamp,
    })
}

/// Accepts RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn json_type_name(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn truncate_json(json: &JsonValue, max_len: usize) -> String {
    let s = serde_json::to_string(json).unwrap_or_else(|_| "<serialize failed>".into());
    if s.len() > max_len {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    } else {
        s
    }
}
