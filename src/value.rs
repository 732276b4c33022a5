// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed attribute values and their wire encoding.
//!
//! Feature attributes cross the wire as JSON. Scalars map directly; date/time
//! values are decomposed into explicit numeric components rather than a
//! locale-formatted string so the encoding is deterministic across systems:
//!
//! ```json
//! { "year": 2026, "month": 8, "day": 27, "hour": 14, "minute": 5, "second": 0 }
//! ```
//!
//! Inside the replica store, each feature's attributes are persisted as a
//! JSON array positionally keyed by attribute index, using the same encoding.

use crate::error::{Result, SyncError};
use serde_json::{json, Value};

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    /// Decomposed date/time. `hour`/`minute`/`second` are zero for pure dates.
    DateTime {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    },
}

impl FieldValue {
    /// Encode to the wire/store JSON representation.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Integer(v) => json!(v),
            FieldValue::Real(v) => json!(v),
            FieldValue::Text(v) => json!(v),
            FieldValue::Bool(v) => json!(v),
            FieldValue::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
            } => json!({
                "year": year,
                "month": month,
                "day": day,
                "hour": hour,
                "minute": minute,
                "second": second,
            }),
        }
    }

    /// Decode from the wire/store JSON representation.
    ///
    /// Integer-valued JSON numbers decode as `Integer`, everything else
    /// numeric as `Real`. Objects must carry at least `year`/`month`/`day`;
    /// missing time components default to zero.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(FieldValue::Null),
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(FieldValue::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(FieldValue::Real(f))
                } else {
                    Err(SyncError::Synchronization(format!(
                        "unrepresentable number in field value: {}",
                        n
                    )))
                }
            }
            Value::String(s) => Ok(FieldValue::Text(s.clone())),
            Value::Object(map) => {
                let part = |key: &str| -> Result<i64> {
                    map.get(key)
                        .and_then(Value::as_i64)
                        .ok_or_else(|| {
                            SyncError::Synchronization(format!(
                                "date value missing numeric '{}' component",
                                key
                            ))
                        })
                };
                let opt_part = |key: &str| map.get(key).and_then(Value::as_u64).unwrap_or(0) as u32;
                Ok(FieldValue::DateTime {
                    year: part("year")? as i32,
                    month: part("month")? as u32,
                    day: part("day")? as u32,
                    hour: opt_part("hour"),
                    minute: opt_part("minute"),
                    second: opt_part("second"),
                })
            }
            Value::Array(_) => Err(SyncError::Synchronization(
                "array is not a valid field value".to_string(),
            )),
        }
    }
}
