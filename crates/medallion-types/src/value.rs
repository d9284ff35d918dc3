//! Typed cell values and column types.
//!
//! Raw batches arrive as loosely typed JSON. [`ColumnType::coerce_json`]
//! turns a raw value into a typed [`Value`], and [`Value::key_repr`] gives the
//! type-normalized form used whenever two values must compare equal across
//! representations (merge keys, group keys).

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Accepted non-RFC-3339 timestamp layouts, tried in order.
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Declared type of a schema column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    String,
    Timestamp,
}

impl ColumnType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Timestamp => "timestamp",
        }
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Coerce a raw JSON value into this type.
    ///
    /// JSON `null` always coerces to [`Value::Null`]; nullability is checked
    /// by the schema, not here.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the value cannot be represented.
    pub fn coerce_json(self, raw: &serde_json::Value) -> Result<Value, String> {
        match raw {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => self.coerce(&Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                let value = if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    return Err(format!("number {n} is out of range"));
                };
                self.coerce(&value)
            }
            serde_json::Value::String(s) => self.coerce(&Value::Str(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Err(format!("nested value cannot be coerced to {}", self.as_str()))
            }
        }
    }

    /// Coerce an already typed value into this type.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the conversion is lossy or
    /// impossible.
    pub fn coerce(self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),

            (Self::Boolean, Value::Bool(b)) => Ok(Value::Bool(*b)),
            (Self::Boolean, Value::Int(0)) => Ok(Value::Bool(false)),
            (Self::Boolean, Value::Int(1)) => Ok(Value::Bool(true)),
            (Self::Boolean, Value::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                other => Err(format!("'{other}' is not a boolean")),
            },

            (Self::Integer, Value::Int(i)) => Ok(Value::Int(*i)),
            (Self::Integer, Value::Float(f)) => float_to_int(*f),
            (Self::Integer, Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
            (Self::Integer, Value::Str(s)) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .map(Value::Int)
                    .or_else(|_| {
                        trimmed
                            .parse::<f64>()
                            .map_err(|_| format!("'{trimmed}' is not an integer"))
                            .and_then(float_to_int)
                    })
            }

            (Self::Float, Value::Float(f)) => finite(*f),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, Value::Int(i)) => Ok(Value::Float(*i as f64)),
            (Self::Float, Value::Str(s)) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<f64>()
                    .map_err(|_| format!("'{trimmed}' is not a number"))
                    .and_then(finite)
            }

            (Self::String, Value::Str(s)) => Ok(Value::Str(s.clone())),
            (Self::String, Value::Timestamp(ts)) => Ok(Value::Str(ts.to_rfc3339())),
            (Self::String, other) => Ok(Value::Str(other.to_string())),

            (Self::Timestamp, Value::Timestamp(ts)) => Ok(Value::Timestamp(*ts)),
            (Self::Timestamp, Value::Int(ms)) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .map(Value::Timestamp)
                .ok_or_else(|| format!("{ms} is not a valid epoch-millis timestamp")),
            (Self::Timestamp, Value::Str(s)) => parse_timestamp(s.trim())
                .map(Value::Timestamp)
                .ok_or_else(|| format!("'{}' is not a recognised timestamp", s.trim())),

            (target, other) => Err(format!(
                "{} value '{other}' cannot be coerced to {}",
                other.type_name(),
                target.as_str()
            )),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn float_to_int(f: f64) -> Result<Value, String> {
    #[allow(clippy::cast_precision_loss)]
    let in_range = f.is_finite() && f.fract() == 0.0 && f.abs() <= i64::MAX as f64;
    if in_range {
        #[allow(clippy::cast_possible_truncation)]
        let as_int = f as i64;
        Ok(Value::Int(as_int))
    } else {
        Err(format!("{f} is not an integer"))
    }
}

fn finite(f: f64) -> Result<Value, String> {
    if f.is_finite() {
        Ok(Value::Float(f))
    } else {
        Err(format!("{f} is not a finite number"))
    }
}

/// Parse the timestamp layouts accepted at ingestion.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ndt.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Timestamp(_) => "timestamp",
        }
    }

    /// Numeric view used by range checks and aggregation.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Loose conversion for fields outside the schema (the extra bucket).
    ///
    /// Nested arrays and objects are kept as their JSON text.
    #[must_use]
    pub fn from_json_loose(raw: &serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or_else(|| Self::Str(n.to_string())),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }

    /// Convert to a JSON value, e.g. for config defaults or CLI output.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
        }
    }

    /// Type-normalized canonical form.
    ///
    /// Integral floats render like integers so `Int(5)` and `Float(5.0)`
    /// match; strings are trimmed; timestamps use RFC 3339 in UTC at full
    /// sub-second precision.
    #[must_use]
    pub fn key_repr(&self) -> String {
        match self {
            Self::Null => "\u{2205}".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    #[allow(clippy::cast_possible_truncation)]
                    let as_int = *f as i64;
                    as_int.to_string()
                } else {
                    f.to_string()
                }
            }
            Self::Str(s) => s.trim().to_string(),
            Self::Timestamp(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        }
    }

    /// Lossless rendering used to decide whether two rows carry the same
    /// content. Unlike [`Value::key_repr`] nothing is trimmed or normalized.
    #[must_use]
    pub fn content_repr(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Float(f) => format!("{f:?}"),
            other => other.key_repr(),
        }
    }

    /// Total order used for min/max aggregation and deterministic sorting.
    ///
    /// Nulls sort first; numbers compare numerically across int/float;
    /// values of different kinds fall back to their type name.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.type_name().cmp(b.type_name()),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Timestamp(ts) => f.write_str(&ts.to_rfc3339()),
        }
    }
}
