//! Typed scalar values
//!
//! Client-supplied JSON is coerced to a [`Scalar`] of the declared column
//! type before it reaches a predicate or the store. Stored rows always hold
//! the canonical JSON rendering produced by [`Scalar::to_json`].

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use uuid::Uuid;

use crate::model::FieldType;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// A coerced, typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    Uuid(Uuid),
    Json(Value),
}

impl Scalar {
    /// Coerce a JSON value to the given column type.
    ///
    /// Numbers accept numeric strings; dates, datetimes and times accept
    /// ISO-8601 strings. `null` always coerces to [`Scalar::Null`];
    /// nullability is checked by callers.
    pub fn coerce(field_type: FieldType, value: &Value) -> Result<Self, String> {
        if value.is_null() {
            return Ok(Self::Null);
        }
        match field_type {
            FieldType::Integer => coerce_integer(value),
            FieldType::Float => coerce_float(value),
            FieldType::String | FieldType::Text => match value {
                Value::String(s) => Ok(Self::Text(s.clone())),
                _ => Err(format!("expected a string, got {value}")),
            },
            FieldType::Boolean => coerce_bool(value),
            FieldType::Date => expect_str(value, "date")
                .and_then(|s| parse_date(s).ok_or_else(|| format!("'{s}' is not an ISO-8601 date")))
                .map(Self::Date),
            FieldType::DateTime => expect_str(value, "datetime")
                .and_then(|s| {
                    parse_datetime(s).ok_or_else(|| format!("'{s}' is not an ISO-8601 datetime"))
                })
                .map(Self::DateTime),
            FieldType::Time => expect_str(value, "time")
                .and_then(|s| parse_time(s).ok_or_else(|| format!("'{s}' is not an ISO-8601 time")))
                .map(Self::Time),
            FieldType::Uuid => expect_str(value, "uuid")
                .and_then(|s| Uuid::parse_str(s).map_err(|e| format!("'{s}' is not a UUID: {e}")))
                .map(Self::Uuid),
            FieldType::Json => Ok(Self::Json(value.clone())),
        }
    }

    /// Read a stored value back into its typed form
    pub fn from_stored(field_type: FieldType, value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Null,
            Some(v) => Self::coerce(field_type, v).unwrap_or_else(|_| Self::Json(v.clone())),
        }
    }

    /// Canonical JSON rendering
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Text(s) => Value::String(s.clone()),
            Self::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Self::DateTime(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Self::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            Self::Uuid(u) => Value::String(u.hyphenated().to_string()),
            Self::Json(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering between two values of compatible types.
    ///
    /// Integers and floats compare numerically; a date compares with a
    /// datetime at midnight. `None` for nulls and incompatible types.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::DateTime(b)) => Some(a.and_time(NaiveTime::MIN).cmp(b)),
            (Self::DateTime(a), Self::Date(b)) => Some(a.cmp(&b.and_time(NaiveTime::MIN))),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            (Self::Json(a), Self::Json(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Equality under [`Scalar::compare`]
    pub fn matches(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Value::String(s) => f.write_str(&s),
            other => write!(f, "{other}"),
        }
    }
}

fn expect_str<'a>(value: &'a Value, kind: &str) -> Result<&'a str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected an ISO-8601 {kind} string, got {value}"))
}

fn coerce_integer(value: &Value) -> Result<Scalar, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Scalar::Int(i));
            }
            match n.as_f64() {
                #[allow(clippy::cast_possible_truncation)]
                Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Scalar::Int(f as i64)),
                _ => Err(format!("expected an integer, got {n}")),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Scalar::Int)
            .map_err(|_| format!("expected an integer, got '{s}'")),
        other => Err(format!("expected an integer, got {other}")),
    }
}

fn coerce_float(value: &Value) -> Result<Scalar, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(Scalar::Float)
            .ok_or_else(|| format!("expected a number, got {n}")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Scalar::Float)
            .map_err(|_| format!("expected a number, got '{s}'")),
        other => Err(format!("expected a number, got {other}")),
    }
}

fn coerce_bool(value: &Value) -> Result<Scalar, String> {
    match value {
        Value::Bool(b) => Ok(Scalar::Bool(*b)),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Scalar::Bool(true)),
            "false" | "0" => Ok(Scalar::Bool(false)),
            _ => Err(format!("expected a boolean, got '{s}'")),
        },
        other => Err(format!("expected a boolean, got {other}")),
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date()))
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
}
