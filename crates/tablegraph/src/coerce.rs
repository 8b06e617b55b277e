//! Coercion between storage values and declared field types.
//!
//! Drivers hand back whatever shape the column happens to have (SQLite, for
//! instance, returns every temporal value as text and every boolean as an
//! integer). `to_domain` turns such a value into the shape of the declared
//! [`FieldType`] and `to_storage` prepares a domain value for binding.
//!
//! Rules:
//! - numeric values widen exactly; narrowing that would lose information fails
//! - every temporal shape converts through a single UTC instant
//! - a per-field [`ValueConverter`] overrides the built-in rules

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

use crate::registry::FieldDescriptor;
use crate::value::{FieldType, SqlValue};
use crate::{Result, TableGraphError};

/// Pluggable per-field conversion between domain and storage shape.
pub trait ValueConverter: Send + Sync + fmt::Debug {
    /// Converts a domain value into the value written to the column.
    fn to_storage(&self, value: SqlValue) -> Result<SqlValue>;

    /// Converts a column value back into the domain shape.
    fn to_domain(&self, value: SqlValue) -> Result<SqlValue>;
}

/// Stores booleans as `'Y'` / `'N'` text.
///
/// Any stored text other than `Y` reads back as `false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YesNoConverter;

impl ValueConverter for YesNoConverter {
    fn to_storage(&self, value: SqlValue) -> Result<SqlValue> {
        match value {
            SqlValue::Null => Ok(SqlValue::Null),
            SqlValue::Bool(true) => Ok(SqlValue::String("Y".to_string())),
            SqlValue::Bool(false) => Ok(SqlValue::String("N".to_string())),
            SqlValue::String(s) if s == "Y" || s == "N" => Ok(SqlValue::String(s)),
            other => Err(TableGraphError::Conversion(format!(
                "Y/N converter expects a BOOLEAN, found {}",
                other.type_name()
            ))),
        }
    }

    fn to_domain(&self, value: SqlValue) -> Result<SqlValue> {
        match value {
            SqlValue::Null => Ok(SqlValue::Null),
            SqlValue::Bool(b) => Ok(SqlValue::Bool(b)),
            SqlValue::String(s) => Ok(SqlValue::Bool(s == "Y")),
            other => Err(TableGraphError::Conversion(format!(
                "Y/N converter expects TEXT, found {}",
                other.type_name()
            ))),
        }
    }
}

/// Prepares a domain value of `field` for binding.
///
/// System-managed fields ignore the supplied value and receive `now`. Without
/// a converter the value is bound in the shape of the declared type, so an
/// `Int` field given a `BigInt` binds as `Int` on every backend.
pub fn to_storage(value: SqlValue, field: &FieldDescriptor, now: DateTime<Utc>) -> Result<SqlValue> {
    let value = if field.system_managed {
        SqlValue::TimestampTz(now)
    } else {
        value
    };
    let stored = match &field.converter {
        Some(converter) if !field.system_managed => converter.to_storage(value),
        _ => to_domain(value, field.field_type),
    };
    stored.map_err(|e| with_column(e, &field.column))
}

/// Turns a column value read from a session into the domain shape of `field`.
pub fn from_storage(value: SqlValue, field: &FieldDescriptor) -> Result<SqlValue> {
    let value = match &field.converter {
        Some(converter) => converter.to_domain(value).map_err(|e| with_column(e, &field.column))?,
        None => value,
    };
    to_domain(value, field.field_type).map_err(|e| with_column(e, &field.column))
}

fn with_column(err: TableGraphError, column: &str) -> TableGraphError {
    match err {
        TableGraphError::Conversion(msg) => {
            TableGraphError::Conversion(format!("column '{}': {}", column, msg))
        }
        other => other,
    }
}

/// Coerces `value` into the shape of `target`.
pub fn to_domain(value: SqlValue, target: FieldType) -> Result<SqlValue> {
    if value.is_null() || has_shape(&value, target) {
        return Ok(value);
    }
    match target {
        FieldType::Bool => to_bool(value),
        FieldType::SmallInt => {
            let wide = to_i64(value, target)?;
            i16::try_from(wide)
                .map(SqlValue::SmallInt)
                .map_err(|_| overflow(wide, target))
        }
        FieldType::Int => {
            let wide = to_i64(value, target)?;
            i32::try_from(wide)
                .map(SqlValue::Int)
                .map_err(|_| overflow(wide, target))
        }
        FieldType::BigInt => to_i64(value, target).map(SqlValue::BigInt),
        FieldType::Float => to_f32(value).map(SqlValue::Float),
        FieldType::Double => to_f64(value).map(SqlValue::Double),
        FieldType::Decimal => to_decimal(value).map(SqlValue::Decimal),
        FieldType::String => to_text(value).map(SqlValue::String),
        FieldType::Bytes => to_bytes(value).map(SqlValue::Bytes),
        FieldType::Uuid => to_uuid(value).map(SqlValue::Uuid),
        FieldType::Json => to_json(value).map(SqlValue::Json),
        FieldType::Date | FieldType::Time | FieldType::Timestamp | FieldType::TimestampTz => {
            let instant = to_instant(value)?;
            Ok(from_instant(instant, target))
        }
    }
}

fn has_shape(value: &SqlValue, target: FieldType) -> bool {
    matches!(
        (value, target),
        (SqlValue::Bool(_), FieldType::Bool)
            | (SqlValue::SmallInt(_), FieldType::SmallInt)
            | (SqlValue::Int(_), FieldType::Int)
            | (SqlValue::BigInt(_), FieldType::BigInt)
            | (SqlValue::Float(_), FieldType::Float)
            | (SqlValue::Double(_), FieldType::Double)
            | (SqlValue::Decimal(_), FieldType::Decimal)
            | (SqlValue::String(_), FieldType::String)
            | (SqlValue::Bytes(_), FieldType::Bytes)
            | (SqlValue::Uuid(_), FieldType::Uuid)
            | (SqlValue::Date(_), FieldType::Date)
            | (SqlValue::Time(_), FieldType::Time)
            | (SqlValue::Timestamp(_), FieldType::Timestamp)
            | (SqlValue::TimestampTz(_), FieldType::TimestampTz)
            | (SqlValue::Json(_), FieldType::Json)
    )
}

fn unsupported(value: &SqlValue, target: FieldType) -> TableGraphError {
    TableGraphError::Conversion(format!(
        "cannot convert {} to {}",
        value.type_name(),
        target.sql_name()
    ))
}

fn overflow(value: impl fmt::Display, target: FieldType) -> TableGraphError {
    TableGraphError::Conversion(format!(
        "{} does not fit {} without losing information",
        value,
        target.sql_name()
    ))
}

fn to_bool(value: SqlValue) -> Result<SqlValue> {
    let flag = match &value {
        SqlValue::SmallInt(v) => int_flag(i64::from(*v)),
        SqlValue::Int(v) => int_flag(i64::from(*v)),
        SqlValue::BigInt(v) => int_flag(*v),
        SqlValue::Decimal(d) => d.to_i64().and_then(int_flag),
        SqlValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Some(true),
            "false" | "f" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    };
    flag.map(SqlValue::Bool)
        .ok_or_else(|| unsupported_value(&value, FieldType::Bool))
}

fn int_flag(v: i64) -> Option<bool> {
    match v {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

fn unsupported_value(value: &SqlValue, target: FieldType) -> TableGraphError {
    TableGraphError::Conversion(format!(
        "cannot convert {} '{}' to {}",
        value.type_name(),
        value,
        target.sql_name()
    ))
}

fn to_i64(value: SqlValue, target: FieldType) -> Result<i64> {
    match value {
        SqlValue::Bool(b) => Ok(i64::from(b)),
        SqlValue::SmallInt(v) => Ok(i64::from(v)),
        SqlValue::Int(v) => Ok(i64::from(v)),
        SqlValue::BigInt(v) => Ok(v),
        SqlValue::Float(f) => float_to_i64(f64::from(f), target),
        SqlValue::Double(d) => float_to_i64(d, target),
        SqlValue::Decimal(d) => {
            if !d.fract().is_zero() {
                return Err(overflow(d, target));
            }
            d.to_i64().ok_or_else(|| overflow(d, target))
        }
        SqlValue::String(s) => s.trim().parse::<i64>().map_err(|_| {
            TableGraphError::Conversion(format!("'{}' is not an integer", s))
        }),
        // Temporal values read as integers are epoch milliseconds.
        SqlValue::TimestampTz(t) => Ok(t.timestamp_millis()),
        SqlValue::Timestamp(t) => Ok(t.and_utc().timestamp_millis()),
        other => Err(unsupported(&other, target)),
    }
}

fn float_to_i64(d: f64, target: FieldType) -> Result<i64> {
    // 2^63 is exactly representable; anything at or above it overflows.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if d.is_finite() && d.fract() == 0.0 && d >= -LIMIT && d < LIMIT {
        Ok(d as i64)
    } else {
        Err(overflow(d, target))
    }
}

fn int_to_f64(v: i64) -> Result<f64> {
    let f = v as f64;
    if f as i128 == i128::from(v) {
        Ok(f)
    } else {
        Err(overflow(v, FieldType::Double))
    }
}

fn to_f64(value: SqlValue) -> Result<f64> {
    match value {
        SqlValue::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
        SqlValue::SmallInt(v) => Ok(f64::from(v)),
        SqlValue::Int(v) => Ok(f64::from(v)),
        SqlValue::BigInt(v) => int_to_f64(v),
        SqlValue::Float(f) => Ok(f64::from(f)),
        SqlValue::Double(d) => Ok(d),
        SqlValue::Decimal(d) => d.to_f64().ok_or_else(|| overflow(d, FieldType::Double)),
        SqlValue::String(s) => s.trim().parse::<f64>().map_err(|_| {
            TableGraphError::Conversion(format!("'{}' is not a number", s))
        }),
        other => Err(unsupported(&other, FieldType::Double)),
    }
}

fn to_f32(value: SqlValue) -> Result<f32> {
    let wide = to_f64(value)?;
    let narrow = wide as f32;
    if wide.is_nan() || f64::from(narrow) == wide {
        Ok(narrow)
    } else {
        Err(overflow(wide, FieldType::Float))
    }
}

fn to_decimal(value: SqlValue) -> Result<Decimal> {
    match value {
        SqlValue::Bool(b) => Ok(Decimal::from(i64::from(b))),
        SqlValue::SmallInt(v) => Ok(Decimal::from(v)),
        SqlValue::Int(v) => Ok(Decimal::from(v)),
        SqlValue::BigInt(v) => Ok(Decimal::from(v)),
        // Display renders the shortest representation that round-trips.
        SqlValue::Float(f) => parse_decimal(&f.to_string()),
        SqlValue::Double(d) => parse_decimal(&d.to_string()),
        SqlValue::String(s) => parse_decimal(s.trim()),
        other => Err(unsupported(&other, FieldType::Decimal)),
    }
}

fn parse_decimal(text: &str) -> Result<Decimal> {
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| TableGraphError::Conversion(format!("'{}' is not a decimal", text)))
}

fn to_text(value: SqlValue) -> Result<String> {
    match value {
        SqlValue::String(s) => Ok(s),
        SqlValue::Json(JsonValue::String(s)) => Ok(s),
        SqlValue::Bytes(b) => String::from_utf8(b)
            .map_err(|e| TableGraphError::Conversion(format!("bytes are not UTF-8: {}", e))),
        other => Ok(other.to_string()),
    }
}

fn to_bytes(value: SqlValue) -> Result<Vec<u8>> {
    match value {
        SqlValue::Bytes(b) => Ok(b),
        SqlValue::String(s) => Ok(s.into_bytes()),
        SqlValue::Uuid(u) => Ok(u.as_bytes().to_vec()),
        other => Err(unsupported(&other, FieldType::Bytes)),
    }
}

fn to_uuid(value: SqlValue) -> Result<Uuid> {
    match value {
        SqlValue::String(s) => Uuid::parse_str(s.trim())
            .map_err(|e| TableGraphError::Conversion(format!("'{}' is not a UUID: {}", s, e))),
        SqlValue::Bytes(b) => Uuid::from_slice(&b)
            .map_err(|e| TableGraphError::Conversion(format!("bytes are not a UUID: {}", e))),
        other => Err(unsupported(&other, FieldType::Uuid)),
    }
}

fn to_json(value: SqlValue) -> Result<JsonValue> {
    match value {
        SqlValue::String(s) => serde_json::from_str(&s)
            .map_err(|e| TableGraphError::Conversion(format!("text is not JSON: {}", e))),
        SqlValue::Bytes(b) => serde_json::from_slice(&b)
            .map_err(|e| TableGraphError::Conversion(format!("bytes are not JSON: {}", e))),
        SqlValue::Bool(b) => Ok(JsonValue::Bool(b)),
        SqlValue::SmallInt(v) => Ok(JsonValue::from(v)),
        SqlValue::Int(v) => Ok(JsonValue::from(v)),
        SqlValue::BigInt(v) => Ok(JsonValue::from(v)),
        SqlValue::Float(f) => json_number(f64::from(f)),
        SqlValue::Double(d) => json_number(d),
        other => Err(unsupported(&other, FieldType::Json)),
    }
}

fn json_number(d: f64) -> Result<JsonValue> {
    serde_json::Number::from_f64(d)
        .map(JsonValue::Number)
        .ok_or_else(|| TableGraphError::Conversion(format!("{} is not a finite JSON number", d)))
}

fn epoch_date() -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .ok_or_else(|| TableGraphError::Internal("epoch date out of range".to_string()))
}

/// Converts any temporal shape into the UTC instant pivot.
fn to_instant(value: SqlValue) -> Result<DateTime<Utc>> {
    match value {
        SqlValue::TimestampTz(t) => Ok(t),
        SqlValue::Timestamp(t) => Ok(t.and_utc()),
        SqlValue::Date(d) => d
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .ok_or_else(|| TableGraphError::Conversion(format!("invalid date {}", d))),
        SqlValue::Time(t) => Ok(epoch_date()?.and_time(t).and_utc()),
        SqlValue::SmallInt(v) => millis_to_instant(i64::from(v)),
        SqlValue::Int(v) => millis_to_instant(i64::from(v)),
        SqlValue::BigInt(v) => millis_to_instant(v),
        SqlValue::String(s) => parse_instant(s.trim()),
        other => Err(TableGraphError::Conversion(format!(
            "cannot convert {} to a date/time value",
            other.type_name()
        ))),
    }
}

fn millis_to_instant(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        TableGraphError::Conversion(format!("{} ms is outside the supported time range", millis))
    })
}

const ZONED_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"];
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

fn parse_instant(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ZONED_FORMATS {
        if let Ok(t) = DateTime::parse_from_str(text, format) {
            return Ok(t.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(t.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return to_instant(SqlValue::Date(d));
    }
    if let Ok(t) = NaiveTime::parse_from_str(text, "%H:%M:%S%.f") {
        return to_instant(SqlValue::Time(t));
    }
    Err(TableGraphError::Conversion(format!(
        "'{}' is not a recognized date/time",
        text
    )))
}

fn from_instant(instant: DateTime<Utc>, target: FieldType) -> SqlValue {
    match target {
        FieldType::Date => SqlValue::Date(instant.date_naive()),
        FieldType::Time => SqlValue::Time(instant.time()),
        FieldType::Timestamp => SqlValue::Timestamp(instant.naive_utc()),
        _ => SqlValue::TimestampTz(instant),
    }
}
