//! Scalar values exchanged with SQL sessions.
//!
//! `SqlValue` is the single representation used for bound parameters, decoded
//! result columns and entity field values. The coercion service
//! ([`crate::coerce`]) moves values between their storage shape and the
//! declared [`FieldType`] of a field.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

use crate::coerce;
use crate::{Result, TableGraphError};

/// A nullable SQL scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL value
    Null,
    /// Boolean (BOOLEAN)
    Bool(bool),
    /// Small integer (SMALLINT)
    SmallInt(i16),
    /// Integer (INTEGER)
    Int(i32),
    /// Big integer (BIGINT)
    BigInt(i64),
    /// Single-precision float (REAL)
    Float(f32),
    /// Double-precision float (DOUBLE PRECISION)
    Double(f64),
    /// Variable-length string (VARCHAR, TEXT)
    String(String),
    /// Binary data (BYTEA, BLOB)
    Bytes(Vec<u8>),
    /// UUID
    Uuid(Uuid),
    /// Date (DATE)
    Date(NaiveDate),
    /// Time of day (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    Timestamp(NaiveDateTime),
    /// Timestamp with timezone, normalized to UTC (TIMESTAMPTZ)
    TimestampTz(DateTime<Utc>),
    /// JSON/JSONB
    Json(JsonValue),
    /// Decimal/Numeric (NUMERIC, DECIMAL)
    Decimal(Decimal),
}

impl SqlValue {
    /// Returns the SQL type name for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Bool(_) => "BOOLEAN",
            SqlValue::SmallInt(_) => "SMALLINT",
            SqlValue::Int(_) => "INTEGER",
            SqlValue::BigInt(_) => "BIGINT",
            SqlValue::Float(_) => "REAL",
            SqlValue::Double(_) => "DOUBLE PRECISION",
            SqlValue::String(_) => "TEXT",
            SqlValue::Bytes(_) => "BYTEA",
            SqlValue::Uuid(_) => "UUID",
            SqlValue::Date(_) => "DATE",
            SqlValue::Time(_) => "TIME",
            SqlValue::Timestamp(_) => "TIMESTAMP",
            SqlValue::TimestampTz(_) => "TIMESTAMPTZ",
            SqlValue::Json(_) => "JSONB",
            SqlValue::Decimal(_) => "NUMERIC",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Identity key of this value when used as an entity id.
    ///
    /// Returns `None` for NULL. Integers of every width (and integral
    /// decimals) share one key space, so an id read back as `BIGINT` matches
    /// the same id supplied as `INTEGER`.
    pub fn id_key(&self) -> Option<IdKey> {
        let key = match self {
            SqlValue::Null => return None,
            SqlValue::Bool(v) => IdKey::Int(i64::from(*v)),
            SqlValue::SmallInt(v) => IdKey::Int(i64::from(*v)),
            SqlValue::Int(v) => IdKey::Int(i64::from(*v)),
            SqlValue::BigInt(v) => IdKey::Int(*v),
            SqlValue::Decimal(d) if d.fract().is_zero() => match d.to_i64() {
                Some(v) => IdKey::Int(v),
                None => IdKey::Text(d.normalize().to_string()),
            },
            SqlValue::Decimal(d) => IdKey::Text(d.normalize().to_string()),
            SqlValue::String(s) => IdKey::Text(s.clone()),
            SqlValue::Uuid(u) => IdKey::Uuid(*u),
            SqlValue::Bytes(b) => IdKey::Bytes(b.clone()),
            other => IdKey::Text(other.to_string()),
        };
        Some(key)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::SmallInt(v) => write!(f, "{}", v),
            SqlValue::Int(v) => write!(f, "{}", v),
            SqlValue::BigInt(v) => write!(f, "{}", v),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::Double(v) => write!(f, "{}", v),
            SqlValue::String(v) => f.write_str(v),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            SqlValue::Uuid(v) => write!(f, "{}", v),
            SqlValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            SqlValue::Time(v) => write!(f, "{}", v.format("%H:%M:%S%.f")),
            SqlValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            SqlValue::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
            SqlValue::Json(v) => write!(f, "{}", v),
            SqlValue::Decimal(v) => write!(f, "{}", v),
        }
    }
}

/// Hashable, ordered identity of an id value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdKey {
    Int(i64),
    Uuid(Uuid),
    Text(String),
    Bytes(Vec<u8>),
}

/// Declared domain type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    String,
    Bytes,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
}

impl FieldType {
    /// Returns the SQL type name values of this field type carry.
    pub fn sql_name(&self) -> &'static str {
        match self {
            FieldType::Bool => "BOOLEAN",
            FieldType::SmallInt => "SMALLINT",
            FieldType::Int => "INTEGER",
            FieldType::BigInt => "BIGINT",
            FieldType::Float => "REAL",
            FieldType::Double => "DOUBLE PRECISION",
            FieldType::Decimal => "NUMERIC",
            FieldType::String => "TEXT",
            FieldType::Bytes => "BYTEA",
            FieldType::Uuid => "UUID",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::TimestampTz => "TIMESTAMPTZ",
            FieldType::Json => "JSONB",
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            FieldType::Date | FieldType::Time | FieldType::Timestamp | FieldType::TimestampTz
        )
    }
}

/// Extraction of a Rust value out of a [`SqlValue`].
///
/// Every implementation first coerces the value to its own [`FieldType`], so
/// a `BIGINT` column can be read into an `i32` as long as it fits.
pub trait FromValue: Sized {
    fn from_value(value: SqlValue) -> Result<Self>;
}

/// Types usable as a repository id.
pub trait IdValue: FromValue + Into<SqlValue> + Clone + Send + Sync + 'static {
    /// Field type the entity's id field must be declared with.
    const FIELD_TYPE: FieldType;
}

fn unexpected<T>(expected: FieldType, value: &SqlValue) -> Result<T> {
    Err(TableGraphError::Conversion(format!(
        "expected {} but found {}",
        expected.sql_name(),
        value.type_name()
    )))
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident, $field:ident;)*) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    SqlValue::$variant(value)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: SqlValue) -> Result<Self> {
                    match coerce::to_domain(value, FieldType::$field)? {
                        SqlValue::$variant(v) => Ok(v),
                        other => unexpected(FieldType::$field, &other),
                    }
                }
            }
        )*
    };
}

value_conversions! {
    bool => Bool, Bool;
    i16 => SmallInt, SmallInt;
    i32 => Int, Int;
    i64 => BigInt, BigInt;
    f32 => Float, Float;
    f64 => Double, Double;
    String => String, String;
    Vec<u8> => Bytes, Bytes;
    Uuid => Uuid, Uuid;
    NaiveDate => Date, Date;
    NaiveTime => Time, Time;
    NaiveDateTime => Timestamp, Timestamp;
    DateTime<Utc> => TimestampTz, TimestampTz;
    JsonValue => Json, Json;
    Decimal => Decimal, Decimal;
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::BigInt(i64::from(value))
    }
}

impl FromValue for u32 {
    fn from_value(value: SqlValue) -> Result<Self> {
        let wide = i64::from_value(value)?;
        u32::try_from(wide).map_err(|_| {
            TableGraphError::Conversion(format!("{} does not fit an unsigned 32-bit integer", wide))
        })
    }
}

// Large unsigned integers are stored as BIGINT; values above i64::MAX are rejected.
impl TryFrom<u64> for SqlValue {
    type Error = TableGraphError;

    fn try_from(value: u64) -> Result<Self> {
        i64::try_from(value).map(SqlValue::BigInt).map_err(|_| {
            TableGraphError::Conversion(format!("{} does not fit a BIGINT column", value))
        })
    }
}

impl FromValue for u64 {
    fn from_value(value: SqlValue) -> Result<Self> {
        let wide = i64::from_value(value)?;
        u64::try_from(wide).map_err(|_| {
            TableGraphError::Conversion(format!("{} does not fit an unsigned 64-bit integer", wide))
        })
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: SqlValue) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl FromValue for SqlValue {
    fn from_value(value: SqlValue) -> Result<Self> {
        Ok(value)
    }
}

impl IdValue for i16 {
    const FIELD_TYPE: FieldType = FieldType::SmallInt;
}

impl IdValue for i32 {
    const FIELD_TYPE: FieldType = FieldType::Int;
}

impl IdValue for i64 {
    const FIELD_TYPE: FieldType = FieldType::BigInt;
}

impl IdValue for String {
    const FIELD_TYPE: FieldType = FieldType::String;
}

impl IdValue for Uuid {
    const FIELD_TYPE: FieldType = FieldType::Uuid;
}
