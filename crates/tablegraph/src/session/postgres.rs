//! PostgreSQL session over a pooled sqlx connection.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Column, Postgres, Row, TypeInfo};
use std::sync::Arc;
use tracing::{trace, warn};
use uuid::Uuid;

use super::{placeholder_positions, Backend, SqlRow, SqlSession, TxState};
use crate::value::SqlValue;
use crate::{Result, TableGraphError};

/// A PostgreSQL connection checked out of a [`ConnectionPool`](crate::ConnectionPool).
///
/// A session dropped while a transaction is open closes its connection
/// instead of returning it to the pool.
pub struct PgSession {
    conn: PoolConnection<Postgres>,
    state: TxState,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("auto_commit", &self.state.auto_commit)
            .field("in_transaction", &self.state.open)
            .finish()
    }
}

impl PgSession {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self {
            conn,
            state: TxState::new(),
        }
    }

    async fn run_control(&mut self, sql: &str) -> Result<()> {
        trace!(sql = sql, "Transaction control");
        sqlx::query(sql).execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn ensure_transaction(&mut self) -> Result<()> {
        if self.state.needs_begin() {
            self.run_control("BEGIN").await?;
            self.state.open = true;
        }
        Ok(())
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.state.open {
            warn!("PgSession dropped inside an open transaction, closing connection");
            self.conn.close_on_drop();
        }
    }
}

/// Rewrites `?` placeholders to `$n` and binds the non-NULL parameters.
///
/// NULL parameters are written into the statement as `NULL` so that the
/// server never has to infer a type for an untyped NULL bind.
pub(crate) fn prepare(sql: &str, params: &[SqlValue]) -> Result<(String, PgArguments)> {
    let positions = placeholder_positions(sql);
    if positions.len() != params.len() {
        return Err(TableGraphError::Query(format!(
            "statement has {} placeholders but {} parameters were bound",
            positions.len(),
            params.len()
        )));
    }

    let mut rewritten = String::with_capacity(sql.len() + positions.len() * 2);
    let mut arguments = PgArguments::default();
    let mut last = 0;
    let mut ordinal = 0;
    for (position, value) in positions.into_iter().zip(params) {
        rewritten.push_str(&sql[last..position]);
        last = position + 1;
        if value.is_null() {
            rewritten.push_str("NULL");
        } else {
            ordinal += 1;
            rewritten.push('$');
            rewritten.push_str(&ordinal.to_string());
            bind_value(value, &mut arguments)?;
        }
    }
    rewritten.push_str(&sql[last..]);
    Ok((rewritten, arguments))
}

fn bind_error(kind: &str, err: impl std::fmt::Display) -> TableGraphError {
    TableGraphError::Query(format!("Failed to bind {}: {}", kind, err))
}

fn bind_value(value: &SqlValue, arguments: &mut PgArguments) -> Result<()> {
    match value {
        SqlValue::Null => arguments.add(Option::<i32>::None).map_err(|e| bind_error("NULL", e)),
        SqlValue::Bool(v) => arguments.add(*v).map_err(|e| bind_error("BOOLEAN", e)),
        SqlValue::SmallInt(v) => arguments.add(*v).map_err(|e| bind_error("SMALLINT", e)),
        SqlValue::Int(v) => arguments.add(*v).map_err(|e| bind_error("INTEGER", e)),
        SqlValue::BigInt(v) => arguments.add(*v).map_err(|e| bind_error("BIGINT", e)),
        SqlValue::Float(v) => arguments.add(*v).map_err(|e| bind_error("REAL", e)),
        SqlValue::Double(v) => arguments.add(*v).map_err(|e| bind_error("DOUBLE", e)),
        SqlValue::String(v) => arguments.add(v.clone()).map_err(|e| bind_error("TEXT", e)),
        SqlValue::Bytes(v) => arguments.add(v.clone()).map_err(|e| bind_error("BYTEA", e)),
        SqlValue::Uuid(v) => arguments.add(*v).map_err(|e| bind_error("UUID", e)),
        SqlValue::Date(v) => arguments.add(*v).map_err(|e| bind_error("DATE", e)),
        SqlValue::Time(v) => arguments.add(*v).map_err(|e| bind_error("TIME", e)),
        SqlValue::Timestamp(v) => arguments.add(*v).map_err(|e| bind_error("TIMESTAMP", e)),
        SqlValue::TimestampTz(v) => arguments.add(*v).map_err(|e| bind_error("TIMESTAMPTZ", e)),
        SqlValue::Json(v) => arguments.add(v.clone()).map_err(|e| bind_error("JSONB", e)),
        SqlValue::Decimal(v) => arguments.add(*v).map_err(|e| bind_error("NUMERIC", e)),
    }
}

fn decode<'r, T>(row: &'r PgRow, index: usize, wrap: impl FnOnce(T) -> SqlValue) -> Result<SqlValue>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    match row.try_get::<Option<T>, _>(index) {
        Ok(Some(v)) => Ok(wrap(v)),
        Ok(None) => Ok(SqlValue::Null),
        Err(e) => Err(TableGraphError::Deserialization(format!(
            "Failed to decode column {}: {}",
            index, e
        ))),
    }
}

/// Decodes one row positionally by the server-reported column type.
pub(crate) fn decode_row(row: &PgRow, columns: &Arc<Vec<String>>) -> Result<SqlRow> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => decode::<bool>(row, index, SqlValue::Bool)?,
            "INT2" => decode::<i16>(row, index, SqlValue::SmallInt)?,
            "INT4" => decode::<i32>(row, index, SqlValue::Int)?,
            "INT8" => decode::<i64>(row, index, SqlValue::BigInt)?,
            "FLOAT4" => decode::<f32>(row, index, SqlValue::Float)?,
            "FLOAT8" => decode::<f64>(row, index, SqlValue::Double)?,
            "NUMERIC" => decode::<Decimal>(row, index, SqlValue::Decimal)?,
            "VARCHAR" | "TEXT" | "CHAR" | "BPCHAR" | "NAME" => {
                decode::<String>(row, index, SqlValue::String)?
            }
            "BYTEA" => decode::<Vec<u8>>(row, index, SqlValue::Bytes)?,
            "UUID" => decode::<Uuid>(row, index, SqlValue::Uuid)?,
            "DATE" => decode::<NaiveDate>(row, index, SqlValue::Date)?,
            "TIME" => decode::<NaiveTime>(row, index, SqlValue::Time)?,
            "TIMESTAMP" => decode::<NaiveDateTime>(row, index, SqlValue::Timestamp)?,
            "TIMESTAMPTZ" => decode::<DateTime<Utc>>(row, index, SqlValue::TimestampTz)?,
            "JSON" | "JSONB" => decode::<JsonValue>(row, index, SqlValue::Json)?,
            unknown => {
                warn!(
                    column = column.name(),
                    pg_type = unknown,
                    "Unknown PostgreSQL type, decoding as text"
                );
                decode::<String>(row, index, SqlValue::String)?
            }
        };
        values.push(value);
    }
    Ok(SqlRow::new(Arc::clone(columns), values))
}

#[async_trait]
impl SqlSession for PgSession {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.ensure_transaction().await?;
        let (sql, arguments) = prepare(sql, params)?;
        let result = sqlx::query_with(&sql, arguments)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.ensure_transaction().await?;
        let (sql, arguments) = prepare(sql, params)?;
        let rows = sqlx::query_with(&sql, arguments)
            .fetch_all(&mut *self.conn)
            .await?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<Vec<String>> =
            Arc::new(first.columns().iter().map(|c| c.name().to_string()).collect());
        rows.iter().map(|row| decode_row(row, &columns)).collect()
    }

    fn auto_commit(&self) -> bool {
        self.state.auto_commit
    }

    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        if auto_commit && self.state.open {
            self.run_control("COMMIT").await?;
            self.state.open = false;
        }
        self.state.auto_commit = auto_commit;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.state.open {
            self.state.open = false;
            self.run_control("COMMIT").await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.state.open {
            self.state.open = false;
            self.run_control("ROLLBACK").await?;
        }
        Ok(())
    }
}
