//! SQLite session over a single sqlx connection.
//!
//! SQLite has no native temporal, UUID, NUMERIC or JSON storage, so those
//! values bind as canonical text and come back as TEXT/INTEGER/REAL. The
//! coercion service turns them into field types on the way out.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Arguments, Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, trace};

use super::{placeholder_positions, Backend, SqlRow, SqlSession, TxState};
use crate::value::SqlValue;
use crate::{Result, TableGraphError};

/// A SQLite connection with foreign keys enforced.
pub struct SqliteSession {
    conn: SqliteConnection,
    state: TxState,
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession")
            .field("auto_commit", &self.state.auto_commit)
            .field("in_transaction", &self.state.open)
            .finish()
    }
}

impl SqliteSession {
    /// Opens a session from a `sqlite:` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| TableGraphError::Connection(format!("Invalid SQLite URL: {}", e)))?
            .foreign_keys(true);
        Self::connect_with(options).await
    }

    /// Opens a private in-memory database.
    pub async fn memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Opens (creating if needed) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        let conn = options.connect().await?;
        info!("Opened SQLite session");
        Ok(Self {
            conn,
            state: TxState::new(),
        })
    }

    /// Closes the connection, rolling back any open transaction.
    pub async fn close(mut self) -> Result<()> {
        self.rollback().await?;
        self.conn.close().await?;
        Ok(())
    }

    async fn run_control(&mut self, sql: &str) -> Result<()> {
        trace!(sql = sql, "Transaction control");
        sqlx::query(sql).execute(&mut self.conn).await?;
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

fn bind_error(kind: &str, err: impl std::fmt::Display) -> TableGraphError {
    TableGraphError::Query(format!("Failed to bind {}: {}", kind, err))
}

fn bind_value(value: &SqlValue, arguments: &mut SqliteArguments<'_>) -> Result<()> {
    match value {
        SqlValue::Null => arguments.add(Option::<i64>::None).map_err(|e| bind_error("NULL", e)),
        SqlValue::Bool(v) => arguments.add(*v).map_err(|e| bind_error("BOOLEAN", e)),
        SqlValue::SmallInt(v) => arguments.add(*v).map_err(|e| bind_error("SMALLINT", e)),
        SqlValue::Int(v) => arguments.add(*v).map_err(|e| bind_error("INTEGER", e)),
        SqlValue::BigInt(v) => arguments.add(*v).map_err(|e| bind_error("BIGINT", e)),
        SqlValue::Float(v) => arguments.add(*v).map_err(|e| bind_error("REAL", e)),
        SqlValue::Double(v) => arguments.add(*v).map_err(|e| bind_error("DOUBLE", e)),
        SqlValue::String(v) => arguments.add(v.clone()).map_err(|e| bind_error("TEXT", e)),
        SqlValue::Bytes(v) => arguments.add(v.clone()).map_err(|e| bind_error("BLOB", e)),
        other => arguments
            .add(other.to_string())
            .map_err(|e| bind_error(other.type_name(), e)),
    }
}

fn prepare<'q>(sql: &str, params: &[SqlValue]) -> Result<SqliteArguments<'q>> {
    let placeholders = placeholder_positions(sql).len();
    if placeholders != params.len() {
        return Err(TableGraphError::Query(format!(
            "statement has {} placeholders but {} parameters were bound",
            placeholders,
            params.len()
        )));
    }
    let mut arguments = SqliteArguments::default();
    for value in params {
        bind_value(value, &mut arguments)?;
    }
    Ok(arguments)
}

fn decode_error(index: usize, err: impl std::fmt::Display) -> TableGraphError {
    TableGraphError::Deserialization(format!("Failed to decode column {}: {}", index, err))
}

/// Decodes one row by the storage class of each value.
fn decode_row(row: &SqliteRow, columns: &Arc<Vec<String>>) -> Result<SqlRow> {
    let mut values = Vec::with_capacity(row.columns().len());
    for index in 0..row.columns().len() {
        let raw = row.try_get_raw(index).map_err(|e| decode_error(index, e))?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let storage = raw.type_info().name().to_string();
        let value = match storage.as_str() {
            "INTEGER" | "BOOLEAN" => row
                .try_get_unchecked::<i64, _>(index)
                .map(SqlValue::BigInt),
            "REAL" | "NUMERIC" => row
                .try_get_unchecked::<f64, _>(index)
                .map(SqlValue::Double),
            "BLOB" => row
                .try_get_unchecked::<Vec<u8>, _>(index)
                .map(SqlValue::Bytes),
            "NULL" => Ok(SqlValue::Null),
            _ => row
                .try_get_unchecked::<String, _>(index)
                .map(SqlValue::String),
        };
        values.push(value.map_err(|e| decode_error(index, e))?);
    }
    Ok(SqlRow::new(Arc::clone(columns), values))
}

#[async_trait]
impl SqlSession for SqliteSession {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.ensure_transaction().await?;
        let arguments = prepare(sql, params)?;
        let result = sqlx::query_with(sql, arguments)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.ensure_transaction().await?;
        let arguments = prepare(sql, params)?;
        let rows = sqlx::query_with(sql, arguments)
            .fetch_all(&mut self.conn)
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
