//! SQL sessions.
//!
//! A session is one database connection with classic driver semantics:
//! statements run in auto-commit mode until auto-commit is switched off,
//! after which the first statement lazily opens a transaction that lasts
//! until [`SqlSession::commit`] or [`SqlSession::rollback`].
//!
//! Statements use `?` positional placeholders on every backend. The JSONB
//! `?|` and `?&` operators are recognized and left alone; the bare `?` key
//! operator is indistinguishable from a placeholder, so write
//! `jsonb_exists(column, key)` instead.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::value::SqlValue;
use crate::Result;

pub mod postgres;
pub mod sqlite;

pub use postgres::PgSession;
pub use sqlite::SqliteSession;

/// Database flavor behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

/// One decoded result row.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Value of the first column labelled `name` (case-insensitive).
    pub fn get_by_name(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|index| self.values.get(index))
    }

    /// Column label to value; later duplicates of a label win.
    pub fn into_map(self) -> BTreeMap<String, SqlValue> {
        self.columns.iter().cloned().zip(self.values).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A single database connection driven by the engine.
#[async_trait]
pub trait SqlSession: Send {
    fn backend(&self) -> Backend;

    /// Runs a statement and returns the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Runs an INSERT and returns the first generated key column.
    ///
    /// Returns NULL when the statement produced no row.
    async fn insert_returning(
        &mut self,
        sql: &str,
        key_columns: &[&str],
        params: &[SqlValue],
    ) -> Result<SqlValue> {
        let sql = format!("{} RETURNING {}", sql, key_columns.join(", "));
        let rows = self.fetch_all(&sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_values().into_iter().next())
            .unwrap_or(SqlValue::Null))
    }

    fn auto_commit(&self) -> bool;

    /// Switching auto-commit back on commits an open transaction.
    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Auto-commit bookkeeping shared by the session implementations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxState {
    pub(crate) auto_commit: bool,
    pub(crate) open: bool,
}

impl TxState {
    pub(crate) fn new() -> Self {
        Self {
            auto_commit: true,
            open: false,
        }
    }

    /// True when a BEGIN must precede the next statement.
    pub(crate) fn needs_begin(&self) -> bool {
        !self.auto_commit && !self.open
    }
}

/// Index of every `?` placeholder outside quoted literals and identifiers.
pub(crate) fn placeholder_positions(sql: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    for (index, ch) in sql.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '?' if !in_single && !in_double && !is_operator_mark(sql, index) => {
                positions.push(index)
            }
            _ => {}
        }
    }
    positions
}

/// True when the `?` at byte `index` opens a `?|` or `?&` operator.
///
/// `?||` is a placeholder followed by string concatenation.
pub(crate) fn is_operator_mark(sql: &str, index: usize) -> bool {
    let rest = &sql.as_bytes()[index + 1..];
    match rest.first() {
        Some(b'&') => true,
        Some(b'|') => rest.get(1) != Some(&b'|'),
        _ => false,
    }
}
