//! Statement execution over a [`SqlSession`].
//!
//! This module provides:
//! - Named parameters (`:name`) rewritten to positional placeholders
//! - NULL-aware equality (`col = ?` bound to NULL becomes `col IS NULL`)
//! - Read retries on transient errors while outside a transaction
//! - Per-statement timeout, row cap and slow query logging
//! - Batches returning affected counts or generated keys
//! - Row mapping combinators in [`mappers`]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::connection::backoff_delay;
use crate::session::{is_operator_mark, SqlRow, SqlSession};
use crate::value::SqlValue;
use crate::{Result, TableGraphError};

/// Configuration for statement execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of retries for transient read failures
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Threshold for slow query logging in milliseconds
    pub slow_query_threshold_ms: u64,
    /// [`QueryExecutor::query`] truncates result sets to this many rows;
    /// repositories apply it to root entities instead of join rows
    pub max_rows: Option<usize>,
    /// Per-statement timeout
    pub query_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 50,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
            slow_query_threshold_ms: 1000,
            max_rows: None,
            query_timeout: None,
        }
    }
}

impl ExecutorConfig {
    /// Executor config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(
            Duration::from_millis(self.initial_delay_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.max_delay_ms),
            attempt,
        )
    }
}

fn preview(sql: &str) -> String {
    sql.chars().take(100).collect()
}

/// Stateless statement runner; the session is passed to every call.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    config: ExecutorConfig,
}

impl QueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs an INSERT/UPDATE/DELETE and returns the affected row count.
    #[instrument(skip(self, session, params), fields(sql_preview = %preview(sql)))]
    pub async fn execute(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64> {
        let start = Instant::now();
        let affected = self.timed(session.execute(sql, params)).await?;
        self.log_completion(sql, start.elapsed(), 0);
        debug!(rows_affected = affected, "Statement executed");
        Ok(affected)
    }

    pub async fn execute_named(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<u64> {
        let (sql, params) = parse_named_parameters(sql, params)?;
        self.execute(session, &sql, &params).await
    }

    /// Runs a SELECT and hands every row to `mapper`.
    ///
    /// Equality predicates bound to NULL are rewritten before execution and
    /// the result is cut to [`ExecutorConfig::max_rows`].
    #[instrument(skip(self, session, params, mapper), fields(sql_preview = %preview(sql)))]
    pub async fn query<T, F>(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: Vec<SqlValue>,
        mapper: F,
    ) -> Result<T>
    where
        F: FnOnce(Vec<SqlRow>) -> Result<T> + Send,
    {
        self.run_query(session, sql, params, self.config.max_rows, mapper)
            .await
    }

    /// Like [`query`](Self::query) but hands the mapper every row.
    ///
    /// For result sets whose rows are not independent results, such as the
    /// flattened rows of a join plan.
    #[instrument(skip(self, session, params, mapper), fields(sql_preview = %preview(sql)))]
    pub async fn query_uncapped<T, F>(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: Vec<SqlValue>,
        mapper: F,
    ) -> Result<T>
    where
        F: FnOnce(Vec<SqlRow>) -> Result<T> + Send,
    {
        self.run_query(session, sql, params, None, mapper).await
    }

    async fn run_query<T, F>(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: Vec<SqlValue>,
        max_rows: Option<usize>,
        mapper: F,
    ) -> Result<T>
    where
        F: FnOnce(Vec<SqlRow>) -> Result<T> + Send,
    {
        let (sql, params) = rewrite_null_predicates(sql, params);
        let mut attempt = 0;
        loop {
            let start = Instant::now();
            match self.timed(session.fetch_all(&sql, &params)).await {
                Ok(mut rows) => {
                    self.log_completion(&sql, start.elapsed(), attempt);
                    if let Some(max_rows) = max_rows {
                        rows.truncate(max_rows);
                    }
                    return mapper(rows);
                }
                Err(e) => {
                    // Inside a transaction the failed statement has already
                    // poisoned it; only auto-commit reads are retried.
                    let retryable = e.is_retryable() && session.auto_commit();
                    warn!(
                        sql = %sql.chars().take(50).collect::<String>(),
                        attempt = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        retryable = retryable,
                        error = %e,
                        "Query failed"
                    );
                    if retryable && attempt < self.config.max_retries {
                        let delay = self.config.delay_for_attempt(attempt);
                        debug!(delay_ms = delay.as_millis() as u64, "Retrying after delay");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn query_named<T, F>(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: &HashMap<String, SqlValue>,
        mapper: F,
    ) -> Result<T>
    where
        F: FnOnce(Vec<SqlRow>) -> Result<T> + Send,
    {
        let (sql, params) = parse_named_parameters(sql, params)?;
        self.query(session, &sql, params, mapper).await
    }

    /// Runs an INSERT and returns the first generated key column.
    #[instrument(skip(self, session, params), fields(sql_preview = %preview(sql)))]
    pub async fn insert_returning(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        key_columns: &[&str],
        params: &[SqlValue],
    ) -> Result<SqlValue> {
        let start = Instant::now();
        let key = self
            .timed(session.insert_returning(sql, key_columns, params))
            .await?;
        self.log_completion(sql, start.elapsed(), 0);
        Ok(key)
    }

    pub async fn insert_returning_named(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        key_columns: &[&str],
        params: &HashMap<String, SqlValue>,
    ) -> Result<SqlValue> {
        let (sql, params) = parse_named_parameters(sql, params)?;
        self.insert_returning(session, &sql, key_columns, &params).await
    }

    /// Runs one INSERT per parameter row and returns each generated key.
    ///
    /// Keys come back in row order; a row that produced no key yields NULL.
    #[instrument(skip(self, session, rows), fields(sql_preview = %preview(sql), rows = rows.len()))]
    pub async fn insert_batch(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        key_columns: &[&str],
        rows: &[Vec<SqlValue>],
    ) -> Result<Vec<SqlValue>> {
        let mut keys = Vec::with_capacity(rows.len());
        for params in rows {
            keys.push(self.insert_returning(session, sql, key_columns, params).await?);
        }
        debug!(keys = keys.len(), "Batch insert completed");
        Ok(keys)
    }

    /// Runs one statement per parameter row, in order.
    pub async fn batch(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        rows: &[Vec<SqlValue>],
    ) -> Result<Vec<u64>> {
        let mut counts = Vec::with_capacity(rows.len());
        for params in rows {
            counts.push(self.execute(session, sql, params).await?);
        }
        Ok(counts)
    }

    async fn timed<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match self.config.query_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                TableGraphError::Timeout(format!("statement exceeded {} ms", limit.as_millis()))
            })?,
            None => fut.await,
        }
    }

    fn log_completion(&self, sql: &str, elapsed: Duration, attempt: u32) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed_ms >= self.config.slow_query_threshold_ms {
            warn!(
                sql = %preview(sql),
                elapsed_ms = elapsed_ms,
                threshold_ms = self.config.slow_query_threshold_ms,
                attempt = attempt,
                "Slow query detected"
            );
        } else {
            debug!(
                sql = %preview(sql),
                elapsed_ms = elapsed_ms,
                attempt = attempt,
                "Query completed"
            );
        }
    }
}

/// Rewrites `:name` tokens outside quotes to `?`, in order of appearance.
///
/// `::` casts are left alone. A name missing from `params` is an error.
pub fn parse_named_parameters(
    sql: &str,
    params: &HashMap<String, SqlValue>,
) -> Result<(String, Vec<SqlValue>)> {
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(ch);
            }
            ':' if !in_single && !in_double => match chars.peek() {
                Some(':') => {
                    out.push_str("::");
                    chars.next();
                }
                Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let value = params.get(&name).ok_or_else(|| {
                        TableGraphError::Query(format!("no value bound for named parameter :{}", name))
                    })?;
                    values.push(value.clone());
                    out.push('?');
                }
                _ => out.push(ch),
            },
            _ => out.push(ch),
        }
    }
    Ok((out, values))
}

/// Rewrites `= ?` bound to NULL into `IS NULL` and drops that parameter.
///
/// Every `?` outside quotes consumes one parameter, except the first mark of
/// the JSONB `?|` and `?&` operators. Comparisons ending in
/// `=` (`<=`, `>=`, `!=`) are left untouched, as is every non-NULL binding.
pub fn rewrite_null_predicates(sql: &str, params: Vec<SqlValue>) -> (String, Vec<SqlValue>) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut kept = Vec::with_capacity(params.len());
    let mut params = params.into_iter();
    let mut in_single = false;
    let mut in_double = false;

    for (index, ch) in sql.char_indices() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(ch);
            }
            '?' if !in_single && !in_double && !is_operator_mark(sql, index) => match params.next() {
                Some(SqlValue::Null) if ends_with_equality(&out) => {
                    let trimmed = out.trim_end().len();
                    out.truncate(trimmed - 1);
                    let trimmed = out.trim_end().len();
                    out.truncate(trimmed);
                    out.push_str(" IS NULL ");
                }
                Some(value) => {
                    kept.push(value);
                    out.push(ch);
                }
                None => out.push(ch),
            },
            _ => out.push(ch),
        }
    }
    kept.extend(params);
    (out, kept)
}

fn ends_with_equality(sql: &str) -> bool {
    let trimmed = sql.trim_end();
    let mut tail = trimmed.chars().rev();
    match (tail.next(), tail.next()) {
        (Some('='), Some(prev)) => !matches!(prev, '<' | '>' | '!'),
        (Some('='), None) => true,
        _ => false,
    }
}

/// Row mapping combinators for [`QueryExecutor::query`].
pub mod mappers {
    use std::collections::BTreeMap;

    use crate::session::SqlRow;
    use crate::value::{FromValue, SqlValue};
    use crate::Result;

    /// First column of the first row.
    pub fn scalar<T: FromValue>() -> impl FnOnce(Vec<SqlRow>) -> Result<Option<T>> + Send {
        |rows| {
            rows.into_iter()
                .next()
                .and_then(|row| row.into_values().into_iter().next())
                .map(T::from_value)
                .transpose()
        }
    }

    /// Values of the first row.
    pub fn array() -> impl FnOnce(Vec<SqlRow>) -> Result<Option<Vec<SqlValue>>> + Send {
        |rows| Ok(rows.into_iter().next().map(SqlRow::into_values))
    }

    /// Column label to value for the first row.
    pub fn map() -> impl FnOnce(Vec<SqlRow>) -> Result<Option<BTreeMap<String, SqlValue>>> + Send {
        |rows| Ok(rows.into_iter().next().map(SqlRow::into_map))
    }

    /// First column of every row.
    pub fn scalar_list<T: FromValue>() -> impl FnOnce(Vec<SqlRow>) -> Result<Vec<T>> + Send {
        |rows| {
            rows.into_iter()
                .map(|row| {
                    let value = row.into_values().into_iter().next().unwrap_or(SqlValue::Null);
                    T::from_value(value)
                })
                .collect()
        }
    }

    pub fn array_list() -> impl FnOnce(Vec<SqlRow>) -> Result<Vec<Vec<SqlValue>>> + Send {
        |rows| Ok(rows.into_iter().map(SqlRow::into_values).collect())
    }

    pub fn map_list() -> impl FnOnce(Vec<SqlRow>) -> Result<Vec<BTreeMap<String, SqlValue>>> + Send {
        |rows| Ok(rows.into_iter().map(SqlRow::into_map).collect())
    }

    /// Applies `f` to every row.
    pub fn each<T, F>(f: F) -> impl FnOnce(Vec<SqlRow>) -> Result<Vec<T>> + Send
    where
        F: FnMut(SqlRow) -> Result<T> + Send,
    {
        move |rows| rows.into_iter().map(f).collect()
    }
}
