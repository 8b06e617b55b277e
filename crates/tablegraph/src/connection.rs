//! PostgreSQL connection pooling.
//!
//! [`ConnectionPool`] owns a sqlx pool and hands out [`PgSession`]s, each
//! holding one checked-out connection for the length of a unit of work. The
//! first connection is established with exponential backoff so a pool can be
//! created while the database is still starting.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::session::PgSession;
use crate::{Result, TableGraphError};

/// Backoff schedule for establishing the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts after the first one; 0 fails on the first error.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Wait before retry number `attempt`, counting from 0.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(self.initial_delay, self.backoff_multiplier, self.max_delay, attempt)
    }
}

/// `initial * multiplier^attempt`, never above `max`.
pub(crate) fn backoff_delay(initial: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    let scaled_ms = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
    let max_ms = max.as_millis() as f64;
    if !scaled_ms.is_finite() || scaled_ms >= max_ms {
        return max;
    }
    Duration::from_millis(scaled_ms.max(0.0) as u64)
}

/// Sizing and lifetime settings of a [`ConnectionPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    /// How long [`ConnectionPool::session`] waits for a free connection.
    pub acquire_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    /// Prepared statements cached per connection; 0 disables the cache.
    pub statement_cache_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            statement_cache_capacity: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .min_connections(self.min_connections)
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .max_lifetime(self.max_lifetime)
            .idle_timeout(self.idle_timeout)
    }
}

/// Shared pool of PostgreSQL connections; cloning shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: PgPool,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl ConnectionPool {
    /// Opens the pool and verifies it with a round trip.
    ///
    /// # Errors
    ///
    /// `Connection` when the URI is empty or malformed; otherwise the
    /// classified driver error of the last failed attempt.
    #[instrument(skip(uri, config), fields(
        max_connections = config.max_connections,
        max_retries = config.retry.max_retries
    ))]
    pub async fn new(uri: &str, config: PoolConfig) -> Result<Self> {
        if uri.trim().is_empty() {
            return Err(TableGraphError::Connection("database URI is empty".to_string()));
        }
        let target = PgConnectOptions::from_str(uri)
            .map_err(|e| TableGraphError::Connection(format!("malformed database URI: {}", e)))?
            .statement_cache_capacity(config.statement_cache_capacity);

        let pool = Self {
            pool: establish(config.pool_options(), target, &config.retry).await?,
        };
        pool.ping().await?;
        info!(size = pool.pool.size(), "Connection pool ready");
        Ok(pool)
    }

    /// Opens a pool with [`PoolConfig::default`].
    pub async fn connect(uri: &str) -> Result<Self> {
        Self::new(uri, PoolConfig::default()).await
    }

    /// Checks out one connection as an auto-commit session.
    pub async fn session(&self) -> Result<PgSession> {
        Ok(PgSession::new(self.pool.acquire().await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Waits for checked-out sessions to return, then closes every connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Connection pool closed");
    }
}

async fn establish(options: PgPoolOptions, target: PgConnectOptions, retry: &RetryConfig) -> Result<PgPool> {
    let mut attempt = 0;
    loop {
        match options.clone().connect_with(target.clone()).await {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < retry.max_retries => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    of = retry.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Database unreachable, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };
        let delays: Vec<u128> = (0..6).map(|n| retry.delay_for_attempt(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_no_retry_never_waits() {
        let retry = RetryConfig::no_retry();
        assert_eq!(retry.max_retries, 0);
        assert_eq!(retry.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_pool_config_builders() {
        let config = PoolConfig::default()
            .min_connections(0)
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(2))
            .idle_timeout(None)
            .statement_cache_capacity(0)
            .retry(RetryConfig::no_retry());
        assert_eq!(config.min_connections, 0);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.max_lifetime, PoolConfig::default().max_lifetime);
        assert_eq!(config.statement_cache_capacity, 0);
        assert_eq!(config.retry, RetryConfig::no_retry());
    }

    #[tokio::test]
    async fn test_empty_uri_rejected() {
        let err = ConnectionPool::new("  ", PoolConfig::default()).await.unwrap_err();
        assert!(matches!(err, TableGraphError::Connection(msg) if msg.contains("empty")));
    }

    #[tokio::test]
    async fn test_malformed_uri_rejected() {
        let config = PoolConfig::default().retry(RetryConfig::no_retry());
        let err = ConnectionPool::new("not a uri", config).await.unwrap_err();
        assert!(matches!(err, TableGraphError::Connection(_)));
    }
}
