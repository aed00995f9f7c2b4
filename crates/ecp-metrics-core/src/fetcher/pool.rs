//! PostgreSQL connection pool.
//!
//! The pool is an `r2d2` pool over the blocking `postgres` client. The poll
//! loop issues at most one query at a time, so the limits stay tiny.

use std::time::Duration;

use postgres_native_tls::MakeTlsConnector;
use r2d2_postgres::PostgresConnectionManager;
use tracing::warn;

use super::pg::format_postgres_error;

/// Pool of connections to the component directory database.
pub type ConnectionPool = r2d2::Pool<PostgresConnectionManager<MakeTlsConnector>>;

/// Connection limits of a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum number of connections open at the same time.
    pub max_open: u32,
    /// Idle connections kept warm; extra idle ones are reaped after a while.
    pub idle: u32,
    /// How long a checkout waits for a free or new connection.
    pub checkout_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_open: 5,
            idle: 3,
            checkout_timeout: Duration::from_secs(10),
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_open: u32,
    pub open: u32,
    pub in_use: u32,
    pub idle: u32,
}

impl PoolStats {
    pub fn of(pool: &ConnectionPool) -> Self {
        let state = pool.state();
        Self {
            max_open: pool.max_size(),
            open: state.connections,
            in_use: state.connections - state.idle_connections,
            idle: state.idle_connections,
        }
    }
}

/// Routes connection errors raised by the pool's background threads into
/// the tracing subscriber.
#[derive(Debug)]
struct LogConnectErrors;

impl r2d2::HandleError<postgres::Error> for LogConnectErrors {
    fn handle_error(&self, error: postgres::Error) {
        warn!(error = %format_postgres_error(&error), "database connection attempt failed");
    }
}

/// Builds a pool. No connection is awaited here; `limits.idle` connections
/// are opened in the background.
pub(crate) fn build_pool(
    config: postgres::Config,
    tls: MakeTlsConnector,
    limits: PoolLimits,
) -> ConnectionPool {
    r2d2::Pool::builder()
        .max_size(limits.max_open)
        .min_idle(Some(limits.idle.min(limits.max_open)))
        .connection_timeout(limits.checkout_timeout)
        .error_handler(Box::new(LogConnectErrors))
        .build_unchecked(PostgresConnectionManager::new(config, tls))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(limits: PoolLimits) -> ConnectionPool {
        let mut config = postgres::Config::new();
        config
            .host("127.0.0.1")
            .port(1)
            .user("nobody")
            .dbname("nothing")
            .connect_timeout(Duration::from_secs(2));
        let tls = native_tls::TlsConnector::new().unwrap();
        build_pool(config, MakeTlsConnector::new(tls), limits)
    }

    fn lazy() -> PoolLimits {
        PoolLimits {
            idle: 0,
            checkout_timeout: Duration::from_millis(300),
            ..PoolLimits::default()
        }
    }

    #[test]
    fn new_pool_reports_limits_and_no_connections() {
        let pool = pool(lazy());
        assert_eq!(
            PoolStats::of(&pool),
            PoolStats {
                max_open: 5,
                open: 0,
                in_use: 0,
                idle: 0,
            }
        );
    }

    #[test]
    fn checkout_from_unreachable_database_times_out() {
        let pool = pool(lazy());
        assert!(pool.get().is_err());
        // Failed attempts never count as open connections.
        assert_eq!(PoolStats::of(&pool).open, 0);
    }

    #[test]
    fn idle_target_never_exceeds_max_open() {
        let pool = pool(PoolLimits {
            max_open: 2,
            idle: 3,
            checkout_timeout: Duration::from_millis(300),
        });
        assert_eq!(pool.max_size(), 2);
        assert_eq!(pool.min_idle(), Some(2));
    }
}
