//! PostgreSQL-backed document fetcher.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use postgres_native_tls::MakeTlsConnector;

use super::pool::{ConnectionPool, PoolLimits, build_pool};
use super::{Fetch, FetchError};

/// Reads the document text out of its large object.
pub const CONTENT_QUERY: &str = "select convert_from(lo_get(component_directory.directory_content), 'UTF-8') from component_directory";

/// Upper bound for establishing a single connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS policy for database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Plain TCP.
    Disable,
    /// Encrypted, server certificate not verified (libpq `require`).
    #[default]
    Require,
    /// Encrypted, certificate chain and host name verified.
    VerifyFull,
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(format!(
                "unknown sslmode {other:?} (expected disable, require or verify-full)"
            )),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyFull => "verify-full",
        })
    }
}

/// Connection parameters of the component directory database.
#[derive(Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: SslMode,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl DbConfig {
    /// Connection URL without the password, for logging.
    pub fn redacted_url(&self) -> String {
        format!(
            "postgresql://{}@{}:{}/{}?sslmode={}",
            self.user, self.host, self.port, self.name, self.ssl_mode
        )
    }

    pub fn pg_config(&self) -> postgres::Config {
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.name)
            .user(&self.user)
            .application_name("ecp-metrics")
            .connect_timeout(CONNECT_TIMEOUT)
            .ssl_mode(match self.ssl_mode {
                SslMode::Disable => postgres::config::SslMode::Disable,
                SslMode::Require | SslMode::VerifyFull => postgres::config::SslMode::Require,
            });
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }

    pub fn tls_connector(&self) -> Result<MakeTlsConnector, FetchError> {
        let mut builder = native_tls::TlsConnector::builder();
        if self.ssl_mode != SslMode::VerifyFull {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let connector = builder
            .build()
            .map_err(|e| FetchError::Tls(e.to_string()))?;
        Ok(MakeTlsConnector::new(connector))
    }

    /// Builds a connection pool for this database. Connections are opened in
    /// the background, so an unreachable database is not an error here.
    pub fn pool(&self, limits: PoolLimits) -> Result<ConnectionPool, FetchError> {
        Ok(build_pool(self.pg_config(), self.tls_connector()?, limits))
    }
}

/// Fetches the current document with [`CONTENT_QUERY`].
pub struct PgFetcher {
    pool: ConnectionPool,
}

impl PgFetcher {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }
}

impl Fetch for PgFetcher {
    fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let mut client = self
            .pool
            .get()
            .map_err(|e| FetchError::Connection(e.to_string()))?;
        let rows = client
            .query(CONTENT_QUERY, &[])
            .map_err(|e| FetchError::Query(format_postgres_error(&e)))?;
        // More than one row is not expected; the first one wins.
        let row = rows.first().ok_or(FetchError::NoRows)?;
        let content: String = row
            .try_get(0)
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        Ok(content.into_bytes())
    }
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
