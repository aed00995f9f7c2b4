//! Retrieval of the raw component directory document.
//!
//! The component directory keeps its current document in PostgreSQL as a
//! large object referenced from the `component_directory` table. [`PgFetcher`]
//! reads it through a small `r2d2` [`ConnectionPool`]; anything implementing
//! [`Fetch`] can stand in for it.

mod pg;
mod pool;

pub use pg::{CONTENT_QUERY, DbConfig, PgFetcher, SslMode};
pub use pool::{ConnectionPool, PoolLimits, PoolStats};

/// Error type for document retrieval.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// TLS connector could not be built.
    #[error("failed setting up TLS: {0}")]
    Tls(String),
    /// No connection could be checked out of the pool in time.
    #[error("failed connecting to database: {0}")]
    Connection(String),
    /// Query execution failed.
    #[error("failed querying for content: {0}")]
    Query(String),
    /// The query succeeded but returned nothing.
    #[error("failed querying for content: no rows returned")]
    NoRows,
    /// The returned column could not be converted to text.
    #[error("failed scanning query result: {0}")]
    Decode(String),
}

/// Source of raw document bytes.
///
/// Implementations block; async callers run them on the blocking pool.
/// A call either returns the complete document or an error, and never retries.
pub trait Fetch: Send + Sync {
    fn fetch(&self) -> Result<Vec<u8>, FetchError>;
}
