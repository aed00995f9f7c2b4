//! ecp-metrics-core: component directory polling pipeline.
//!
//! Provides:
//! - `model`: typed component directory document (brokers, endpoints, directories)
//! - `parser`: XML → `Document` conversion
//! - `fetcher`: document retrieval from PostgreSQL, bounded connection pool
//! - `snapshot`: concurrency-safe holder of the latest document
//! - `poll`: timer-driven fetch/parse/publish loop with error backoff

pub mod fetcher;
pub mod model;
pub mod parser;
pub mod poll;
pub mod snapshot;

pub use model::Document;
pub use snapshot::{DocumentSink, SnapshotStore};

/// Crate version, reported at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
