//! Snapshot store shared between the poll loop and request handlers.
//!
//! The store holds an `Arc<Document>`. Publishing swaps the `Arc` under a
//! short write lock; readers clone the `Arc` under a read lock and then work
//! on their own reference, so a reader never sees fields of two documents and
//! never holds the lock while rendering.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use tracing::debug;

use crate::model::Document;

/// Publish capability handed to the poll loop.
///
/// The poll loop only knows it can hand over a freshly parsed document; who
/// consumes it is up to the implementation.
pub trait DocumentSink: Send + Sync {
    fn publish(&self, document: Document);
}

/// The currently published document with its publish metadata.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub document: Arc<Document>,
    pub published_at: SystemTime,
    /// 1 for the first published document, incremented on every publish.
    pub generation: u64,
}

/// Latest successfully parsed document.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Option<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the held document and returns the new generation.
    pub fn replace(&self, document: Document) -> u64 {
        let components = document.component_count();
        let document = Arc::new(document);
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let generation = current.as_ref().map_or(0, |s| s.generation) + 1;
        // The previous snapshot is dropped after the lock is released.
        let previous = current.replace(Snapshot {
            document,
            published_at: SystemTime::now(),
            generation,
        });
        drop(current);
        match previous.and_then(|p| p.published_at.elapsed().ok()) {
            Some(age) => debug!(
                generation,
                components,
                previous_age_ms = age.as_millis() as u64,
                "published component directory"
            ),
            None => debug!(generation, components, "published component directory"),
        }
        generation
    }

    /// Returns the latest document, or `None` before the first publish.
    pub fn current(&self) -> Option<Arc<Document>> {
        self.snapshot().map(|s| s.document)
    }

    /// Returns the latest document together with its publish metadata.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DocumentSink for SnapshotStore {
    fn publish(&self, document: Document) {
        self.replace(document);
    }
}
