//! The active-generation pointer.
//!
//! Readers take an `Arc` snapshot and keep it for the whole request; a swap
//! never waits for them and the old generation is dropped with its last
//! reader.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::info;

use crate::error::{LeannError, Result};
use crate::index::IndexGeneration;

/// Shared, cloneable handle to the active [`IndexGeneration`].
#[derive(Clone, Default)]
pub struct IndexHandle {
    inner: Arc<ArcSwapOption<IndexGeneration>>,
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("version", &self.version())
            .finish()
    }
}

impl IndexHandle {
    /// Handle with no active generation.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(generation: IndexGeneration) -> Self {
        let handle = Self::default();
        handle.install(generation);
        handle
    }

    /// Current generation, if any.
    pub fn snapshot(&self) -> Option<Arc<IndexGeneration>> {
        self.inner.load_full()
    }

    /// Current generation, or [`LeannError::EmptyIndex`].
    pub fn require(&self) -> Result<Arc<IndexGeneration>> {
        self.snapshot().ok_or(LeannError::EmptyIndex)
    }

    /// Atomically make `generation` active. Returns the previous one.
    pub fn install(&self, generation: IndexGeneration) -> Option<Arc<IndexGeneration>> {
        self.swap(Arc::new(generation))
    }

    pub fn swap(&self, generation: Arc<IndexGeneration>) -> Option<Arc<IndexGeneration>> {
        let version = generation.version();
        let previous = self.inner.swap(Some(generation));
        info!(
            version,
            previous = previous.as_ref().map(|g| g.version()),
            "active generation swapped"
        );
        previous
    }

    pub fn version(&self) -> Option<u64> {
        self.inner.load().as_ref().map(|g| g.version())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_none()
    }
}
