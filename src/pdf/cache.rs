//! Document, page and image caches
//!
//! All three layers are unbounded and live for the life of the process.
//! Entries leave only through [`LayerCache::evict_source`] or a full
//! [`LayerCache::clear`].

use std::fmt::Display;
use std::hash::Hash;

use log::info;

use super::backend::{Document, Page};
use super::flight::{Begin, FlightMap, FlightResult, SlotState, Ticket};
use super::keys::{ImageKey, PageKey, SourceKey};
use super::types::RenderedImage;

/// Keys nested under a source
pub trait SourceScoped {
    fn source_key(&self) -> &SourceKey;
}

impl SourceScoped for SourceKey {
    fn source_key(&self) -> &SourceKey {
        self
    }
}

impl SourceScoped for PageKey {
    fn source_key(&self) -> &SourceKey {
        &self.source
    }
}

impl SourceScoped for ImageKey {
    fn source_key(&self) -> &SourceKey {
        &self.source
    }
}

/// One cache layer: a named single-flight map over source-scoped keys
pub struct LayerCache<K, V: ?Sized> {
    name: &'static str,
    slots: FlightMap<K, V>,
}

/// Decoded documents by source key
pub type DocumentCache = LayerCache<SourceKey, dyn Document>;

/// Decoded pages by (source, page)
pub type PageCache = LayerCache<PageKey, dyn Page>;

/// Rasters by (source, page, zoom, background)
pub type ImageCache = LayerCache<ImageKey, RenderedImage>;

impl DocumentCache {
    #[must_use]
    pub fn new() -> Self {
        Self::named("documents")
    }
}

impl PageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::named("pages")
    }
}

impl ImageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::named("images")
    }
}

impl<K, V> LayerCache<K, V>
where
    K: SourceScoped + Eq + Hash + Clone + Display,
    V: ?Sized,
{
    fn named(name: &'static str) -> Self {
        Self {
            name,
            slots: FlightMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cached value without touching the slot
    #[must_use]
    pub fn get(&self, key: &K) -> Option<std::sync::Arc<V>> {
        self.slots.get(key)
    }

    #[must_use]
    pub fn state(&self, key: &K) -> SlotState<V> {
        self.slots.state(key)
    }

    /// Look up `key` and mark it pending when absent
    pub fn begin(&self, key: &K) -> Begin<V> {
        self.slots.begin(key)
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn begin_detached(&self) -> Ticket<V> {
        self.slots.begin_detached()
    }

    pub fn complete(&self, key: &K, ticket: &Ticket<V>, outcome: FlightResult<V>) -> FlightResult<V> {
        self.slots.complete(key, ticket, outcome)
    }

    /// Blocking get-or-load with single-flight
    pub fn resolve<F>(&self, key: &K, load: F) -> FlightResult<V>
    where
        F: FnOnce() -> FlightResult<V>,
    {
        self.slots.resolve(key, load)
    }

    /// Run a queued load unless another thread already claimed it
    pub fn execute<F>(&self, key: &K, ticket: &Ticket<V>, load: F) -> Option<FlightResult<V>>
    where
        F: FnOnce() -> FlightResult<V>,
    {
        self.slots.execute(key, ticket, load)
    }

    /// Drop every entry derived from the logical source id, across all
    /// freshness variants
    pub fn evict_source(&self, logical: &str) -> usize {
        let removed = self
            .slots
            .evict_where(|key| key.source_key().logical() == logical);
        if removed > 0 {
            info!("Evicted {removed} {} for {logical}", self.name);
        }
        removed
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Ready entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// In-flight loads
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.pending()
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of cache occupancy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub documents: usize,
    pub pages: usize,
    pub images: usize,
    /// Loads in flight across all layers
    pub pending: usize,
}
