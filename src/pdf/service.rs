//! Render pipeline - owns the cache layers and the worker pool

use std::collections::HashMap;
#[cfg(any(test, feature = "test-utils"))]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use flume::{Receiver, Sender};
use url::Url;

use super::DEFAULT_WORKERS;
use super::backend::{Decoder, Fetcher};
use super::cache::CacheStats;
use super::color::BackgroundKey;
use super::invalidation::{EvictionStats, InvalidationBus};
use super::keys::{ImageKey, KeyResolver, PageIndex, SourceKey};
use super::request::{RenderEvent, RenderFault, RenderRequest};
use super::types::{CurrentValue, RenderedImage};
use super::worker::{HandleState, Job, Layers, render_worker};
use super::zoom::ZoomLevel;

/// Pipeline construction options
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Render worker threads
    pub workers: usize,
    /// Origin sources are resolved against; same-origin sources get the
    /// freshness token
    pub origin: Url,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            origin: default_origin(),
        }
    }
}

/// `file://` URL of the working directory
#[must_use]
pub fn default_origin() -> Url {
    std::env::current_dir()
        .ok()
        .and_then(|dir| Url::from_directory_path(dir).ok())
        .unwrap_or_else(|| Url::parse("file:///").expect("file:/// is a valid URL"))
}

/// Turns render requests into images through the document, page and image
/// caches, doing missing work on a pool of worker threads
pub struct RenderPipeline {
    resolver: KeyResolver,
    layers: Arc<Layers>,
    bus: InvalidationBus,
    job_tx: Sender<Job>,
    event_rx: Receiver<RenderEvent>,
    /// Last image served per logical source, shown while the next renders
    previous: Mutex<HashMap<Arc<str>, Arc<RenderedImage>>>,
    /// Most recent request and its key; hosts repeat the same request on
    /// every property change
    last_key: Mutex<Option<(RenderRequest, ImageKey)>>,
    #[cfg(any(test, feature = "test-utils"))]
    derivations: AtomicUsize,
    workers: Vec<JoinHandle<()>>,
}

impl RenderPipeline {
    /// Create a pipeline with default configuration
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, decoder: Arc<dyn Decoder>) -> Self {
        Self::with_config(fetcher, decoder, PipelineConfig::default())
    }

    #[must_use]
    pub fn with_config(
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn Decoder>,
        config: PipelineConfig,
    ) -> Self {
        // Workers pull from one shared queue, so the receiver must be
        // cloneable (MPMC).
        let (job_tx, job_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();

        let layers = Arc::new(Layers::new(fetcher, decoder, job_tx.clone(), event_tx));

        let workers = (0..config.workers.max(1))
            .map(|_| {
                let layers = Arc::clone(&layers);
                let rx = job_rx.clone();
                std::thread::spawn(move || render_worker(layers, rx))
            })
            .collect();

        log::info!(
            "Render pipeline started: {} workers, origin {}",
            config.workers.max(1),
            config.origin
        );

        Self {
            resolver: KeyResolver::new(config.origin),
            bus: InvalidationBus::new(Arc::clone(&layers)),
            layers,
            job_tx,
            event_rx,
            previous: Mutex::new(HashMap::new()),
            last_key: Mutex::new(None),
            #[cfg(any(test, feature = "test-utils"))]
            derivations: AtomicUsize::new(0),
            workers,
        }
    }

    #[must_use]
    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    #[must_use]
    pub fn source_key(&self, source: &str, freshness: Option<&str>) -> SourceKey {
        self.resolver.resolve(source, freshness)
    }

    /// Canonical image key for a request
    ///
    /// Repeating the previous request reuses its key without resolving the
    /// source or parsing the background again.
    #[must_use]
    pub fn image_key(&self, request: &RenderRequest) -> ImageKey {
        if let Some(key) = self.memoized_key(request) {
            return key;
        }

        let key = self.derive_key(request);
        *self.last_key.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((request.clone(), key.clone()));
        key
    }

    /// How many times a key was derived from scratch
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn key_derivations(&self) -> usize {
        self.derivations.load(Ordering::SeqCst)
    }

    fn memoized_key(&self, request: &RenderRequest) -> Option<ImageKey> {
        match self
            .last_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some((seen, key)) if seen == request => Some(key.clone()),
            _ => None,
        }
    }

    fn derive_key(&self, request: &RenderRequest) -> ImageKey {
        #[cfg(any(test, feature = "test-utils"))]
        self.derivations.fetch_add(1, Ordering::SeqCst);

        ImageKey {
            source: self.source_key(&request.source, request.freshness.as_deref()),
            page: PageIndex::floor(request.page_number),
            zoom: ZoomLevel::new(request.zoom),
            background: BackgroundKey::normalize(&request.background),
        }
    }

    /// Current value for a request; never blocks
    ///
    /// A cache hit returns the image itself. Otherwise the render is queued
    /// (or joined, if already queued) and a placeholder comes back carrying
    /// the last image shown for the same source.
    pub fn request_image(&self, request: &RenderRequest) -> CurrentValue {
        let key = self.image_key(request);
        match self.layers.get_or_begin_image(&key) {
            HandleState::Ready(image) => {
                self.remember(&key, &image);
                CurrentValue::Ready(image)
            }
            HandleState::Pending(ticket) | HandleState::Absent(ticket) => CurrentValue::Placeholder {
                previous: self.previous_for(&key),
                ticket,
            },
        }
    }

    /// Render and wait for the result
    pub fn render_blocking(&self, request: &RenderRequest) -> Result<Arc<RenderedImage>, RenderFault> {
        let key = self.image_key(request);
        let image = self.layers.resolve_image(&key)?;
        self.remember(&key, &image);
        Ok(image)
    }

    /// Page count of the document, or 1 while it is still loading
    pub fn page_count(&self, source: &str, freshness: Option<&str>) -> usize {
        let key = self.source_key(source, freshness);
        match self.layers.get_or_begin_document(&key) {
            HandleState::Ready(document) => document.page_count(),
            HandleState::Pending(_) | HandleState::Absent(_) => 1,
        }
    }

    /// Load the document if needed and return its page count
    pub fn load_page_count(&self, source: &str, freshness: Option<&str>) -> Result<usize, RenderFault> {
        let key = self.source_key(source, freshness);
        Ok(self.layers.resolve_document(&key)?.page_count())
    }

    /// Evict everything derived from a logical source id
    pub fn invalidate(&self, source: &str) -> EvictionStats {
        self.bus.invalidate(source)
    }

    #[must_use]
    pub fn bus(&self) -> InvalidationBus {
        self.bus.clone()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.layers.stats()
    }

    /// Full reset of all three layers
    pub fn clear(&self) {
        self.layers.clear();
        self.previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        log::info!("All caches cleared");
    }

    /// Drain completion events published since the last call
    pub fn poll_events(&self) -> Vec<RenderEvent> {
        self.event_rx.try_iter().collect()
    }

    /// Receiver for completion events, for hosts that block on them
    #[must_use]
    pub fn events(&self) -> Receiver<RenderEvent> {
        self.event_rx.clone()
    }

    fn remember(&self, key: &ImageKey, image: &Arc<RenderedImage>) {
        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        let logical = key.source.logical_shared();
        let unchanged = previous
            .get(logical)
            .is_some_and(|shown| Arc::ptr_eq(shown, image));
        if !unchanged {
            previous.insert(Arc::clone(logical), Arc::clone(image));
        }
    }

    fn previous_for(&self, key: &ImageKey) -> Option<Arc<RenderedImage>> {
        self.previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.source.logical())
            .cloned()
    }

    /// Stop the workers once the jobs already queued are done
    fn shutdown(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.job_tx.send(Job::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("Render worker panicked");
            }
        }
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
