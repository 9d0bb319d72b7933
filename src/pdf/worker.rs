//! Layer loaders and the render worker loop

use std::sync::Arc;

use flume::{Receiver, Sender};

use super::backend::{Decoder, Document, Fetcher, Page, check_page_range};
use super::cache::{CacheStats, DocumentCache, ImageCache, PageCache};
use super::color::BackgroundKey;
use super::flight::{Begin, FlightResult, Ticket};
use super::invalidation::EvictionStats;
use super::keys::{ImageKey, PageKey, SourceKey};
use super::request::{RenderEvent, RenderFault};
use super::types::{MAX_SURFACE_DIMENSION, RenderedImage, Surface};
use super::zoom::ZoomLevel;

/// Result of a non-blocking layer lookup
pub enum HandleState<V: ?Sized> {
    Ready(Arc<V>),
    /// A load was already in flight
    Pending(Ticket<V>),
    /// Nothing was cached; this call queued the load
    Absent(Ticket<V>),
}

impl<V: ?Sized> HandleState<V> {
    #[must_use]
    pub fn ticket(&self) -> Option<&Ticket<V>> {
        match self {
            Self::Ready(_) => None,
            Self::Pending(ticket) | Self::Absent(ticket) => Some(ticket),
        }
    }
}

/// Work item for the pool
pub enum Job {
    Document {
        key: SourceKey,
        ticket: Ticket<dyn Document>,
    },
    Page {
        key: PageKey,
        ticket: Ticket<dyn Page>,
    },
    Image {
        key: ImageKey,
        ticket: Ticket<RenderedImage>,
    },
    Shutdown,
}

/// Pixel dimensions for rasterizing a page at a zoom
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RasterSpec {
    pub width: u32,
    pub height: u32,
}

impl RasterSpec {
    pub fn compute(page_size: (f32, f32), zoom: ZoomLevel) -> Result<Self, RenderFault> {
        let (page_width, page_height) = page_size;
        if !(page_width.is_finite() && page_height.is_finite())
            || page_width <= 0.0
            || page_height <= 0.0
        {
            return Err(RenderFault::render(format!(
                "page has no drawable area ({page_width}x{page_height})"
            )));
        }

        let scale = zoom.factor();
        let width = (f64::from(page_width) * scale).ceil().max(1.0);
        let height = (f64::from(page_height) * scale).ceil().max(1.0);
        let limit = f64::from(MAX_SURFACE_DIMENSION);
        if width > limit || height > limit {
            return Err(RenderFault::render(format!(
                "{width}x{height} at {zoom} exceeds {MAX_SURFACE_DIMENSION}px"
            )));
        }

        Ok(Self {
            width: width as u32,
            height: height as u32,
        })
    }
}

/// Rasterize a page: size, allocate, fill, draw, encode
pub fn rasterize(
    page: &dyn Page,
    zoom: ZoomLevel,
    background: &BackgroundKey,
) -> Result<RenderedImage, RenderFault> {
    let spec = RasterSpec::compute(page.natural_size(), zoom)?;
    let mut surface = Surface::allocate(spec.width, spec.height)?;
    surface.fill(background.color());
    page.render(&mut surface, zoom, background.color())?;
    RenderedImage::from_surface(surface)
}

/// The three cache layers plus the collaborators that fill them
pub struct Layers {
    pub documents: DocumentCache,
    pub pages: PageCache,
    pub images: ImageCache,
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn Decoder>,
    jobs: Sender<Job>,
    events: Sender<RenderEvent>,
}

impl Layers {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn Decoder>,
        jobs: Sender<Job>,
        events: Sender<RenderEvent>,
    ) -> Self {
        Self {
            documents: DocumentCache::new(),
            pages: PageCache::new(),
            images: ImageCache::new(),
            fetcher,
            decoder,
            jobs,
            events,
        }
    }

    pub fn get_or_begin_document(&self, key: &SourceKey) -> HandleState<dyn Document> {
        match self.documents.begin(key) {
            Begin::Ready(document) => HandleState::Ready(document),
            Begin::Joined(ticket) => HandleState::Pending(ticket),
            Begin::Started(ticket) => {
                self.dispatch(Job::Document {
                    key: key.clone(),
                    ticket: ticket.clone(),
                });
                HandleState::Absent(ticket)
            }
        }
    }

    pub fn get_or_begin_page(&self, key: &PageKey) -> HandleState<dyn Page> {
        match self.pages.begin(key) {
            Begin::Ready(page) => HandleState::Ready(page),
            Begin::Joined(ticket) => HandleState::Pending(ticket),
            Begin::Started(ticket) => {
                self.dispatch(Job::Page {
                    key: key.clone(),
                    ticket: ticket.clone(),
                });
                HandleState::Absent(ticket)
            }
        }
    }

    pub fn get_or_begin_image(&self, key: &ImageKey) -> HandleState<RenderedImage> {
        match self.images.begin(key) {
            Begin::Ready(image) => HandleState::Ready(image),
            Begin::Joined(ticket) => HandleState::Pending(ticket),
            Begin::Started(ticket) => {
                log::debug!("Image miss for {key}, queueing render");
                self.dispatch(Job::Image {
                    key: key.clone(),
                    ticket: ticket.clone(),
                });
                HandleState::Absent(ticket)
            }
        }
    }

    /// Blocking document lookup
    pub fn resolve_document(&self, key: &SourceKey) -> FlightResult<dyn Document> {
        self.documents.resolve(key, || self.load_document(key))
    }

    /// Blocking page lookup; loads the document first when needed
    pub fn resolve_page(&self, key: &PageKey) -> FlightResult<dyn Page> {
        self.pages.resolve(key, || self.load_page(key))
    }

    /// Blocking image lookup; resolves the whole chain when needed
    pub fn resolve_image(&self, key: &ImageKey) -> FlightResult<RenderedImage> {
        self.images.resolve(key, || self.load_image(key))
    }

    fn load_document(&self, key: &SourceKey) -> FlightResult<dyn Document> {
        log::info!("Loading document {key}");
        let bytes = self.fetcher.fetch(key)?;
        let document = self.decoder.decode(bytes)?;
        log::info!("Decoded {key}: {} pages", document.page_count());
        Ok(document)
    }

    fn load_page(&self, key: &PageKey) -> FlightResult<dyn Page> {
        let document = self.resolve_document(&key.source)?;
        check_page_range(key.page, document.page_count())?;
        document.get_page(key.page)
    }

    fn load_image(&self, key: &ImageKey) -> FlightResult<RenderedImage> {
        let page = self.resolve_page(&key.page_key())?;
        let image = rasterize(page.as_ref(), key.zoom, &key.background)?;
        log::debug!(
            "Rendered {key} at {}x{}",
            image.width(),
            image.height()
        );
        Ok(Arc::new(image))
    }

    fn dispatch(&self, job: Job) {
        if let Err(flume::SendError(job)) = self.jobs.send(job) {
            log::warn!("Render pool is gone, running job inline");
            self.run_job(job);
        }
    }

    /// Execute one job unless its flight was already claimed elsewhere
    pub fn run_job(&self, job: Job) {
        match job {
            Job::Document { key, ticket } => {
                if let Some(Err(e)) = self
                    .documents
                    .execute(&key, &ticket, || self.load_document(&key))
                {
                    log::error!("Failed to load {key}: {e}");
                }
            }

            Job::Page { key, ticket } => {
                if let Some(Err(e)) = self.pages.execute(&key, &ticket, || self.load_page(&key)) {
                    log::error!("Failed to load page {key}: {e}");
                }
            }

            Job::Image { key, ticket } => {
                match self.images.execute(&key, &ticket, || self.load_image(&key)) {
                    Some(Ok(image)) => {
                        let _ = self.events.send(RenderEvent::Ready { key, image });
                    }
                    Some(Err(error)) => {
                        log::error!("Failed to render {key}: {error}");
                        let _ = self.events.send(RenderEvent::Failed { key, error });
                    }
                    None => log::debug!("Render for {key} already claimed"),
                }
            }

            Job::Shutdown => {}
        }
    }

    /// Remove every entry derived from a logical source id, images first
    pub fn evict_source(&self, logical: &str) -> EvictionStats {
        let images = self.images.evict_source(logical);
        let pages = self.pages.evict_source(logical);
        let documents = self.documents.evict_source(logical);
        EvictionStats {
            documents,
            pages,
            images,
        }
    }

    pub fn clear(&self) {
        self.images.clear();
        self.pages.clear();
        self.documents.clear();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            documents: self.documents.len(),
            pages: self.pages.len(),
            images: self.images.len(),
            pending: self.documents.pending() + self.pages.pending() + self.images.pending(),
        }
    }
}

/// Worker loop: pull jobs off the shared queue until told to stop
pub fn render_worker(layers: Arc<Layers>, jobs: Receiver<Job>) {
    for job in jobs {
        if matches!(job, Job::Shutdown) {
            break;
        }
        layers.run_job(job);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::pdf::FaultKind;
    use crate::pdf::keys::PageIndex;
    use crate::test_utils::MockBackend;

    fn layers(backend: &Arc<MockBackend>) -> (Layers, Receiver<Job>, Receiver<RenderEvent>) {
        let (job_tx, job_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let layers = Layers::new(backend.clone(), backend.clone(), job_tx, event_tx);
        (layers, job_rx, event_rx)
    }

    fn image_key(source: &str, page: usize, zoom: f64) -> ImageKey {
        ImageKey {
            source: SourceKey::opaque(source),
            page: PageIndex::new(page),
            zoom: ZoomLevel::new(zoom),
            background: BackgroundKey::white(),
        }
    }

    #[test]
    fn raster_spec_scales_natural_size() {
        let spec = RasterSpec::compute((100.0, 50.0), ZoomLevel::new(1.5)).unwrap();
        assert_eq!(spec, RasterSpec { width: 150, height: 75 });

        let tiny = RasterSpec::compute((1.0, 1.0), ZoomLevel::new(0.01)).unwrap();
        assert_eq!(tiny, RasterSpec { width: 1, height: 1 });
    }

    #[test]
    fn raster_spec_rejects_oversized_and_empty_pages() {
        let err = RasterSpec::compute((1000.0, 1000.0), ZoomLevel::new(100.0)).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Render);
        assert!(RasterSpec::compute((0.0, 10.0), ZoomLevel::default()).is_err());
    }

    #[test]
    fn resolve_image_walks_all_layers() {
        let backend = Arc::new(MockBackend::new().with_document("doc.pdf", 3));
        let (layers, _jobs, _events) = layers(&backend);

        let image = layers.resolve_image(&image_key("doc.pdf", 2, 1.0)).unwrap();
        assert_eq!(image.dimensions(), backend.page_size_px(1.0));

        let stats = layers.stats();
        assert_eq!((stats.documents, stats.pages, stats.images), (1, 1, 1));
        assert_eq!(backend.calls().fetches, 1);
    }

    #[test]
    fn out_of_range_page_fails_and_stays_absent() {
        let backend = Arc::new(MockBackend::new().with_document("doc.pdf", 3));
        let (layers, _jobs, _events) = layers(&backend);

        let key = image_key("doc.pdf", 4, 1.0);
        let err = layers.resolve_image(&key).unwrap_err();
        assert_eq!(err.kind(), FaultKind::PageRange);
        assert!(layers.images.state(&key).is_absent());
        // The document itself loaded fine and stays cached.
        assert_eq!(layers.documents.len(), 1);
    }

    #[test]
    fn queued_job_publishes_event() {
        let backend = Arc::new(MockBackend::new().with_document("doc.pdf", 1));
        let (layers, jobs, events) = layers(&backend);
        let key = image_key("doc.pdf", 1, 1.0);

        let HandleState::Absent(ticket) = layers.get_or_begin_image(&key) else {
            panic!("first lookup should queue a render");
        };
        assert!(matches!(
            layers.get_or_begin_image(&key),
            HandleState::Pending(_)
        ));

        layers.run_job(jobs.try_recv().unwrap());
        assert!(ticket.wait().is_ok());
        assert!(matches!(
            events.try_recv().unwrap(),
            RenderEvent::Ready { .. }
        ));
        assert!(matches!(
            layers.get_or_begin_image(&key),
            HandleState::Ready(_)
        ));
    }

    #[test]
    fn job_queued_before_eviction_does_no_work() {
        let backend = Arc::new(MockBackend::new().with_document("doc.pdf", 1));
        let (layers, jobs, events) = layers(&backend);
        let key = image_key("doc.pdf", 1, 1.0);

        let HandleState::Absent(ticket) = layers.get_or_begin_image(&key) else {
            panic!("first lookup should queue a render");
        };
        assert_eq!(layers.evict_source("doc.pdf").images, 1);

        layers.run_job(jobs.try_recv().unwrap());
        assert_eq!(ticket.wait().unwrap_err().kind(), FaultKind::Generic);
        assert!(matches!(
            events.try_recv().unwrap(),
            RenderEvent::Failed { .. }
        ));
        assert_eq!(backend.calls().fetches, 0);
        let stats = layers.stats();
        assert_eq!((stats.documents, stats.pages, stats.images), (0, 0, 0));
    }

    #[test]
    fn concurrent_resolves_share_one_chain() {
        let backend = Arc::new(MockBackend::new().with_document("doc.pdf", 2));
        let (layers, _jobs, _events) = layers(&backend);
        let layers = Arc::new(layers);
        let gate = backend.hold();
        let started = Arc::new(Barrier::new(7));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let layers = Arc::clone(&layers);
                let started = Arc::clone(&started);
                thread::spawn(move || {
                    started.wait();
                    layers.resolve_image(&image_key("doc.pdf", 1, 1.0))
                })
            })
            .collect();

        // Every thread is running and one of them is parked in the fetch.
        started.wait();
        assert!(backend.wait_for_calls(Duration::from_secs(10), |c| c.fetches == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(layers.images.pending(), 1);

        gate.release();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        let calls = backend.calls();
        assert_eq!((calls.fetches, calls.decodes, calls.renders), (1, 1, 1));
    }
}
