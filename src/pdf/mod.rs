//! Page rendering infrastructure
//!
//! Three cache layers (documents, pages, images) sit behind
//! [`RenderPipeline`]. Missing entries are loaded on a worker pool with at
//! most one in-flight load per key.

mod backend;
mod cache;
mod color;
mod fetch;
mod flight;
mod invalidation;
mod keys;
#[cfg(feature = "pdf")]
mod mupdf_backend;
mod request;
mod service;
mod state;
mod types;
mod worker;
mod zoom;

pub use backend::{Decoder, Document, Fetcher, Page, check_page_range};
pub use cache::{CacheStats, DocumentCache, ImageCache, LayerCache, PageCache, SourceScoped};
pub use color::{BackgroundKey, ColorParseError, Rgba};
pub use fetch::{FsFetcher, HttpFetcher, SourceFetcher, asset_hash, local_path};
pub use flight::{Begin, FlightMap, FlightResult, SlotState, Ticket};
#[cfg(feature = "watch")]
pub use invalidation::FileWatcher;
pub use invalidation::{AssetChange, EvictionStats, InvalidationBus};
pub use keys::{ImageKey, KeyResolver, PageIndex, PageKey, SourceKey};
#[cfg(feature = "pdf")]
pub use mupdf_backend::MupdfDecoder;
pub use request::{FaultKind, RenderEvent, RenderFault, RenderRequest};
pub use service::{PipelineConfig, RenderPipeline, default_origin};
pub use state::{Command, Effect, ViewState};
pub use types::*;
pub use worker::{HandleState, Job, Layers, RasterSpec, rasterize, render_worker};
pub use zoom::ZoomLevel;

/// Default number of render worker threads
pub const DEFAULT_WORKERS: usize = 2;

/// Default HTTP fetch timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
