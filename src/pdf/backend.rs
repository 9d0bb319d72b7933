//! Boundary to the fetch and decode libraries
//!
//! The pipeline only sees these traits. A MuPDF implementation lives in
//! `mupdf_backend` and a scripted one in `test_utils`.

use std::sync::Arc;

use super::color::Rgba;
use super::keys::{PageIndex, SourceKey};
use super::request::RenderFault;
use super::types::Surface;
use super::zoom::ZoomLevel;

/// Reads the raw bytes of a source
pub trait Fetcher: Send + Sync {
    fn fetch(&self, source: &SourceKey) -> Result<Vec<u8>, RenderFault>;
}

/// Turns raw bytes into a document
pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: Vec<u8>) -> Result<Arc<dyn Document>, RenderFault>;
}

/// A decoded, immutable document
pub trait Document: Send + Sync {
    fn page_count(&self) -> usize;

    /// Page by 1-based index; fails with [`RenderFault::PageRange`] outside
    /// `1..=page_count`
    fn get_page(&self, index: PageIndex) -> Result<Arc<dyn Page>, RenderFault>;
}

/// A decoded, immutable page
pub trait Page: Send + Sync {
    /// Width and height in points at zoom 1.0
    fn natural_size(&self) -> (f32, f32);

    /// Rasterize onto `surface`, which is already sized for `zoom` and
    /// filled with `background`
    fn render(&self, surface: &mut Surface, zoom: ZoomLevel, background: Rgba)
    -> Result<(), RenderFault>;
}

/// Range check shared by [`Document`] implementations
pub fn check_page_range(index: PageIndex, page_count: usize) -> Result<(), RenderFault> {
    if index.get() == 0 || index.get() > page_count {
        return Err(RenderFault::PageRange {
            page: index.get(),
            page_count,
        });
    }
    Ok(())
}
