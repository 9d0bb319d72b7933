//! MuPDF implementation of the decode boundary
//!
//! MuPDF handles are not `Send`. Documents therefore keep the raw bytes and
//! reopen a fresh handle for every operation, serialized per document.

use std::sync::{Arc, Mutex, PoisonError};

use mupdf::{Colorspace, Matrix};

use super::backend::{Decoder, Document, Page, check_page_range};
use super::color::Rgba;
use super::keys::PageIndex;
use super::request::RenderFault;
use super::types::{SampleAlpha, Samples, Surface};
use super::zoom::ZoomLevel;

const PDF_MAGIC: &str = "application/pdf";

struct Shared {
    bytes: Vec<u8>,
    lock: Mutex<()>,
}

impl Shared {
    fn with_doc<T>(
        &self,
        op: impl FnOnce(&mupdf::Document) -> Result<T, mupdf::Error>,
    ) -> Result<T, mupdf::Error> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let doc = mupdf::Document::from_bytes(&self.bytes, PDF_MAGIC)?;
        op(&doc)
    }
}

/// Decodes PDF bytes with MuPDF
#[derive(Clone, Copy, Debug, Default)]
pub struct MupdfDecoder;

impl Decoder for MupdfDecoder {
    fn decode(&self, bytes: Vec<u8>) -> Result<Arc<dyn Document>, RenderFault> {
        let shared = Arc::new(Shared {
            bytes,
            lock: Mutex::new(()),
        });
        let page_count = shared
            .with_doc(|doc| doc.page_count())
            .map_err(RenderFault::decode)?;
        let page_count = usize::try_from(page_count).unwrap_or(0);
        if page_count == 0 {
            return Err(RenderFault::decode("document has no pages"));
        }

        Ok(Arc::new(MupdfDocument { shared, page_count }))
    }
}

struct MupdfDocument {
    shared: Arc<Shared>,
    page_count: usize,
}

impl Document for MupdfDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn get_page(&self, index: PageIndex) -> Result<Arc<dyn Page>, RenderFault> {
        check_page_range(index, self.page_count)?;
        let number = page_number(index)?;
        let bounds = self
            .shared
            .with_doc(|doc| doc.load_page(number)?.bounds())
            .map_err(RenderFault::decode)?;

        Ok(Arc::new(MupdfPage {
            shared: Arc::clone(&self.shared),
            number,
            size: (bounds.x1 - bounds.x0, bounds.y1 - bounds.y0),
        }))
    }
}

struct MupdfPage {
    shared: Arc<Shared>,
    number: i32,
    size: (f32, f32),
}

impl Page for MupdfPage {
    fn natural_size(&self) -> (f32, f32) {
        self.size
    }

    fn render(&self, surface: &mut Surface, zoom: ZoomLevel, _background: Rgba) -> Result<(), RenderFault> {
        let scale = zoom.factor() as f32;
        let transform = Matrix::new_scale(scale, scale);

        self.shared
            .with_doc(|doc| {
                let page = doc.load_page(self.number)?;
                let pixmap = page.to_pixmap(&transform, &Colorspace::device_rgb(), true, false)?;
                let samples = Samples {
                    data: pixmap.samples(),
                    width: pixmap.width(),
                    height: pixmap.height(),
                    stride: pixmap.stride() as usize,
                    channels: pixmap.n() as usize,
                    alpha: SampleAlpha::Premultiplied,
                };
                Ok(surface.draw_samples(&samples))
            })
            .map_err(RenderFault::render)?
    }
}

fn page_number(index: PageIndex) -> Result<i32, RenderFault> {
    i32::try_from(index.zero_based())
        .map_err(|_| RenderFault::generic(format!("page {index} beyond decoder range")))
}
