//! Scripted fetch/decode backend for tests
//!
//! `MockBackend` serves registered documents by logical id, counts every
//! call that crosses the boundary and can hold fetches and renders at a gate
//! so concurrent requests pile up deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::pdf::{
    Decoder, Document, Fetcher, Page, PageIndex, RenderFault, Rgba, SourceKey, Surface, ZoomLevel,
    check_page_range,
};

/// Natural page size of every mock page, in points
pub const MOCK_PAGE_SIZE: (f32, f32) = (40.0, 20.0);

const MAGIC: &str = "MOCKDOC";

/// Calls observed at the backend boundary
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetches: usize,
    pub decodes: usize,
    pub pages: usize,
    pub renders: usize,
}

#[derive(Default)]
struct Counters {
    fetches: AtomicUsize,
    decodes: AtomicUsize,
    pages: AtomicUsize,
    renders: AtomicUsize,
}

/// Blocks callers while closed
#[derive(Default)]
pub struct Gate {
    closed: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn open(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.cv.notify_all();
    }

    fn pass(&self) {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        let _open = self
            .cv
            .wait_while(closed, |closed| *closed)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Keeps the gate closed until released or dropped
pub struct Hold {
    gate: Arc<Gate>,
}

impl Hold {
    pub fn release(self) {}
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.gate.open();
    }
}

#[derive(Clone, Debug)]
enum Entry {
    Pages { count: usize, generation: u32 },
    Corrupt,
}

/// Fetcher and decoder over an in-memory set of documents
pub struct MockBackend {
    entries: Mutex<HashMap<String, Entry>>,
    counters: Arc<Counters>,
    gate: Arc<Gate>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            counters: Arc::default(),
            gate: Arc::default(),
        }
    }

    /// Register a document with `pages` pages under a logical id
    pub fn with_document(self, logical: &str, pages: usize) -> Self {
        self.set_document(logical, pages);
        self
    }

    /// Register a source whose bytes do not decode
    pub fn with_corrupt(self, logical: &str) -> Self {
        self.lock_entries()
            .insert(logical.to_string(), Entry::Corrupt);
        self
    }

    /// Add or replace a document; replacing bumps its generation so renders
    /// of the new content differ from the old
    pub fn set_document(&self, logical: &str, pages: usize) {
        let mut entries = self.lock_entries();
        let generation = match entries.get(logical) {
            Some(Entry::Pages { generation, .. }) => generation + 1,
            _ => 0,
        };
        entries.insert(
            logical.to_string(),
            Entry::Pages {
                count: pages,
                generation,
            },
        );
    }

    pub fn remove_document(&self, logical: &str) {
        self.lock_entries().remove(logical);
    }

    /// Close the gate; fetches and renders block until the hold is released
    pub fn hold(&self) -> Hold {
        self.gate.close();
        Hold {
            gate: Arc::clone(&self.gate),
        }
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            fetches: self.counters.fetches.load(Ordering::SeqCst),
            decodes: self.counters.decodes.load(Ordering::SeqCst),
            pages: self.counters.pages.load(Ordering::SeqCst),
            renders: self.counters.renders.load(Ordering::SeqCst),
        }
    }

    /// Poll the counters until `done` holds; false on timeout
    pub fn wait_for_calls(&self, timeout: Duration, done: impl Fn(&CallCounts) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&self.calls()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Pixel size of a mock page at `zoom`
    pub fn page_size_px(&self, zoom: f64) -> (u32, u32) {
        let zoom = ZoomLevel::new(zoom).factor();
        (
            (f64::from(MOCK_PAGE_SIZE.0) * zoom).ceil().max(1.0) as u32,
            (f64::from(MOCK_PAGE_SIZE.1) * zoom).ceil().max(1.0) as u32,
        )
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Fetcher for MockBackend {
    fn fetch(&self, source: &SourceKey) -> Result<Vec<u8>, RenderFault> {
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);
        self.gate.pass();

        let entry = self.lock_entries().get(source.logical()).cloned();
        match entry {
            Some(Entry::Pages { count, generation }) => {
                Ok(format!("{MAGIC} {count} {generation}").into_bytes())
            }
            Some(Entry::Corrupt) => Ok(b"%PDF-garbage".to_vec()),
            None => Err(RenderFault::fetch(source.as_str(), "no such document")),
        }
    }
}

impl Decoder for MockBackend {
    fn decode(&self, bytes: Vec<u8>) -> Result<Arc<dyn Document>, RenderFault> {
        self.counters.decodes.fetch_add(1, Ordering::SeqCst);

        let text = String::from_utf8(bytes).map_err(RenderFault::decode)?;
        let mut parts = text.split_whitespace();
        if parts.next() != Some(MAGIC) {
            return Err(RenderFault::decode("not a mock document"));
        }
        let parse = |part: Option<&str>| -> Result<u32, RenderFault> {
            part.and_then(|p| p.parse().ok())
                .ok_or_else(|| RenderFault::decode("truncated mock document"))
        };
        let page_count = parse(parts.next())? as usize;
        let generation = parse(parts.next())?;

        Ok(Arc::new(MockDocument {
            page_count,
            generation,
            counters: Arc::clone(&self.counters),
            gate: Arc::clone(&self.gate),
        }))
    }
}

struct MockDocument {
    page_count: usize,
    generation: u32,
    counters: Arc<Counters>,
    gate: Arc<Gate>,
}

impl Document for MockDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn get_page(&self, index: PageIndex) -> Result<Arc<dyn Page>, RenderFault> {
        check_page_range(index, self.page_count)?;
        self.counters.pages.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPage {
            index,
            generation: self.generation,
            counters: Arc::clone(&self.counters),
            gate: Arc::clone(&self.gate),
        }))
    }
}

struct MockPage {
    index: PageIndex,
    generation: u32,
    counters: Arc<Counters>,
    gate: Arc<Gate>,
}

impl Page for MockPage {
    fn natural_size(&self) -> (f32, f32) {
        MOCK_PAGE_SIZE
    }

    /// Paints the top-left quarter with a color encoding page index and
    /// generation
    fn render(&self, surface: &mut Surface, _zoom: ZoomLevel, _background: Rgba) -> Result<(), RenderFault> {
        self.counters.renders.fetch_add(1, Ordering::SeqCst);
        self.gate.pass();

        let ink = mock_ink(self.index.get(), self.generation);
        let (w, h) = (surface.width(), surface.height());
        surface.fill_rect(0, 0, w.div_ceil(2), h.div_ceil(2), ink);
        Ok(())
    }
}

/// Color a mock page paints its top-left corner with
pub fn mock_ink(page: usize, generation: u32) -> Rgba {
    Rgba::opaque(
        (page % 256) as u8,
        (generation % 256) as u8,
        0x40,
    )
}
