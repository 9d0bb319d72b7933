//! Cache keys for the document, page and image layers

use std::fmt;
use std::sync::Arc;

use log::debug;
use url::Url;

use super::color::BackgroundKey;
use super::zoom::ZoomLevel;

/// Canonical identity of one document instance
///
/// `logical` is the identifier the host asked for; `resolved` additionally
/// carries the freshness token for same-origin sources, so an edited file
/// yields a new key while the logical identifier stays the same.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceKey {
    logical: Arc<str>,
    resolved: Arc<str>,
}

impl SourceKey {
    #[must_use]
    pub fn new(logical: &str, resolved: &str) -> Self {
        Self {
            logical: logical.into(),
            resolved: resolved.into(),
        }
    }

    /// Key for an opaque identifier with no freshness component
    #[must_use]
    pub fn opaque(source: &str) -> Self {
        let shared: Arc<str> = source.into();
        Self {
            logical: shared.clone(),
            resolved: shared,
        }
    }

    #[must_use]
    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub(crate) fn logical_shared(&self) -> &Arc<str> {
        &self.logical
    }

    /// Location the raw bytes are fetched from
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.resolved
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resolved)
    }
}

/// 1-based page index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageIndex(usize);

impl PageIndex {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Floor a host page number; NaN and negatives become 0, which no
    /// document contains
    #[must_use]
    pub fn floor(page_number: f64) -> Self {
        Self(page_number.floor() as usize)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Zero-based position for decoders that count from zero
    #[must_use]
    pub const fn zero_based(self) -> usize {
        self.0.saturating_sub(1)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page layer key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub source: SourceKey,
    pub page: PageIndex,
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.page)
    }
}

/// Image layer key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub source: SourceKey,
    pub page: PageIndex,
    pub zoom: ZoomLevel,
    pub background: BackgroundKey,
}

impl ImageKey {
    #[must_use]
    pub fn page_key(&self) -> PageKey {
        PageKey {
            source: self.source.clone(),
            page: self.page,
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}/{}",
            self.source, self.page, self.zoom, self.background
        )
    }
}

/// Derives source keys from logical identifiers
#[derive(Clone, Debug)]
pub struct KeyResolver {
    origin: Url,
}

impl KeyResolver {
    /// Query parameter carrying the freshness token
    pub const FRESHNESS_PARAM: &'static str = "asset-hash";

    #[must_use]
    pub fn new(origin: Url) -> Self {
        Self { origin }
    }

    /// Resolver whose origin is the given local directory
    pub fn for_directory(dir: &std::path::Path) -> Option<Self> {
        Url::from_directory_path(dir).ok().map(Self::new)
    }

    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Resolve `source` against the origin; same-origin sources get the
    /// freshness token appended, everything else passes through unchanged
    #[must_use]
    pub fn resolve(&self, source: &str, freshness: Option<&str>) -> SourceKey {
        let Ok(mut url) = self.origin.join(source) else {
            debug!("Source {source:?} is not a URL, keeping it opaque");
            return SourceKey::opaque(source);
        };

        if !same_origin(&url, &self.origin) {
            return SourceKey::opaque(source);
        }

        if let Some(token) = freshness {
            let retained: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != Self::FRESHNESS_PARAM)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(retained)
                .append_pair(Self::FRESHNESS_PARAM, token);
        }

        SourceKey::new(source, url.as_str())
    }
}

// File URLs have opaque origins that never compare equal, so any two local
// files count as same-origin.
fn same_origin(a: &Url, b: &Url) -> bool {
    if a.scheme() == "file" || b.scheme() == "file" {
        return a.scheme() == b.scheme();
    }
    a.origin() == b.origin()
}
