//! Render request, completion event and fault types

use std::sync::Arc;

use super::keys::ImageKey;
use super::types::RenderedImage;

/// Current host-side values a render is requested with
#[derive(Clone, Debug, PartialEq)]
pub struct RenderRequest {
    /// Logical source identifier (path or URL)
    pub source: String,
    /// Page number as driven by the host; fractional values are floored
    pub page_number: f64,
    /// Scale factor applied when rasterizing
    pub zoom: f64,
    /// Background color in any supported notation
    pub background: String,
    /// Asset generation hash, only applied to same-origin sources
    pub freshness: Option<String>,
}

impl RenderRequest {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            page_number: 1.0,
            zoom: 1.0,
            background: "white".to_string(),
            freshness: None,
        }
    }

    #[must_use]
    pub fn page(mut self, page_number: f64) -> Self {
        self.page_number = page_number;
        self
    }

    #[must_use]
    pub fn zoom(mut self, zoom: f64) -> Self {
        self.zoom = zoom;
        self
    }

    #[must_use]
    pub fn background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    #[must_use]
    pub fn freshness(mut self, token: impl Into<String>) -> Self {
        self.freshness = Some(token.into());
        self
    }
}

/// Distinguishable fault categories
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Fetch,
    Decode,
    PageRange,
    Render,
    Generic,
}

/// Errors from loading or rasterizing
///
/// Every fault is scoped to one cache key and retryable. Faults are `Clone`
/// so a single outcome can be handed to every caller attached to a load.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RenderFault {
    #[error("fetch {source_key}: {detail}")]
    Fetch { source_key: String, detail: String },

    #[error("decode: {detail}")]
    Decode { detail: String },

    #[error("page {page} outside 1..={page_count}")]
    PageRange { page: usize, page_count: usize },

    #[error("render: {detail}")]
    Render { detail: String },

    #[error("{detail}")]
    Generic { detail: String },
}

impl RenderFault {
    pub fn fetch(source_key: impl Into<String>, detail: impl ToString) -> Self {
        Self::Fetch {
            source_key: source_key.into(),
            detail: detail.to_string(),
        }
    }

    pub fn decode(detail: impl ToString) -> Self {
        Self::Decode {
            detail: detail.to_string(),
        }
    }

    pub fn render(detail: impl ToString) -> Self {
        Self::Render {
            detail: detail.to_string(),
        }
    }

    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic { detail: msg.into() }
    }

    #[must_use]
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Fetch { .. } => FaultKind::Fetch,
            Self::Decode { .. } => FaultKind::Decode,
            Self::PageRange { .. } => FaultKind::PageRange,
            Self::Render { .. } => FaultKind::Render,
            Self::Generic { .. } => FaultKind::Generic,
        }
    }
}

/// Completion notice published by render workers
#[derive(Debug)]
pub enum RenderEvent {
    /// Image for the key is now cached
    Ready {
        key: ImageKey,
        image: Arc<RenderedImage>,
    },

    /// Load or render for the key failed; the key is absent again
    Failed { key: ImageKey, error: RenderFault },
}

impl RenderEvent {
    #[must_use]
    pub fn key(&self) -> &ImageKey {
        match self {
            Self::Ready { key, .. } | Self::Failed { key, .. } => key,
        }
    }
}
