//! Zoom level used as part of the rendered-image key
//!
//! Zoom is not quantized: every distinct sampled value gets its own cache
//! entry, so a host animating scale continuously produces one image per
//! distinct value.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Positive, finite scale factor applied when rasterizing a page
#[derive(Clone, Copy, Debug)]
pub struct ZoomLevel(f64);

impl ZoomLevel {
    /// Minimum allowed zoom factor
    pub const MIN_SCALE: f64 = 0.01;

    /// Normalize a raw factor, handling NaN/Inf and non-positive values
    #[must_use]
    pub fn new(factor: f64) -> Self {
        Self(Self::clamp_factor(factor))
    }

    /// Zoom for a display scaled independently on each axis
    #[must_use]
    pub fn from_axes(scale_x: f64, scale_y: f64) -> Self {
        Self::new(scale_x.abs().max(scale_y.abs()))
    }

    #[must_use]
    pub fn factor(self) -> f64 {
        self.0
    }

    /// Clamp factor to valid range, handling NaN/Inf
    pub fn clamp_factor(factor: f64) -> f64 {
        if !factor.is_finite() {
            1.0
        } else {
            factor.max(Self::MIN_SCALE)
        }
    }
}

impl Default for ZoomLevel {
    fn default() -> Self {
        Self(1.0)
    }
}

// Clamped values are finite and positive, so bitwise identity is value identity.
impl PartialEq for ZoomLevel {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for ZoomLevel {}

impl Hash for ZoomLevel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for ZoomLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0)
    }
}
