//! Raster types for page rendering

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::{ImageFormat, RgbaImage};
use rayon::prelude::*;

use super::color::Rgba;
use super::flight::Ticket;
use super::request::RenderFault;

/// Largest surface side, in pixels, a page may be rasterized to
pub const MAX_SURFACE_DIMENSION: u32 = 16_384;

/// Pixel count above which compositing runs row-parallel
const PARALLEL_PIXELS: usize = 200_000;

/// How the channels of a [`Samples`] buffer carry coverage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleAlpha {
    /// RGB only; samples replace the surface
    None,
    /// RGBA with color premultiplied by alpha
    Premultiplied,
}

/// Borrowed sample buffer produced by a decoder
#[derive(Clone, Copy, Debug)]
pub struct Samples<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * channels`
    pub stride: usize,
    pub channels: usize,
    pub alpha: SampleAlpha,
}

/// Pixel surface pages are rasterized onto (RGBA8, row-major, no padding)
pub struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Surface {
    /// Allocate a zeroed surface, failing for empty or oversized dimensions
    pub fn allocate(width: u32, height: u32) -> Result<Self, RenderFault> {
        if width == 0 || height == 0 {
            return Err(RenderFault::render(format!(
                "empty surface {width}x{height}"
            )));
        }
        if width > MAX_SURFACE_DIMENSION || height > MAX_SURFACE_DIMENSION {
            return Err(RenderFault::render(format!(
                "surface {width}x{height} exceeds {MAX_SURFACE_DIMENSION}px"
            )));
        }

        let len = width as usize * height as usize * 4;
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|e| RenderFault::render(format!("surface allocation: {e}")))?;
        pixels.resize(len, 0);

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ])
    }

    pub fn fill(&mut self, color: Rgba) {
        let rgba = color.to_array();
        for px in self.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }

    /// Fill a rectangle, clipped to the surface
    pub fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Rgba) {
        let x1 = x.saturating_add(width).min(self.width) as usize;
        let y1 = y.saturating_add(height).min(self.height) as usize;
        let x0 = (x as usize).min(x1);
        let y0 = (y as usize).min(y1);
        let rgba = color.to_array();
        let stride = self.width as usize * 4;

        for row in self.pixels.chunks_exact_mut(stride).take(y1).skip(y0) {
            for px in row[x0 * 4..x1 * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&rgba);
            }
        }
    }

    /// Composite a decoder sample buffer onto the surface, anchored at the
    /// top-left corner and clipped to the overlap
    pub fn draw_samples(&mut self, samples: &Samples<'_>) -> Result<(), RenderFault> {
        let needed = match samples.alpha {
            SampleAlpha::None => 3,
            SampleAlpha::Premultiplied => 4,
        };
        let channels = samples.channels;
        if channels < needed {
            return Err(RenderFault::render(format!(
                "unsupported sample format: {channels} channels"
            )));
        }

        let src_width = samples.width as usize;
        let src_height = samples.height as usize;
        let stride = samples.stride;
        let row_bytes = src_width * channels;
        if row_bytes > stride
            || samples.data.len() < stride.saturating_mul(src_height.saturating_sub(1)) + row_bytes
        {
            return Err(RenderFault::render("sample buffer size mismatch"));
        }

        let width = (self.width as usize).min(src_width);
        let height = (self.height as usize).min(src_height);
        let alpha = samples.alpha;
        let data = samples.data;

        let blend_row = |(y, dst): (usize, &mut [u8])| {
            let src = &data[y * stride..y * stride + width * channels];
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(channels)) {
                match alpha {
                    SampleAlpha::None => {
                        d[..3].copy_from_slice(&s[..3]);
                        d[3] = 0xff;
                    }
                    SampleAlpha::Premultiplied => {
                        let a = u16::from(s[channels - 1]);
                        let inv = 255 - a;
                        for c in 0..3 {
                            let blended = u16::from(s[c]) + (u16::from(d[c]) * inv + 127) / 255;
                            d[c] = blended.min(255) as u8;
                        }
                        d[3] = (a + (u16::from(d[3]) * inv + 127) / 255).min(255) as u8;
                    }
                }
            }
        };

        let dst_stride = self.width as usize * 4;
        if width * height >= PARALLEL_PIXELS {
            self.pixels
                .par_chunks_mut(dst_stride)
                .take(height)
                .enumerate()
                .for_each(blend_row);
        } else {
            self.pixels
                .chunks_mut(dst_stride)
                .take(height)
                .enumerate()
                .for_each(blend_row);
        }

        Ok(())
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Finished raster held by the image cache
pub struct RenderedImage {
    image: RgbaImage,
}

impl RenderedImage {
    /// Encode a finished surface into its cached representation
    pub fn from_surface(surface: Surface) -> Result<Self, RenderFault> {
        let Surface {
            width,
            height,
            pixels,
        } = surface;
        RgbaImage::from_raw(width, height, pixels)
            .map(|image| Self { image })
            .ok_or_else(|| RenderFault::render("surface buffer does not match its dimensions"))
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    #[must_use]
    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        self.image.get_pixel_checked(x, y).map(|p| p.0)
    }

    /// PNG bytes of the image
    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = Cursor::new(Vec::new());
        self.image.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }

    pub fn save(&self, path: &Path) -> Result<(), image::ImageError> {
        self.image.save(path)
    }
}

impl std::fmt::Debug for RenderedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedImage")
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish_non_exhaustive()
    }
}

/// What `request_image` hands back immediately
#[derive(Clone, Debug)]
pub enum CurrentValue {
    /// Cached image for exactly the requested key
    Ready(Arc<RenderedImage>),

    /// Work is in flight. `previous` is the last image served for the same
    /// source, if any; `ticket` settles when the requested image is done.
    Placeholder {
        previous: Option<Arc<RenderedImage>>,
        ticket: Ticket<RenderedImage>,
    },
}

impl CurrentValue {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Image to display right now; `None` means draw a blank
    #[must_use]
    pub fn image(&self) -> Option<&Arc<RenderedImage>> {
        match self {
            Self::Ready(image) => Some(image),
            Self::Placeholder { previous, .. } => previous.as_ref(),
        }
    }

    /// Block until the requested image is available
    pub fn wait(self) -> Result<Arc<RenderedImage>, RenderFault> {
        match self {
            Self::Ready(image) => Ok(image),
            Self::Placeholder { ticket, .. } => ticket.wait(),
        }
    }
}
