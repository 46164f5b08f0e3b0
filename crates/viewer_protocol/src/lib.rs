//! Contracts between the viewer pipeline and its collaborators.
//!
//! The upstream render graph, the display backend and the presentation surface
//! live outside this workspace; the pipeline only sees them through the traits
//! below. Messages crossing the render/presentation thread boundary are also
//! defined here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use frame_model::{ChannelMode, DisplayParams, FrameEntry, PixelRect, TextureRect};

/// Process-wide "must quit" flag. Polled at checkpoints, never pushed.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Float RGBA image produced by the upstream graph, row-major from `bounds.y1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    bounds: PixelRect,
    pixels: Vec<[f32; 4]>,
}

pub type SharedImage = Arc<Image>;

impl Image {
    pub fn new(bounds: PixelRect, pixels: Vec<[f32; 4]>) -> Self {
        assert_eq!(
            pixels.len(),
            bounds.width() as usize * bounds.height() as usize,
            "image pixel count must match its bounds"
        );
        Self { bounds, pixels }
    }

    pub fn from_fn(bounds: PixelRect, mut sample: impl FnMut(i32, i32) -> [f32; 4]) -> Self {
        let mut pixels = Vec::with_capacity(bounds.width() as usize * bounds.height() as usize);
        for y in bounds.y1..bounds.y2.max(bounds.y1) {
            for x in bounds.x1..bounds.x2.max(bounds.x1) {
                pixels.push(sample(x, y));
            }
        }
        Self::new(bounds, pixels)
    }

    pub fn filled(bounds: PixelRect, color: [f32; 4]) -> Self {
        Self::from_fn(bounds, |_, _| color)
    }

    pub fn bounds(&self) -> PixelRect {
        self.bounds
    }

    /// Pixel at image coordinates, `None` outside the bounds.
    pub fn pixel(&self, x: i32, y: i32) -> Option<[f32; 4]> {
        if !self.bounds.contains(x, y) {
            return None;
        }
        let row = (y - self.bounds.y1) as usize;
        let column = (x - self.bounds.x1) as usize;
        Some(self.pixels[row * self.bounds.width() as usize + column])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("region of definition unavailable at time {time}: {reason}")]
    RegionOfDefinition { time: i64, reason: String },
    #[error("render failed at time {time}: {reason}")]
    Render { time: i64, reason: String },
}

/// Capability interface of whichever graph node currently feeds the viewer.
/// Resolved once per request.
pub trait UpstreamNode: Send + Sync {
    fn region_of_definition(&self, time: i64, view: u32) -> Result<PixelRect, UpstreamError>;

    fn render_region_of_interest(
        &self,
        time: i64,
        view: u32,
        region: PixelRect,
        scale: f64,
    ) -> Result<SharedImage, UpstreamError>;

    /// Inclusive `(first, last)` frame range.
    fn frame_range(&self) -> (i64, i64);

    /// Content hash of the computation graph feeding the viewer at `time`.
    fn graph_hash(&self, time: i64) -> u64;
}

/// One axis of the texture tiling: `count` destination rows (or columns)
/// starting at image coordinate `start`, each sampling the matching entry of
/// `sources`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpanDecomposition {
    pub start: i32,
    pub count: u32,
    pub sources: Vec<i32>,
}

impl SpanDecomposition {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub trait DisplayBackend: Send + Sync {
    fn display_params(&self) -> DisplayParams;

    fn display_window(&self) -> PixelRect;

    /// When false the region of definition is not clipped to the display window.
    fn clipping_enabled(&self) -> bool;

    fn fit_to_region(&self, region: PixelRect);

    fn compute_row_span(&self, bottom: i32, top: i32, zoom: f64) -> SpanDecomposition;

    fn compute_column_span(&self, left: i32, right: i32, zoom: f64) -> SpanDecomposition;
}

/// Out-of-band wake-up sent from the render thread to the presentation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationRequest {
    AllocateStorage,
    PresentCached,
    PresentRendered,
}

/// Scratch state of the request in flight, written by the render thread before
/// signaling and read by the presentation thread after waking.
#[derive(Debug, Clone)]
pub struct InterThreadInfo {
    pub texture_rect: TextureRect,
    pub channel_mode: ChannelMode,
    pub pixel_count: usize,
    pub byte_len: usize,
    pub cached_entry: Option<Arc<FrameEntry>>,
    pub rendered_pixels: Option<Arc<[u8]>>,
}

impl InterThreadInfo {
    pub fn for_rect(texture_rect: TextureRect, channel_mode: ChannelMode) -> Self {
        Self {
            texture_rect,
            channel_mode,
            pixel_count: texture_rect.pixel_count(),
            byte_len: texture_rect.byte_len(channel_mode),
            cached_entry: None,
            rendered_pixels: None,
        }
    }

    pub fn with_cached_entry(mut self, entry: Arc<FrameEntry>) -> Self {
        self.cached_entry = Some(entry);
        self
    }

    pub fn with_rendered_pixels(mut self, pixels: Arc<[u8]>) -> Self {
        self.rendered_pixels = Some(pixels);
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PresentationReply {
    Storage(Vec<u8>),
    StorageUnavailable,
    Displayed,
}

/// Display side owned by the presentation thread.
pub trait PresentationSurface: Send {
    /// Destination buffer of exactly `byte_len` bytes, `None` when the display
    /// side cannot provide one.
    fn allocate_storage(&mut self, byte_len: usize) -> Option<Vec<u8>>;

    fn display_cached(&mut self, texture_rect: &TextureRect, entry: &FrameEntry);

    fn display_rendered(
        &mut self,
        texture_rect: &TextureRect,
        channel_mode: ChannelMode,
        pixels: &[u8],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_lookup_respects_bounds() {
        let image = Image::from_fn(PixelRect::new(10, 20, 13, 22), |x, y| {
            [x as f32, y as f32, 0.0, 1.0]
        });
        assert_eq!(image.pixel(12, 21), Some([12.0, 21.0, 0.0, 1.0]));
        assert_eq!(image.pixel(13, 21), None);
        assert_eq!(image.pixel(10, 19), None);
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
        observer.reset();
        assert!(!token.is_cancelled());
    }
}
