//! Cache identity and storage types for rendered viewer frames.
//!
//! A [`FrameKey`] names one fully specified viewer request; a [`FrameEntry`]
//! is the immutable pixel buffer stored under that key.

mod rect;

use std::fmt;

pub use rect::{INFINITE_COORD, PixelRect};

/// Frame buffers are always RGBA, row-major.
pub const CHANNEL_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    /// 8-bit unsigned channels.
    Byte,
    /// 32-bit float channels, little endian.
    Float,
}

impl ChannelMode {
    pub const fn bytes_per_channel(self) -> usize {
        match self {
            ChannelMode::Byte => 1,
            ChannelMode::Float => 4,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        CHANNEL_COUNT * self.bytes_per_channel()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LutMode {
    Linear,
    Srgb,
    Rec709,
}

/// Display parameters sampled from the display backend once per request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayParams {
    pub zoom: f64,
    pub exposure: f64,
    pub lut: LutMode,
    pub channel_mode: ChannelMode,
    pub pixel_aspect: f64,
}

impl Default for DisplayParams {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            exposure: 0.0,
            lut: LutMode::Srgb,
            channel_mode: ChannelMode::Byte,
            pixel_aspect: 1.0,
        }
    }
}

/// Rendered sub-region in image space (`x`, `y`, `right`, `top`) and in tile
/// space (`w` columns by `h` rows), sampled every `step` image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRect {
    pub x: i32,
    pub y: i32,
    pub right: i32,
    pub top: i32,
    pub w: u32,
    pub h: u32,
    pub step: u32,
}

impl TextureRect {
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.w as usize * self.h as usize
    }

    pub fn byte_len(&self, mode: ChannelMode) -> usize {
        self.pixel_count()
            .checked_mul(mode.bytes_per_pixel())
            .expect("texture byte length overflow")
    }

    pub fn row_byte_len(&self, mode: ChannelMode) -> usize {
        self.w as usize * mode.bytes_per_pixel()
    }
}

/// Cache identity of one viewer render request.
///
/// Float parameters are stored as raw bit patterns so that equality and
/// hashing are exact: `0.0` and `-0.0` are different keys, a NaN zoom equals
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    time: i64,
    view: u32,
    graph_hash: u64,
    zoom_bits: u64,
    exposure_bits: u64,
    lut: LutMode,
    channel_mode: ChannelMode,
    region_of_definition: PixelRect,
    display_window: PixelRect,
    texture_rect: TextureRect,
}

impl FrameKey {
    pub fn new(
        time: i64,
        view: u32,
        graph_hash: u64,
        params: &DisplayParams,
        region_of_definition: PixelRect,
        display_window: PixelRect,
        texture_rect: TextureRect,
    ) -> Self {
        Self {
            time,
            view,
            graph_hash,
            zoom_bits: params.zoom.to_bits(),
            exposure_bits: params.exposure.to_bits(),
            lut: params.lut,
            channel_mode: params.channel_mode,
            region_of_definition,
            display_window,
            texture_rect,
        }
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn view(&self) -> u32 {
        self.view
    }

    pub fn graph_hash(&self) -> u64 {
        self.graph_hash
    }

    pub fn zoom(&self) -> f64 {
        f64::from_bits(self.zoom_bits)
    }

    pub fn exposure(&self) -> f64 {
        f64::from_bits(self.exposure_bits)
    }

    pub fn lut(&self) -> LutMode {
        self.lut
    }

    pub fn channel_mode(&self) -> ChannelMode {
        self.channel_mode
    }

    pub fn region_of_definition(&self) -> PixelRect {
        self.region_of_definition
    }

    pub fn display_window(&self) -> PixelRect {
        self.display_window
    }

    pub fn texture_rect(&self) -> TextureRect {
        self.texture_rect
    }

    /// Byte size of the frame buffer this key describes.
    pub fn expected_byte_len(&self) -> usize {
        self.texture_rect.byte_len(self.channel_mode)
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "frame(t={}, view={}, graph={:016x}, zoom={}, {}x{})",
            self.time,
            self.view,
            self.graph_hash,
            self.zoom(),
            self.texture_rect.w,
            self.texture_rect.h
        )
    }
}

/// Immutable rendered viewer frame as stored in the display cache.
#[derive(Debug)]
pub struct FrameEntry {
    key: FrameKey,
    data_window: PixelRect,
    display_window: PixelRect,
    pixels: Box<[u8]>,
}

impl FrameEntry {
    pub fn new(
        key: FrameKey,
        data_window: PixelRect,
        display_window: PixelRect,
        pixels: Box<[u8]>,
    ) -> Self {
        assert_eq!(
            pixels.len(),
            key.expected_byte_len(),
            "frame entry byte length must match the key's texture rect and channel mode"
        );
        Self {
            key,
            data_window,
            display_window,
            pixels,
        }
    }

    pub fn key(&self) -> &FrameKey {
        &self.key
    }

    pub fn data_window(&self) -> PixelRect {
        self.data_window
    }

    pub fn display_window(&self) -> PixelRect {
        self.display_window
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}
