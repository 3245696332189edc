//! Decoded image payloads
//!
//! [`PixelBuffer`] is the owned RGBA8 pixel store produced by decoders and
//! consumed by transformations. [`ImageValue`] wraps a buffer with its
//! provenance (intrinsic source size, applied-transform markers) and is the
//! unit stored in the memory cache. [`ImageResult`] is what the pipeline
//! delivers to subscribers.

use std::sync::Arc;

/// Integer pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
  pub width: u32,
  pub height: u32,
}

impl Size {
  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }
}

impl std::fmt::Display for Size {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

/// Where a delivered result came from.
///
/// Joined subscribers observe the executing request's provenance, so N
/// coalesced requests for the same fingerprint all report e.g. `Network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFrom {
  /// Served from the decoded-image memory cache
  MemoryCache,
  /// Raw bytes served from the persistent result cache
  ResultCache,
  /// Fetched over the network
  Network,
  /// Read from local storage (file:// or data: URIs)
  Local,
}

/// Owned RGBA8 pixel buffer.
///
/// `data` is tightly packed, `width * height * 4` bytes, row-major. Buffers
/// may originate from the [`crate::pool::BitmapPool`]; `pool_id` identifies
/// a pooled allocation so it can be checked back in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
  width: u32,
  height: u32,
  data: Vec<u8>,
  pub(crate) pool_id: Option<u64>,
}

impl PixelBuffer {
  /// Create a zero-filled buffer.
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      data: vec![0; width as usize * height as usize * 4],
      pool_id: None,
    }
  }

  /// Wrap an existing RGBA8 byte vector. The vector is truncated or
  /// zero-extended to exactly `width * height * 4` bytes.
  pub fn from_vec(width: u32, height: u32, mut data: Vec<u8>) -> Self {
    data.resize(width as usize * height as usize * 4, 0);
    Self {
      width,
      height,
      data,
      pool_id: None,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn size(&self) -> Size {
    Size::new(self.width, self.height)
  }

  /// Total payload size in bytes, used for cache accounting.
  pub fn byte_size(&self) -> u64 {
    self.data.len() as u64
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn data_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  /// Consume the buffer, returning the raw byte vector (drops pool identity).
  pub fn into_vec(self) -> Vec<u8> {
    self.data
  }

  /// View as an `image` crate buffer for decoding/transform kernels.
  pub fn to_rgba_image(&self) -> image::RgbaImage {
    image::RgbaImage::from_vec(self.width, self.height, self.data.clone())
      .unwrap_or_else(|| image::RgbaImage::new(self.width, self.height))
  }

  /// Build from an `image` crate buffer.
  pub fn from_rgba_image(img: image::RgbaImage) -> Self {
    let (width, height) = img.dimensions();
    Self {
      width,
      height,
      data: img.into_raw(),
      pool_id: None,
    }
  }
}

/// A decoded image plus provenance, as stored in the memory cache.
///
/// `transformed` lists the marker string of every transformation applied,
/// in application order; it feeds debugging output and lets callers verify
/// cache-key consistency.
#[derive(Debug, Clone)]
pub struct ImageValue {
  pixels: PixelBuffer,
  /// Source dimensions before any sampling or resizing.
  intrinsic_size: Size,
  /// Marker strings recorded by applied transformations, in order.
  transformed: Vec<String>,
  shareable: bool,
}

impl ImageValue {
  pub fn new(pixels: PixelBuffer, intrinsic_size: Size) -> Self {
    Self {
      pixels,
      intrinsic_size,
      transformed: Vec::new(),
      shareable: true,
    }
  }

  /// Mark the payload as unsafe to hand to multiple consumers by reference.
  /// The memory cache deep-copies non-shareable values on every `get`.
  pub fn with_shareable(mut self, shareable: bool) -> Self {
    self.shareable = shareable;
    self
  }

  pub fn pixels(&self) -> &PixelBuffer {
    &self.pixels
  }

  pub fn into_pixels(self) -> PixelBuffer {
    self.pixels
  }

  pub fn size(&self) -> Size {
    self.pixels.size()
  }

  pub fn intrinsic_size(&self) -> Size {
    self.intrinsic_size
  }

  pub fn byte_size(&self) -> u64 {
    self.pixels.byte_size()
  }

  pub fn is_shareable(&self) -> bool {
    self.shareable
  }

  pub fn transformed(&self) -> &[String] {
    &self.transformed
  }

  /// Record that a transformation ran, replacing the pixel payload.
  /// Returns the superseded buffer so the caller can recycle it.
  pub fn apply_transformed(&mut self, pixels: PixelBuffer, marker: String) -> PixelBuffer {
    let previous = std::mem::replace(&mut self.pixels, pixels);
    self.transformed.push(marker);
    previous
  }

  /// Independent copy of the payload (used for non-shareable cache hits
  /// and copy-on-write mutation of shared values).
  pub fn deep_copy(&self) -> Self {
    let mut pixels = self.pixels.clone();
    pixels.pool_id = None;
    Self {
      pixels,
      intrinsic_size: self.intrinsic_size,
      transformed: self.transformed.clone(),
      shareable: self.shareable,
    }
  }
}

/// Terminal success value delivered to every subscriber of a request.
#[derive(Debug, Clone)]
pub struct ImageResult {
  pub image: Arc<ImageValue>,
  /// Full cache key the result was stored under.
  pub fingerprint: String,
  pub data_from: DataFrom,
}
