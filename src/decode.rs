//! Decoders: raw bytes → pixel buffers
//!
//! A [`Decoder`] turns fetched bytes into an RGBA8 [`PixelBuffer`] sized to
//! the request's size policy. Decoders are selected by sniffing the content
//! signature of the fetched data, never the URI extension: a PNG served as
//! `photo.jpg` still decodes as PNG.
//!
//! Sample-size selection keeps decoding from over-allocating when the
//! target is smaller than the source: the decoder picks the largest
//! power-of-two divisor that still satisfies the request's precision, and
//! only then applies the exact resize/crop dictated by precision and scale.

use crate::error::{DecodeError, Result};
use crate::fetch::FetchResult;
use crate::image::{PixelBuffer, Size};
use crate::pool::BitmapPool;
use crate::request::{ImageRequest, Precision, Scale, SizePolicy};
use image::imageops;
use std::sync::Arc;

/// Decode output: final pixels plus how they were derived.
#[derive(Debug)]
pub struct DecodeResult {
  pub pixels: PixelBuffer,
  /// Source dimensions before sampling.
  pub intrinsic_size: Size,
  /// Power-of-two divisor applied during decode.
  pub sample_size: u32,
}

/// Produces pixels from the fetch result it was created with.
pub trait Decoder: Send {
  fn decode(&self) -> Result<DecodeResult>;
}

/// Creates a [`Decoder`] when the fetched data's content signature is in
/// this factory's territory; `None` otherwise.
pub trait DecoderFactory: Send + Sync {
  fn create(&self, request: &ImageRequest, fetched: &FetchResult) -> Option<Box<dyn Decoder>>;

  /// Stable identity built from type name + construction parameters.
  fn component_key(&self) -> String;
}

/// Dimension/pixel-count ceilings applied before allocating a decode.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
  /// Maximum allowed width or height. `0` disables the limit.
  pub max_dimension: u32,
  /// Maximum decoded pixel count (width * height). `0` disables the limit.
  pub max_pixels: u64,
}

impl Default for DecodeLimits {
  fn default() -> Self {
    Self {
      max_dimension: 32768,
      max_pixels: 100_000_000,
    }
  }
}

/// Choose the power-of-two sample size for decoding `source` towards
/// `target`.
///
/// For `Precision::LessPixels` the divisor is chosen by area, so the result
/// may dip below the target in one dimension if that roughly halves memory.
/// For the stricter precisions the sampled dimensions never undershoot the
/// target.
pub fn calculate_sample_size(source: Size, target: Size, precision: Precision) -> u32 {
  if target.is_empty() || source.is_empty() {
    return 1;
  }
  if source.width <= target.width && source.height <= target.height {
    return 1;
  }

  let mut sample = 1u32;
  loop {
    let next = sample * 2;
    let sampled_w = source.width / next;
    let sampled_h = source.height / next;
    let fits = match precision {
      Precision::LessPixels => {
        sampled_w as u64 * sampled_h as u64 >= target.width as u64 * target.height as u64
      }
      Precision::SameAspectRatio | Precision::Exactly => {
        sampled_w >= target.width && sampled_h >= target.height
      }
    };
    if !fits || next > 1 << 16 {
      return sample;
    }
    sample = next;
  }
}

// ============================================================================
// BitmapDecoder
// ============================================================================

/// Decoder for raster formats supported by the `image` crate.
pub struct BitmapDecoder {
  uri: String,
  size: SizePolicy,
  precision: Precision,
  scale: Scale,
  fetched: FetchResult,
  format: image::ImageFormat,
  limits: DecodeLimits,
  pool: Option<Arc<BitmapPool>>,
}

impl BitmapDecoder {
  /// Final target dimensions for a sampled image, per precision/scale.
  fn plan_output(&self, sampled: Size, target: Size) -> Size {
    match self.precision {
      // Sampled size is already the answer; no exact resize.
      Precision::LessPixels => sampled,
      Precision::SameAspectRatio => fit_within(sampled, target),
      Precision::Exactly => target,
    }
  }

  /// Copy `img` into a pooled buffer when one is available.
  fn into_buffer(&self, img: image::RgbaImage) -> PixelBuffer {
    let (width, height) = img.dimensions();
    if let Some(pool) = &self.pool {
      if let Some(mut buffer) = pool.acquire(width, height) {
        buffer.data_mut().copy_from_slice(img.as_raw());
        return buffer;
      }
    }
    PixelBuffer::from_rgba_image(img)
  }
}

impl Decoder for BitmapDecoder {
  fn decode(&self) -> Result<DecodeResult> {
    let decoded = image::load_from_memory_with_format(self.fetched.data.as_bytes(), self.format)
      .map_err(|e| DecodeError::Failed {
        uri: self.uri.clone(),
        reason: e.to_string(),
      })?;

    let intrinsic = Size::new(decoded.width(), decoded.height());
    if self.limits.max_dimension != 0
      && (intrinsic.width > self.limits.max_dimension
        || intrinsic.height > self.limits.max_dimension)
    {
      return Err(
        DecodeError::TooLarge {
          uri: self.uri.clone(),
          width: intrinsic.width,
          height: intrinsic.height,
        }
        .into(),
      );
    }
    if self.limits.max_pixels != 0
      && intrinsic.width as u64 * intrinsic.height as u64 > self.limits.max_pixels
    {
      return Err(
        DecodeError::TooLarge {
          uri: self.uri.clone(),
          width: intrinsic.width,
          height: intrinsic.height,
        }
        .into(),
      );
    }

    let rgba = decoded.into_rgba8();

    let (pixels, sample_size) = match self.size {
      SizePolicy::Original => (self.into_buffer(rgba), 1),
      SizePolicy::Fixed(target) => {
        let sample_size = calculate_sample_size(intrinsic, target, self.precision);
        let sampled = if sample_size > 1 {
          let sw = (intrinsic.width / sample_size).max(1);
          let sh = (intrinsic.height / sample_size).max(1);
          imageops::resize(&rgba, sw, sh, imageops::FilterType::Triangle)
        } else {
          rgba
        };
        let sampled_size = Size::new(sampled.width(), sampled.height());
        let out_size = self.plan_output(sampled_size, target);

        let out = if out_size == sampled_size {
          sampled
        } else if self.precision == Precision::Exactly && self.scale != Scale::Fill {
          scale_and_crop(&sampled, out_size, self.scale)
        } else {
          imageops::resize(
            &sampled,
            out_size.width.max(1),
            out_size.height.max(1),
            imageops::FilterType::Triangle,
          )
        };
        (self.into_buffer(out), sample_size)
      }
    };

    Ok(DecodeResult {
      pixels,
      intrinsic_size: intrinsic,
      sample_size,
    })
  }
}

/// Largest size fitting inside `target` that keeps `source`'s aspect ratio.
fn fit_within(source: Size, target: Size) -> Size {
  if source.is_empty() || target.is_empty() {
    return source;
  }
  let scale = f64::min(
    target.width as f64 / source.width as f64,
    target.height as f64 / source.height as f64,
  );
  if scale >= 1.0 {
    return source;
  }
  Size::new(
    ((source.width as f64 * scale).round() as u32).max(1),
    ((source.height as f64 * scale).round() as u32).max(1),
  )
}

/// Resize so the target box is covered, then crop the window selected by
/// `scale`.
fn scale_and_crop(img: &image::RgbaImage, target: Size, scale: Scale) -> image::RgbaImage {
  let (w, h) = img.dimensions();
  if w == 0 || h == 0 || target.is_empty() {
    return img.clone();
  }
  let factor = f64::max(
    target.width as f64 / w as f64,
    target.height as f64 / h as f64,
  );
  let scaled_w = ((w as f64 * factor).ceil() as u32).max(target.width);
  let scaled_h = ((h as f64 * factor).ceil() as u32).max(target.height);
  let scaled = imageops::resize(img, scaled_w, scaled_h, imageops::FilterType::Triangle);

  let span = |extent: u32, window: u32| -> u32 {
    let slack = extent.saturating_sub(window);
    match scale {
      Scale::Start => 0,
      Scale::Center | Scale::Fill => slack / 2,
      Scale::End => slack,
    }
  };
  let left = span(scaled_w, target.width);
  let top = span(scaled_h, target.height);
  imageops::crop_imm(&scaled, left, top, target.width, target.height).to_image()
}

/// Factory for [`BitmapDecoder`].
///
/// Applicability is decided by `image::guess_format` over the fetched
/// header bytes, so it accepts any raster format the `image` crate was
/// built with and rejects everything else (including SVG and truncated
/// garbage that has no recognizable signature).
#[derive(Debug, Clone, Default)]
pub struct BitmapDecoderFactory {
  limits: DecodeLimits,
  pool: Option<Arc<BitmapPool>>,
}

impl BitmapDecoderFactory {
  pub fn new(limits: DecodeLimits) -> Self {
    Self { limits, pool: None }
  }

  pub fn with_pool(mut self, pool: Arc<BitmapPool>) -> Self {
    self.pool = Some(pool);
    self
  }
}

impl DecoderFactory for BitmapDecoderFactory {
  fn create(&self, request: &ImageRequest, fetched: &FetchResult) -> Option<Box<dyn Decoder>> {
    let format = image::guess_format(fetched.data.header(32)).ok()?;
    Some(Box::new(BitmapDecoder {
      uri: request.uri().to_string(),
      size: request.size(),
      precision: request.precision(),
      scale: request.scale(),
      fetched: fetched.clone(),
      format,
      limits: self.limits,
      pool: self.pool.clone(),
    }))
  }

  fn component_key(&self) -> String {
    format!(
      "BitmapDecoderFactory(max_dim={},max_px={})",
      self.limits.max_dimension, self.limits.max_pixels
    )
  }
}

// ============================================================================
// Tests
// ============================================================================
