//! Pixel transformations
//!
//! A [`Transformation`] rewrites a decoded buffer and contributes a stable
//! key to the request fingerprint. Transformations run in request order
//! during the pipeline's transform stage, after decode; each application is
//! recorded in the result's `transformed` provenance list.
//!
//! The kernels here are thin wrappers over `image::imageops`; anything
//! platform-accelerated belongs in the host application, registered through
//! the same trait.

use crate::error::{Result, TransformError};
use crate::image::PixelBuffer;
use image::imageops;

/// One stage of a request's transform chain.
///
/// # Contract
///
/// `key()` must be stable across program runs for identical construction
/// parameters — it is embedded in cache fingerprints. `transform` returns a
/// new buffer; it must not assume exclusive ownership of the input.
pub trait Transformation: Send + Sync {
  /// Stable identity for cache keys and provenance markers.
  fn key(&self) -> String;

  /// Apply the transformation.
  fn transform(&self, input: &PixelBuffer) -> Result<PixelBuffer>;
}

/// Gaussian blur.
#[derive(Debug, Clone, Copy)]
pub struct BlurTransformation {
  sigma: f32,
}

impl BlurTransformation {
  pub fn new(sigma: f32) -> Self {
    Self { sigma }
  }
}

impl Transformation for BlurTransformation {
  fn key(&self) -> String {
    format!("blur({})", self.sigma)
  }

  fn transform(&self, input: &PixelBuffer) -> Result<PixelBuffer> {
    if !self.sigma.is_finite() || self.sigma <= 0.0 {
      return Err(
        TransformError::Failed {
          key: self.key(),
          reason: format!("invalid sigma {}", self.sigma),
        }
        .into(),
      );
    }
    let blurred = imageops::blur(&input.to_rgba_image(), self.sigma);
    Ok(PixelBuffer::from_rgba_image(blurred))
  }
}

/// Rounded rectangle corners: pixels outside the corner radii become
/// transparent.
#[derive(Debug, Clone, Copy)]
pub struct RoundedCornersTransformation {
  radius: u32,
}

impl RoundedCornersTransformation {
  pub fn new(radius: u32) -> Self {
    Self { radius }
  }
}

impl Transformation for RoundedCornersTransformation {
  fn key(&self) -> String {
    format!("rounded-corners({})", self.radius)
  }

  fn transform(&self, input: &PixelBuffer) -> Result<PixelBuffer> {
    let width = input.width();
    let height = input.height();
    let radius = self.radius.min(width / 2).min(height / 2);
    let mut out = input.clone();
    out.pool_id = None;
    if radius == 0 {
      return Ok(out);
    }

    let r = radius as i64;
    // Corner centers in pixel coordinates.
    let centers = [
      (r - 1, r - 1),
      (width as i64 - r, r - 1),
      (r - 1, height as i64 - r),
      (width as i64 - r, height as i64 - r),
    ];
    let data = out.data_mut();
    for y in 0..height as i64 {
      for x in 0..width as i64 {
        let in_corner_band = (x < r || x >= width as i64 - r) && (y < r || y >= height as i64 - r);
        if !in_corner_band {
          continue;
        }
        let inside = centers.iter().any(|&(cx, cy)| {
          let dx = x - cx;
          let dy = y - cy;
          dx * dx + dy * dy <= r * r
        });
        if !inside {
          let idx = (y as usize * width as usize + x as usize) * 4;
          data[idx + 3] = 0;
        }
      }
    }
    Ok(out)
  }
}

/// Center-crop to a square, then mask everything outside the inscribed
/// circle to transparent.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircleCropTransformation;

impl CircleCropTransformation {
  pub fn new() -> Self {
    Self
  }
}

impl Transformation for CircleCropTransformation {
  fn key(&self) -> String {
    "circle-crop".to_string()
  }

  fn transform(&self, input: &PixelBuffer) -> Result<PixelBuffer> {
    let side = input.width().min(input.height());
    if side == 0 {
      return Err(
        TransformError::Failed {
          key: self.key(),
          reason: "empty input buffer".to_string(),
        }
        .into(),
      );
    }
    let left = (input.width() - side) / 2;
    let top = (input.height() - side) / 2;
    let square = imageops::crop_imm(&input.to_rgba_image(), left, top, side, side).to_image();

    let mut out = PixelBuffer::from_rgba_image(square);
    let center = (side as f64 - 1.0) / 2.0;
    let radius = side as f64 / 2.0;
    let data = out.data_mut();
    for y in 0..side {
      for x in 0..side {
        let dx = x as f64 - center;
        let dy = y as f64 - center;
        if dx * dx + dy * dy > radius * radius {
          let idx = (y as usize * side as usize + x as usize) * 4;
          data[idx + 3] = 0;
        }
      }
    }
    Ok(out)
  }
}
