//! Image requests
//!
//! [`ImageRequest`] is the immutable value describing one load: the URI,
//! the target size policy, the transform chain, and per-cache read/write
//! policies. Requests are cheap to clone and safe to share across threads.
//! Identity for caching purposes is derived from output-affecting fields
//! only (see [`crate::key`]); the delivery target never participates.

use crate::error::Error;
use crate::image::{ImageResult, Size};
use crate::transform::Transformation;
use std::sync::Arc;

/// How the decoded result should be sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
  /// Decode at the source's intrinsic dimensions.
  Original,
  /// Decode towards a target bounding box. Sample-size selection avoids
  /// over-allocating when the source is larger than the target.
  Fixed(Size),
}

impl SizePolicy {
  /// Stable token for cache-key derivation.
  pub fn key_token(&self) -> String {
    match self {
      SizePolicy::Original => "original".to_string(),
      SizePolicy::Fixed(size) => size.to_string(),
    }
  }
}

/// How strictly the result must match the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
  /// The result may be smaller than requested when that saves memory.
  #[default]
  LessPixels,
  /// The result keeps the source aspect ratio but fits the target box.
  SameAspectRatio,
  /// The result is exactly the requested dimensions.
  Exactly,
}

impl Precision {
  pub fn key_token(&self) -> &'static str {
    match self {
      Precision::LessPixels => "less-pixels",
      Precision::SameAspectRatio => "same-aspect-ratio",
      Precision::Exactly => "exactly",
    }
  }
}

/// Which region survives an aspect-changing crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
  Start,
  #[default]
  Center,
  End,
  /// Stretch to fill, ignoring aspect ratio.
  Fill,
}

impl Scale {
  pub fn key_token(&self) -> &'static str {
    match self {
      Scale::Start => "start",
      Scale::Center => "center",
      Scale::End => "end",
      Scale::Fill => "fill",
    }
  }
}

/// Read/write switches for one cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
  pub read: bool,
  pub write: bool,
}

impl CachePolicy {
  pub fn enabled() -> Self {
    Self { read: true, write: true }
  }

  pub fn read_only() -> Self {
    Self { read: true, write: false }
  }

  pub fn write_only() -> Self {
    Self { read: false, write: true }
  }

  pub fn disabled() -> Self {
    Self { read: false, write: false }
  }
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self::enabled()
  }
}

/// Delivery sink for one request, owned by the surrounding GUI layer.
///
/// The executor invokes `on_start` when the request is accepted and exactly
/// one of `on_success`/`on_error` when it reaches a terminal state. A
/// subscriber that cancelled itself receives neither terminal callback.
pub trait Target: Send + Sync {
  /// The request was accepted; a placeholder may be shown.
  fn on_start(&self) {}

  /// The pipeline produced a result for this subscriber.
  fn on_success(&self, result: &ImageResult) {
    let _ = result;
  }

  /// The pipeline failed with a typed error.
  fn on_error(&self, error: &Error) {
    let _ = error;
  }
}

/// Immutable description of one image load.
///
/// # Example
///
/// ```rust,ignore
/// use imagepipe::request::{ImageRequest, SizePolicy, Precision};
/// use imagepipe::image::Size;
///
/// let request = ImageRequest::new("https://example.com/photo.jpg")
///     .with_size(SizePolicy::Fixed(Size::new(200, 200)))
///     .with_precision(Precision::SameAspectRatio);
/// ```
#[derive(Clone)]
pub struct ImageRequest {
  uri: String,
  size: SizePolicy,
  precision: Precision,
  scale: Scale,
  transformations: Vec<Arc<dyn Transformation>>,
  memory_cache: CachePolicy,
  result_cache: CachePolicy,
  target: Option<Arc<dyn Target>>,
}

impl ImageRequest {
  pub fn new(uri: impl Into<String>) -> Self {
    Self {
      uri: uri.into(),
      size: SizePolicy::Original,
      precision: Precision::default(),
      scale: Scale::default(),
      transformations: Vec::new(),
      memory_cache: CachePolicy::enabled(),
      result_cache: CachePolicy::enabled(),
      target: None,
    }
  }

  /// Replace the URI (used by the loader for base-URL resolution).
  pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
    self.uri = uri.into();
    self
  }

  pub fn with_size(mut self, size: SizePolicy) -> Self {
    self.size = size;
    self
  }

  pub fn with_precision(mut self, precision: Precision) -> Self {
    self.precision = precision;
    self
  }

  pub fn with_scale(mut self, scale: Scale) -> Self {
    self.scale = scale;
    self
  }

  /// Append a transformation to the chain. Order is significant and feeds
  /// the cache key.
  pub fn with_transformation(mut self, transformation: Arc<dyn Transformation>) -> Self {
    self.transformations.push(transformation);
    self
  }

  pub fn with_memory_cache(mut self, policy: CachePolicy) -> Self {
    self.memory_cache = policy;
    self
  }

  pub fn with_result_cache(mut self, policy: CachePolicy) -> Self {
    self.result_cache = policy;
    self
  }

  /// Attach a delivery sink. Targets never affect the cache key.
  pub fn with_target(mut self, target: Arc<dyn Target>) -> Self {
    self.target = Some(target);
    self
  }

  pub fn uri(&self) -> &str {
    &self.uri
  }

  pub fn size(&self) -> SizePolicy {
    self.size
  }

  pub fn precision(&self) -> Precision {
    self.precision
  }

  pub fn scale(&self) -> Scale {
    self.scale
  }

  pub fn transformations(&self) -> &[Arc<dyn Transformation>] {
    &self.transformations
  }

  pub fn memory_cache(&self) -> CachePolicy {
    self.memory_cache
  }

  pub fn result_cache(&self) -> CachePolicy {
    self.result_cache
  }

  pub fn target(&self) -> Option<&Arc<dyn Target>> {
    self.target.as_ref()
  }
}

impl std::fmt::Debug for ImageRequest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ImageRequest")
      .field("uri", &self.uri)
      .field("size", &self.size)
      .field("precision", &self.precision)
      .field("scale", &self.scale)
      .field(
        "transformations",
        &self
          .transformations
          .iter()
          .map(|t| t.key())
          .collect::<Vec<_>>(),
      )
      .field("memory_cache", &self.memory_cache)
      .field("result_cache", &self.result_cache)
      .field("has_target", &self.target.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_enable_both_caches() {
    let request = ImageRequest::new("file:///a.png");
    assert_eq!(request.memory_cache(), CachePolicy::enabled());
    assert_eq!(request.result_cache(), CachePolicy::enabled());
    assert_eq!(request.size(), SizePolicy::Original);
  }

  #[test]
  fn builder_methods_apply() {
    let request = ImageRequest::new("file:///a.png")
      .with_size(SizePolicy::Fixed(Size::new(100, 50)))
      .with_precision(Precision::Exactly)
      .with_scale(Scale::Fill)
      .with_memory_cache(CachePolicy::disabled())
      .with_result_cache(CachePolicy::read_only());
    assert_eq!(request.size(), SizePolicy::Fixed(Size::new(100, 50)));
    assert_eq!(request.precision(), Precision::Exactly);
    assert_eq!(request.scale(), Scale::Fill);
    assert!(!request.memory_cache().read);
    assert!(!request.result_cache().write);
  }

  #[test]
  fn size_policy_tokens_are_stable() {
    assert_eq!(SizePolicy::Original.key_token(), "original");
    assert_eq!(SizePolicy::Fixed(Size::new(20, 40)).key_token(), "20x40");
  }

  #[test]
  fn cache_policy_constructors() {
    assert!(CachePolicy::read_only().read);
    assert!(!CachePolicy::read_only().write);
    assert!(CachePolicy::write_only().write);
    assert!(!CachePolicy::write_only().read);
    assert!(!CachePolicy::disabled().read);
  }
}
