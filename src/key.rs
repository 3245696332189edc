//! Cache-key derivation
//!
//! Two identities are derived from a request:
//!
//! - the **fingerprint**: the full cache key, covering every field that
//!   affects the decoded output (uri, size policy, precision, scale, the
//!   ordered transform chain). Used by the memory cache and the in-flight
//!   coalescer.
//! - the **download key**: the uri alone. Raw encoded bytes are independent
//!   of size and transforms, so the persistent result cache keys on this —
//!   a retry with different decode options still skips the network.
//!
//! Two requests with identical output-affecting parameters always produce
//! the same fingerprint; delivery targets and cache policies never
//! participate.

use crate::request::ImageRequest;

/// Build the full cache key for a request.
pub fn fingerprint(request: &ImageRequest) -> String {
  let mut key = String::with_capacity(request.uri().len() + 64);
  key.push_str(request.uri());
  key.push_str("?_size=");
  key.push_str(&request.size().key_token());
  key.push_str("&_precision=");
  key.push_str(request.precision().key_token());
  key.push_str("&_scale=");
  key.push_str(request.scale().key_token());

  if !request.transformations().is_empty() {
    key.push_str("&_transformations=[");
    for (i, transformation) in request.transformations().iter().enumerate() {
      if i > 0 {
        key.push(',');
      }
      key.push_str(&transformation.key());
    }
    key.push(']');
  }

  key
}

/// Build the persistent-cache key for a request's raw encoded bytes.
pub fn download_key(request: &ImageRequest) -> String {
  request.uri().to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::Size;
  use crate::request::{ImageRequest, Precision, Scale, SizePolicy, Target};
  use crate::transform::BlurTransformation;
  use std::sync::Arc;

  struct NoopTarget;
  impl Target for NoopTarget {}

  #[test]
  fn identical_parameters_identical_fingerprint() {
    let a = ImageRequest::new("https://example.com/a.jpg")
      .with_size(SizePolicy::Fixed(Size::new(100, 100)));
    let b = ImageRequest::new("https://example.com/a.jpg")
      .with_size(SizePolicy::Fixed(Size::new(100, 100)));
    assert_eq!(fingerprint(&a), fingerprint(&b));
  }

  #[test]
  fn targets_do_not_affect_fingerprint() {
    let bare = ImageRequest::new("https://example.com/a.jpg");
    let with_target =
      ImageRequest::new("https://example.com/a.jpg").with_target(Arc::new(NoopTarget));
    assert_eq!(fingerprint(&bare), fingerprint(&with_target));
  }

  #[test]
  fn size_changes_fingerprint() {
    let original = ImageRequest::new("https://example.com/a.jpg");
    let sized = ImageRequest::new("https://example.com/a.jpg")
      .with_size(SizePolicy::Fixed(Size::new(64, 64)));
    assert_ne!(fingerprint(&original), fingerprint(&sized));
  }

  #[test]
  fn precision_and_scale_change_fingerprint() {
    let base = ImageRequest::new("u");
    let precise = ImageRequest::new("u").with_precision(Precision::Exactly);
    let scaled = ImageRequest::new("u").with_scale(Scale::Fill);
    assert_ne!(fingerprint(&base), fingerprint(&precise));
    assert_ne!(fingerprint(&base), fingerprint(&scaled));
    assert_ne!(fingerprint(&precise), fingerprint(&scaled));
  }

  #[test]
  fn transform_chain_order_matters() {
    let soft = Arc::new(BlurTransformation::new(2.0));
    let hard = Arc::new(BlurTransformation::new(8.0));
    let a = ImageRequest::new("u")
      .with_transformation(soft.clone())
      .with_transformation(hard.clone());
    let b = ImageRequest::new("u")
      .with_transformation(hard)
      .with_transformation(soft);
    assert_ne!(fingerprint(&a), fingerprint(&b));
  }

  #[test]
  fn transforms_embedded_in_fingerprint() {
    let request =
      ImageRequest::new("u").with_transformation(Arc::new(BlurTransformation::new(4.0)));
    let key = fingerprint(&request);
    assert!(key.contains("_transformations=["), "key: {key}");
    assert!(key.contains("blur(4"), "key: {key}");
  }

  #[test]
  fn download_key_ignores_decode_options() {
    let plain = ImageRequest::new("https://example.com/a.jpg");
    let sized = ImageRequest::new("https://example.com/a.jpg")
      .with_size(SizePolicy::Fixed(Size::new(10, 10)))
      .with_transformation(Arc::new(BlurTransformation::new(1.0)));
    assert_eq!(download_key(&plain), download_key(&sized));
    assert_eq!(download_key(&plain), "https://example.com/a.jpg");
  }
}
