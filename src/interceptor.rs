//! Interceptor chains
//!
//! Chain-of-responsibility hooks the executor invokes at fixed pipeline
//! points. A [`RequestInterceptor`] wraps the whole engine stage (memory
//! cache, coalescing, fetch, decode); a [`DecodeInterceptor`] wraps just
//! the decode. Either may short-circuit by returning a result without
//! calling `proceed`, or rewrite the downstream result on the way out.
//!
//! The built-in [`TransformationDecodeInterceptor`] runs last-but-one in
//! every decode chain: it lets user interceptors observe the pre-transform
//! decode while guaranteeing the request's transform chain is applied (and
//! recorded) exactly once.

use crate::error::Result;
use crate::image::{ImageResult, ImageValue};
use crate::request::ImageRequest;
use crate::token::{CancellationToken, Stage};
use std::sync::Arc;

/// Hook around the engine stage of request execution.
pub trait RequestInterceptor: Send + Sync {
  fn intercept(&self, chain: &mut RequestInterceptorChain<'_>) -> Result<ImageResult>;
}

/// Hook around the decode stage.
pub trait DecodeInterceptor: Send + Sync {
  fn intercept(&self, chain: &mut DecodeInterceptorChain<'_>) -> Result<ImageValue>;
}

/// Engine callback at the end of a request chain.
pub(crate) type RequestEngine<'a> = dyn FnMut(&ImageRequest) -> Result<ImageResult> + 'a;
/// Engine callback at the end of a decode chain.
pub(crate) type DecodeEngine<'a> = dyn FnMut(&ImageRequest) -> Result<ImageValue> + 'a;

/// Walks the registered request interceptors in order, ending at the
/// executor's engine closure.
pub struct RequestInterceptorChain<'a> {
  request: &'a ImageRequest,
  fingerprint: &'a str,
  token: &'a CancellationToken,
  interceptors: &'a [Arc<dyn RequestInterceptor>],
  index: usize,
  engine: &'a mut RequestEngine<'a>,
}

impl<'a> RequestInterceptorChain<'a> {
  pub(crate) fn new(
    request: &'a ImageRequest,
    fingerprint: &'a str,
    token: &'a CancellationToken,
    interceptors: &'a [Arc<dyn RequestInterceptor>],
    engine: &'a mut RequestEngine<'a>,
  ) -> Self {
    Self {
      request,
      fingerprint,
      token,
      interceptors,
      index: 0,
      engine,
    }
  }

  pub fn request(&self) -> &ImageRequest {
    self.request
  }

  pub fn fingerprint(&self) -> &str {
    self.fingerprint
  }

  pub fn token(&self) -> &CancellationToken {
    self.token
  }

  /// Invoke the next interceptor, or the engine when the chain is spent.
  pub fn proceed(&mut self) -> Result<ImageResult> {
    if self.index < self.interceptors.len() {
      let interceptor = Arc::clone(&self.interceptors[self.index]);
      self.index += 1;
      interceptor.intercept(self)
    } else {
      (self.engine)(self.request)
    }
  }
}

/// Walks the registered decode interceptors in order, ending at the
/// executor's decode closure.
pub struct DecodeInterceptorChain<'a> {
  request: &'a ImageRequest,
  fingerprint: &'a str,
  token: &'a CancellationToken,
  interceptors: &'a [Arc<dyn DecodeInterceptor>],
  index: usize,
  engine: &'a mut DecodeEngine<'a>,
}

impl<'a> DecodeInterceptorChain<'a> {
  pub(crate) fn new(
    request: &'a ImageRequest,
    fingerprint: &'a str,
    token: &'a CancellationToken,
    interceptors: &'a [Arc<dyn DecodeInterceptor>],
    engine: &'a mut DecodeEngine<'a>,
  ) -> Self {
    Self {
      request,
      fingerprint,
      token,
      interceptors,
      index: 0,
      engine,
    }
  }

  pub fn request(&self) -> &ImageRequest {
    self.request
  }

  pub fn fingerprint(&self) -> &str {
    self.fingerprint
  }

  pub fn token(&self) -> &CancellationToken {
    self.token
  }

  pub fn proceed(&mut self) -> Result<ImageValue> {
    if self.index < self.interceptors.len() {
      let interceptor = Arc::clone(&self.interceptors[self.index]);
      self.index += 1;
      interceptor.intercept(self)
    } else {
      (self.engine)(self.request)
    }
  }
}

/// Applies the request's transform chain to the decode output.
///
/// Appended by the executor after all user decode interceptors, so user
/// hooks run against untransformed pixels and transforms cannot be skipped
/// or double-applied. Superseded intermediate buffers are returned to the
/// bitmap pool when one is attached.
#[derive(Default)]
pub struct TransformationDecodeInterceptor {
  pool: Option<Arc<crate::pool::BitmapPool>>,
}

impl TransformationDecodeInterceptor {
  pub fn new(pool: Option<Arc<crate::pool::BitmapPool>>) -> Self {
    Self { pool }
  }
}

impl DecodeInterceptor for TransformationDecodeInterceptor {
  fn intercept(&self, chain: &mut DecodeInterceptorChain<'_>) -> Result<ImageValue> {
    let mut value = chain.proceed()?;
    if chain.request().transformations().is_empty() {
      return Ok(value);
    }

    chain.token().check(Stage::Transforming)?;
    for transformation in chain.request().transformations() {
      let pixels = transformation.transform(value.pixels())?;
      let superseded = value.apply_transformed(pixels, transformation.key());
      if let Some(pool) = &self.pool {
        pool.release(superseded);
      }
    }
    Ok(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use crate::image::{DataFrom, PixelBuffer, Size};
  use crate::transform::BlurTransformation;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  fn test_value() -> ImageValue {
    ImageValue::new(PixelBuffer::new(4, 4), Size::new(4, 4))
  }

  struct ShortCircuit;
  impl RequestInterceptor for ShortCircuit {
    fn intercept(&self, chain: &mut RequestInterceptorChain<'_>) -> Result<ImageResult> {
      Ok(ImageResult {
        image: Arc::new(test_value()),
        fingerprint: chain.fingerprint().to_string(),
        data_from: DataFrom::MemoryCache,
      })
    }
  }

  struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
  }
  impl RequestInterceptor for Recorder {
    fn intercept(&self, chain: &mut RequestInterceptorChain<'_>) -> Result<ImageResult> {
      self.log.lock().unwrap().push(self.label);
      chain.proceed()
    }
  }

  #[test]
  fn empty_chain_reaches_engine() {
    let request = ImageRequest::new("u");
    let token = CancellationToken::new();
    let calls = AtomicUsize::new(0);
    let mut engine = |_: &ImageRequest| {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(ImageResult {
        image: Arc::new(test_value()),
        fingerprint: "f".to_string(),
        data_from: DataFrom::Network,
      })
    };
    let mut chain = RequestInterceptorChain::new(&request, "f", &token, &[], &mut engine);
    assert!(chain.proceed().is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn short_circuit_skips_engine() {
    let request = ImageRequest::new("u");
    let token = CancellationToken::new();
    let interceptors: Vec<Arc<dyn RequestInterceptor>> = vec![Arc::new(ShortCircuit)];
    let mut engine = |_: &ImageRequest| -> Result<ImageResult> {
      panic!("engine must not run after a short-circuit");
    };
    let mut chain =
      RequestInterceptorChain::new(&request, "f", &token, &interceptors, &mut engine);
    let result = chain.proceed().unwrap();
    assert_eq!(result.data_from, DataFrom::MemoryCache);
    assert_eq!(result.fingerprint, "f");
  }

  #[test]
  fn interceptors_run_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let interceptors: Vec<Arc<dyn RequestInterceptor>> = vec![
      Arc::new(Recorder { label: "first", log: Arc::clone(&log) }),
      Arc::new(Recorder { label: "second", log: Arc::clone(&log) }),
    ];
    let request = ImageRequest::new("u");
    let token = CancellationToken::new();
    let mut engine = |_: &ImageRequest| {
      Ok(ImageResult {
        image: Arc::new(test_value()),
        fingerprint: "f".to_string(),
        data_from: DataFrom::Network,
      })
    };
    let mut chain =
      RequestInterceptorChain::new(&request, "f", &token, &interceptors, &mut engine);
    chain.proceed().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
  }

  #[test]
  fn transformation_interceptor_applies_and_records() {
    let request =
      ImageRequest::new("u").with_transformation(Arc::new(BlurTransformation::new(1.0)));
    let token = CancellationToken::new();
    let interceptors: Vec<Arc<dyn DecodeInterceptor>> =
      vec![Arc::new(TransformationDecodeInterceptor::default())];
    let mut engine = |_: &ImageRequest| Ok(test_value());
    let mut chain =
      DecodeInterceptorChain::new(&request, "f", &token, &interceptors, &mut engine);
    let value = chain.proceed().unwrap();
    assert_eq!(value.transformed(), &["blur(1)".to_string()]);
  }

  #[test]
  fn transformation_interceptor_without_transforms_is_identity() {
    let request = ImageRequest::new("u");
    let token = CancellationToken::new();
    let interceptors: Vec<Arc<dyn DecodeInterceptor>> =
      vec![Arc::new(TransformationDecodeInterceptor::default())];
    let mut engine = |_: &ImageRequest| Ok(test_value());
    let mut chain =
      DecodeInterceptorChain::new(&request, "f", &token, &interceptors, &mut engine);
    let value = chain.proceed().unwrap();
    assert!(value.transformed().is_empty());
  }

  #[test]
  fn cancellation_checked_before_transforming() {
    let request =
      ImageRequest::new("u").with_transformation(Arc::new(BlurTransformation::new(1.0)));
    let token = CancellationToken::new();
    token.cancel();
    let interceptors: Vec<Arc<dyn DecodeInterceptor>> =
      vec![Arc::new(TransformationDecodeInterceptor::default())];
    // Decode itself "succeeds"; the transform boundary must still observe
    // the cancellation.
    let mut engine = |_: &ImageRequest| Ok(test_value());
    let mut chain =
      DecodeInterceptorChain::new(&request, "f", &token, &interceptors, &mut engine);
    assert!(matches!(chain.proceed(), Err(Error::Cancelled)));
  }
}
