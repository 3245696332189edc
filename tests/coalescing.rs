//! End-to-end coalescing and cancellation scenarios.
//!
//! Uses a gated stub fetcher so tests control exactly when the fetch stage
//! completes, making the in-flight windows deterministic.

use imagepipe::error::Error;
use imagepipe::fetch::{DataSource, FetchResult, Fetcher, FetcherFactory};
use imagepipe::image::DataFrom;
use imagepipe::loader::ImageLoader;
use imagepipe::request::{ImageRequest, Target};
use imagepipe::ImageResult;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
  let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
  let mut out = std::io::Cursor::new(Vec::new());
  image::DynamicImage::ImageRgba8(img)
    .write_to(&mut out, image::ImageFormat::Png)
    .expect("encode png");
  out.into_inner()
}

/// Fetcher whose `fetch` blocks until the shared gate opens.
struct GatedFetcher {
  bytes: Vec<u8>,
  fetches: Arc<AtomicUsize>,
  gate: Arc<(Mutex<bool>, Condvar)>,
}

impl Fetcher for GatedFetcher {
  fn fetch(&self) -> imagepipe::Result<FetchResult> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let (lock, cv) = &*self.gate;
    let mut open = lock.lock().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !*open {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        panic!("test gate never opened");
      }
      let (next, _) = cv.wait_timeout(open, remaining).unwrap();
      open = next;
    }
    Ok(FetchResult::new(
      DataSource::new(self.bytes.clone()),
      Some("image/png".to_string()),
      DataFrom::Network,
    ))
  }
}

struct GatedFetcherFactory {
  bytes: Vec<u8>,
  fetches: Arc<AtomicUsize>,
  gate: Arc<(Mutex<bool>, Condvar)>,
}

impl GatedFetcherFactory {
  fn new(bytes: Vec<u8>) -> (Self, Arc<AtomicUsize>, Arc<(Mutex<bool>, Condvar)>) {
    let fetches = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    (
      Self {
        bytes,
        fetches: Arc::clone(&fetches),
        gate: Arc::clone(&gate),
      },
      fetches,
      gate,
    )
  }
}

impl FetcherFactory for GatedFetcherFactory {
  fn create(&self, request: &ImageRequest) -> Option<Arc<dyn Fetcher>> {
    request.uri().starts_with("test://").then(|| {
      Arc::new(GatedFetcher {
        bytes: self.bytes.clone(),
        fetches: Arc::clone(&self.fetches),
        gate: Arc::clone(&self.gate),
      }) as Arc<dyn Fetcher>
    })
  }

  fn component_key(&self) -> String {
    "GatedFetcherFactory".to_string()
  }
}

fn open_gate(gate: &Arc<(Mutex<bool>, Condvar)>) {
  let (lock, cv) = &**gate;
  *lock.lock().unwrap() = true;
  cv.notify_all();
}

fn wait_for(fetches: &Arc<AtomicUsize>, expected: usize) {
  let deadline = Instant::now() + Duration::from_secs(10);
  while fetches.load(Ordering::SeqCst) < expected {
    assert!(Instant::now() < deadline, "fetch never started");
    thread::sleep(Duration::from_millis(5));
  }
}

fn gated_loader(bytes: Vec<u8>) -> (ImageLoader, Arc<AtomicUsize>, Arc<(Mutex<bool>, Condvar)>) {
  let (factory, fetches, gate) = GatedFetcherFactory::new(bytes);
  let loader = ImageLoader::builder()
    .with_components(|components| components.add_fetcher(Arc::new(factory)))
    .build();
  (loader, fetches, gate)
}

/// Records which terminal callbacks fired.
#[derive(Default)]
struct RecordingTarget {
  successes: AtomicUsize,
  errors: AtomicUsize,
}

impl Target for RecordingTarget {
  fn on_success(&self, _result: &ImageResult) {
    self.successes.fetch_add(1, Ordering::SeqCst);
  }

  fn on_error(&self, _error: &Error) {
    self.errors.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn concurrent_identical_requests_fetch_once() {
  let (loader, fetches, gate) = gated_loader(png_bytes(8, 8, [1, 2, 3, 255]));
  let loader = Arc::new(loader);

  let first = loader.submit(ImageRequest::new("test://a.png"));
  wait_for(&fetches, 1);

  // These arrive while the first fetch is still blocked in the gate.
  let joiners: Vec<_> = (0..3)
    .map(|_| loader.submit(ImageRequest::new("test://a.png")))
    .collect();
  thread::sleep(Duration::from_millis(100));
  open_gate(&gate);

  let base = first.wait().expect("owner result");
  for handle in &joiners {
    let result = handle.wait().expect("joiner result");
    assert_eq!(
      result.image.pixels().data(),
      base.image.pixels().data(),
      "all subscribers must observe identical pixels"
    );
    assert_eq!(result.data_from, DataFrom::Network);
  }

  assert_eq!(
    fetches.load(Ordering::SeqCst),
    1,
    "exactly one fetch for N concurrent identical requests"
  );
}

#[test]
fn distinct_fingerprints_do_not_coalesce() {
  let (loader, fetches, gate) = gated_loader(png_bytes(8, 8, [0, 0, 0, 255]));
  open_gate(&gate);

  loader.execute(ImageRequest::new("test://a.png")).unwrap();
  loader.execute(ImageRequest::new("test://b.png")).unwrap();
  assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn cancelled_joiner_leaves_execution_running() {
  let (loader, fetches, gate) = gated_loader(png_bytes(8, 8, [9, 9, 9, 255]));
  let joiner_target = Arc::new(RecordingTarget::default());

  let owner = loader.submit(ImageRequest::new("test://a.png"));
  wait_for(&fetches, 1);
  let joiner = loader.submit(
    ImageRequest::new("test://a.png").with_target(Arc::clone(&joiner_target) as Arc<dyn Target>),
  );
  thread::sleep(Duration::from_millis(100));

  joiner.cancel();
  open_gate(&gate);

  assert!(owner.wait().is_ok(), "owner must complete despite joiner cancel");
  assert!(matches!(joiner.wait(), Err(Error::Cancelled)));
  assert_eq!(fetches.load(Ordering::SeqCst), 1);

  // A cancelled subscriber gets neither terminal callback.
  assert_eq!(joiner_target.successes.load(Ordering::SeqCst), 0);
  assert_eq!(joiner_target.errors.load(Ordering::SeqCst), 0);
}

#[test]
fn cancelling_last_subscriber_cancels_execution() {
  let (loader, fetches, gate) = gated_loader(png_bytes(8, 8, [7, 7, 7, 255]));
  let target = Arc::new(RecordingTarget::default());

  let handle = loader.submit(
    ImageRequest::new("test://a.png").with_target(Arc::clone(&target) as Arc<dyn Target>),
  );
  wait_for(&fetches, 1);
  handle.cancel();
  open_gate(&gate);

  assert!(matches!(handle.wait(), Err(Error::Cancelled)));
  assert_eq!(target.successes.load(Ordering::SeqCst), 0);
  assert_eq!(target.errors.load(Ordering::SeqCst), 0);

  // The cancelled execution must not have populated the memory cache.
  let fingerprint = imagepipe::key::fingerprint(&ImageRequest::new("test://a.png"));
  assert!(loader.memory_cache().get(&fingerprint).is_none());

  // A fresh request runs a fresh execution.
  let result = loader.execute(ImageRequest::new("test://a.png")).unwrap();
  assert_eq!(result.data_from, DataFrom::Network);
  assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn second_request_after_completion_hits_memory_cache() {
  let (loader, fetches, gate) = gated_loader(png_bytes(8, 8, [4, 4, 4, 255]));
  open_gate(&gate);

  let first = loader.execute(ImageRequest::new("test://a.png")).unwrap();
  assert_eq!(first.data_from, DataFrom::Network);

  let second = loader.execute(ImageRequest::new("test://a.png")).unwrap();
  assert_eq!(second.data_from, DataFrom::MemoryCache);
  assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn targets_receive_success_callbacks() {
  let (loader, _fetches, gate) = gated_loader(png_bytes(4, 4, [2, 2, 2, 255]));
  open_gate(&gate);
  let target = Arc::new(RecordingTarget::default());

  let handle = loader.submit(
    ImageRequest::new("test://a.png").with_target(Arc::clone(&target) as Arc<dyn Target>),
  );
  handle.wait().expect("success");
  assert_eq!(target.successes.load(Ordering::SeqCst), 1);
  assert_eq!(target.errors.load(Ordering::SeqCst), 0);
}

#[test]
fn fetch_failure_reaches_error_callback() {
  // No registered fetcher accepts this scheme.
  let loader = ImageLoader::builder().build();
  let target = Arc::new(RecordingTarget::default());

  let handle = loader.submit(
    ImageRequest::new("bogus://nope").with_target(Arc::clone(&target) as Arc<dyn Target>),
  );
  let outcome = handle.wait();
  assert!(matches!(outcome, Err(Error::NoApplicableFetcher { .. })));
  assert_eq!(target.errors.load(Ordering::SeqCst), 1);
  assert_eq!(target.successes.load(Ordering::SeqCst), 0);
}
