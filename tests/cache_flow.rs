//! Result-cache and pipeline cache-policy scenarios.

use imagepipe::cache::ResultCacheConfig;
use imagepipe::error::{DecodeError, Error};
use imagepipe::fetch::{DataSource, FetchResult, Fetcher, FetcherFactory};
use imagepipe::image::DataFrom;
use imagepipe::loader::ImageLoader;
use imagepipe::request::{CachePolicy, ImageRequest};
use imagepipe::transform::BlurTransformation;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
  let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
  let mut out = std::io::Cursor::new(Vec::new());
  image::DynamicImage::ImageRgba8(img)
    .write_to(&mut out, image::ImageFormat::Png)
    .expect("encode png");
  out.into_inner()
}

/// Counting fetcher serving fixed bytes for `test://` URIs.
struct CountingFetcher {
  bytes: Vec<u8>,
  fetches: Arc<AtomicUsize>,
}

impl Fetcher for CountingFetcher {
  fn fetch(&self) -> imagepipe::Result<FetchResult> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    Ok(FetchResult::new(
      DataSource::new(self.bytes.clone()),
      Some("image/png".to_string()),
      DataFrom::Network,
    ))
  }
}

struct CountingFetcherFactory {
  bytes: Vec<u8>,
  fetches: Arc<AtomicUsize>,
}

impl FetcherFactory for CountingFetcherFactory {
  fn create(&self, request: &ImageRequest) -> Option<Arc<dyn Fetcher>> {
    request.uri().starts_with("test://").then(|| {
      Arc::new(CountingFetcher {
        bytes: self.bytes.clone(),
        fetches: Arc::clone(&self.fetches),
      }) as Arc<dyn Fetcher>
    })
  }

  fn component_key(&self) -> String {
    "CountingFetcherFactory".to_string()
  }
}

fn loader_with(bytes: Vec<u8>, cache_dir: Option<&Path>) -> (ImageLoader, Arc<AtomicUsize>) {
  let fetches = Arc::new(AtomicUsize::new(0));
  let factory = CountingFetcherFactory {
    bytes,
    fetches: Arc::clone(&fetches),
  };
  let mut builder =
    ImageLoader::builder().with_components(|components| components.add_fetcher(Arc::new(factory)));
  if let Some(dir) = cache_dir {
    builder = builder.with_result_cache(dir, ResultCacheConfig::default());
  }
  (builder.build(), fetches)
}

#[test]
fn network_bytes_land_in_result_cache() {
  let tmp = tempfile::tempdir().unwrap();
  let payload = png_bytes(6, 6, [1, 2, 3, 255]);
  let (loader, fetches) = loader_with(payload.clone(), Some(tmp.path()));

  let result = loader.execute(ImageRequest::new("test://a.png")).unwrap();
  assert_eq!(result.data_from, DataFrom::Network);
  assert_eq!(fetches.load(Ordering::SeqCst), 1);

  let cache = loader.result_cache().expect("configured");
  let (cached, meta) = cache.read("test://a.png").expect("raw bytes persisted");
  assert_eq!(cached, payload);
  assert_eq!(meta.content_type.as_deref(), Some("image/png"));
}

#[test]
fn fresh_loader_serves_from_result_cache_without_fetch() {
  let tmp = tempfile::tempdir().unwrap();
  let payload = png_bytes(6, 6, [8, 8, 8, 255]);
  {
    let (loader, _) = loader_with(payload.clone(), Some(tmp.path()));
    loader.execute(ImageRequest::new("test://a.png")).unwrap();
  }

  // New process, empty memory cache, same disk cache.
  let (loader, fetches) = loader_with(payload, Some(tmp.path()));
  let result = loader.execute(ImageRequest::new("test://a.png")).unwrap();
  assert_eq!(result.data_from, DataFrom::ResultCache);
  assert_eq!(fetches.load(Ordering::SeqCst), 0, "disk hit must skip the network");
}

#[test]
fn decode_failure_preserves_fetched_bytes_for_retry() {
  let tmp = tempfile::tempdir().unwrap();
  // Valid PNG signature but truncated body: decoder selection succeeds,
  // decode fails.
  let mut corrupt = png_bytes(16, 16, [1, 1, 1, 255]);
  corrupt.truncate(24);
  let (loader, fetches) = loader_with(corrupt, Some(tmp.path()));

  let first = loader.execute(ImageRequest::new("test://broken.png"));
  assert!(matches!(
    first,
    Err(Error::Decode(DecodeError::Failed { .. }))
  ));
  assert_eq!(fetches.load(Ordering::SeqCst), 1);

  // Retry: raw bytes are already on disk, so only decode re-runs.
  let second = loader.execute(ImageRequest::new("test://broken.png"));
  assert!(matches!(
    second,
    Err(Error::Decode(DecodeError::Failed { .. }))
  ));
  assert_eq!(
    fetches.load(Ordering::SeqCst),
    1,
    "retry after decode failure must skip the fetch"
  );
}

#[test]
fn transform_chain_applies_and_is_cached_separately() {
  let (loader, fetches) = loader_with(png_bytes(12, 12, [50, 60, 70, 255]), None);

  let plain = loader.execute(ImageRequest::new("test://a.png")).unwrap();
  assert!(plain.image.transformed().is_empty());

  let blurred = loader
    .execute(
      ImageRequest::new("test://a.png").with_transformation(Arc::new(BlurTransformation::new(2.0))),
    )
    .unwrap();
  assert_eq!(blurred.image.transformed(), &["blur(2)".to_string()]);
  assert_ne!(plain.fingerprint, blurred.fingerprint);

  // Same uri: raw-bytes identity is shared, but decoded results are cached
  // under distinct fingerprints; with no disk cache both fetch.
  assert_eq!(fetches.load(Ordering::SeqCst), 2);

  let blurred_again = loader
    .execute(
      ImageRequest::new("test://a.png").with_transformation(Arc::new(BlurTransformation::new(2.0))),
    )
    .unwrap();
  assert_eq!(blurred_again.data_from, DataFrom::MemoryCache);
  assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn disabled_memory_cache_refetches() {
  let (loader, fetches) = loader_with(png_bytes(4, 4, [1, 1, 1, 255]), None);
  let request = || {
    ImageRequest::new("test://a.png").with_memory_cache(CachePolicy::disabled())
  };
  loader.execute(request()).unwrap();
  loader.execute(request()).unwrap();
  assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn write_only_memory_cache_populates_for_readers() {
  let (loader, fetches) = loader_with(png_bytes(4, 4, [1, 1, 1, 255]), None);
  loader
    .execute(ImageRequest::new("test://a.png").with_memory_cache(CachePolicy::write_only()))
    .unwrap();
  // A default request with the same fingerprint now reads the stored value.
  let hit = loader.execute(ImageRequest::new("test://a.png")).unwrap();
  assert_eq!(hit.data_from, DataFrom::MemoryCache);
  assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn disabled_result_cache_writes_nothing() {
  let tmp = tempfile::tempdir().unwrap();
  let (loader, _fetches) = loader_with(png_bytes(4, 4, [1, 1, 1, 255]), Some(tmp.path()));
  loader
    .execute(ImageRequest::new("test://a.png").with_result_cache(CachePolicy::disabled()))
    .unwrap();
  assert!(loader.result_cache().unwrap().read("test://a.png").is_none());
}

#[test]
fn decoded_result_is_sized_to_request() {
  use imagepipe::image::Size;
  use imagepipe::request::{Precision, SizePolicy};

  let (loader, _fetches) = loader_with(png_bytes(64, 64, [5, 5, 5, 255]), None);
  let result = loader
    .execute(
      ImageRequest::new("test://big.png")
        .with_size(SizePolicy::Fixed(Size::new(16, 16)))
        .with_precision(Precision::Exactly),
    )
    .unwrap();
  assert_eq!(result.image.size(), Size::new(16, 16));
  assert_eq!(result.image.intrinsic_size(), Size::new(64, 64));
}
