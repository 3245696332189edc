//! ImageLoader: the crate's front door
//!
//! Wires the component registry, caches, bitmap pool, and worker pools
//! into one [`RequestExecutor`] and exposes two entry points:
//!
//! - [`ImageLoader::execute`]: run a request to completion on the calling
//!   thread (decode still hops to the CPU pool).
//! - [`ImageLoader::submit`]: dispatch to the I/O pool and return a
//!   [`RequestHandle`] carrying the request's cancellation token.
//!
//! A loader is constructed once (via [`ImageLoaderBuilder`]) and shared by
//! reference; there is no ambient global instance.
//!
//! # Example
//!
//! ```rust,no_run
//! # use imagepipe::loader::ImageLoader;
//! # use imagepipe::request::ImageRequest;
//! # fn main() -> imagepipe::Result<()> {
//! let loader = ImageLoader::builder().build();
//! let result = loader.execute(ImageRequest::new("https://example.com/photo.jpg"))?;
//! println!("{}", result.image.size());
//! # Ok(())
//! # }
//! ```

use crate::cache::{MemoryCache, ResultCache, ResultCacheConfig};
use crate::decode::{BitmapDecoderFactory, DecodeLimits};
use crate::error::{Error, Result};
use crate::executor::RequestExecutor;
use crate::fetch::{
  resolve_uri, Base64UriFetcherFactory, FileUriFetcherFactory, HttpFetcherOptions,
  HttpUriFetcherFactory,
};
use crate::image::ImageResult;
use crate::pool::BitmapPool;
use crate::registry::{ComponentRegistry, ComponentRegistryBuilder};
use crate::request::ImageRequest;
use crate::token::CancellationToken;
use crate::worker::WorkerPool;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};

/// Configures and builds an [`ImageLoader`].
pub struct ImageLoaderBuilder {
  components: ComponentRegistryBuilder,
  memory_cache_max_bytes: u64,
  result_cache_dir: Option<PathBuf>,
  result_cache_config: ResultCacheConfig,
  bitmap_pool_max_bytes: u64,
  http_options: HttpFetcherOptions,
  decode_limits: DecodeLimits,
  base_url: Option<String>,
  io_threads: usize,
  cpu_threads: usize,
}

impl Default for ImageLoaderBuilder {
  fn default() -> Self {
    Self {
      components: ComponentRegistry::builder(),
      memory_cache_max_bytes: 128 * 1024 * 1024,
      result_cache_dir: None,
      result_cache_config: ResultCacheConfig::default(),
      bitmap_pool_max_bytes: 32 * 1024 * 1024,
      http_options: HttpFetcherOptions::default(),
      decode_limits: DecodeLimits::default(),
      base_url: None,
      io_threads: 4,
      cpu_threads: std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2),
    }
  }
}

impl ImageLoaderBuilder {
  /// Register user components. Built-in fetchers/decoders are appended
  /// after these, so user registrations take precedence.
  pub fn with_components(
    mut self,
    configure: impl FnOnce(ComponentRegistryBuilder) -> ComponentRegistryBuilder,
  ) -> Self {
    self.components = configure(self.components);
    self
  }

  /// Byte budget for the decoded-image memory cache.
  pub fn with_memory_cache_max_bytes(mut self, max_bytes: u64) -> Self {
    self.memory_cache_max_bytes = max_bytes;
    self
  }

  /// Enable the persistent result cache rooted at `dir`.
  pub fn with_result_cache(mut self, dir: impl Into<PathBuf>, config: ResultCacheConfig) -> Self {
    self.result_cache_dir = Some(dir.into());
    self.result_cache_config = config;
    self
  }

  /// Byte budget for pooled decode buffers. `0` disables pooling.
  pub fn with_bitmap_pool_max_bytes(mut self, max_bytes: u64) -> Self {
    self.bitmap_pool_max_bytes = max_bytes;
    self
  }

  pub fn with_http_options(mut self, options: HttpFetcherOptions) -> Self {
    self.http_options = options;
    self
  }

  pub fn with_decode_limits(mut self, limits: DecodeLimits) -> Self {
    self.decode_limits = limits;
    self
  }

  /// Base URL for resolving relative request URIs.
  pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
    self.base_url = Some(base_url.into());
    self
  }

  pub fn with_io_threads(mut self, threads: usize) -> Self {
    self.io_threads = threads.max(1);
    self
  }

  pub fn with_cpu_threads(mut self, threads: usize) -> Self {
    self.cpu_threads = threads.max(1);
    self
  }

  pub fn build(self) -> ImageLoader {
    let bitmap_pool = (self.bitmap_pool_max_bytes > 0)
      .then(|| Arc::new(BitmapPool::new(self.bitmap_pool_max_bytes)));

    let mut bitmap_decoder = BitmapDecoderFactory::new(self.decode_limits);
    if let Some(pool) = &bitmap_pool {
      bitmap_decoder = bitmap_decoder.with_pool(Arc::clone(pool));
    }

    let registry = self
      .components
      .add_fetcher(Arc::new(HttpUriFetcherFactory::new(self.http_options)))
      .add_fetcher(Arc::new(FileUriFetcherFactory))
      .add_fetcher(Arc::new(Base64UriFetcherFactory))
      .add_decoder(Arc::new(bitmap_decoder))
      .build();

    let mut memory_cache = MemoryCache::new(self.memory_cache_max_bytes);
    if let Some(pool) = &bitmap_pool {
      memory_cache = memory_cache.with_pool(Arc::clone(pool));
    }
    let memory_cache = Arc::new(memory_cache);
    let result_cache = self
      .result_cache_dir
      .map(|dir| Arc::new(ResultCache::open(dir, self.result_cache_config)));

    let cpu_pool = Arc::new(WorkerPool::new("imagepipe-cpu", self.cpu_threads));
    let io_pool = Arc::new(WorkerPool::new("imagepipe-io", self.io_threads));

    let executor = Arc::new(RequestExecutor::new(
      registry,
      memory_cache,
      result_cache,
      Some(cpu_pool),
      bitmap_pool.clone(),
    ));

    ImageLoader {
      executor,
      io_pool,
      bitmap_pool,
      base_url: self.base_url,
    }
  }
}

/// Shared image-loading engine. Construct once, pass by reference.
pub struct ImageLoader {
  executor: Arc<RequestExecutor>,
  io_pool: Arc<WorkerPool>,
  bitmap_pool: Option<Arc<BitmapPool>>,
  base_url: Option<String>,
}

impl ImageLoader {
  pub fn builder() -> ImageLoaderBuilder {
    ImageLoaderBuilder::default()
  }

  pub fn memory_cache(&self) -> &Arc<MemoryCache> {
    self.executor.memory_cache()
  }

  pub fn result_cache(&self) -> Option<&Arc<ResultCache>> {
    self.executor.result_cache()
  }

  pub fn registry(&self) -> &ComponentRegistry {
    self.executor.registry()
  }

  pub fn bitmap_pool(&self) -> Option<&Arc<BitmapPool>> {
    self.bitmap_pool.as_ref()
  }

  /// Number of fingerprints currently executing (diagnostics).
  pub fn in_flight(&self) -> usize {
    self.executor.in_flight()
  }

  /// Resolve the request URI against the configured base URL.
  fn resolve_request(&self, request: ImageRequest) -> ImageRequest {
    let resolved = resolve_uri(self.base_url.as_deref(), request.uri());
    if resolved == request.uri() {
      request
    } else {
      request.with_uri(resolved)
    }
  }

  /// Run a request to completion on the calling thread.
  ///
  /// Target callbacks (if a target is attached) fire on this thread.
  pub fn execute(&self, request: ImageRequest) -> Result<ImageResult> {
    let request = self.resolve_request(request);
    let token = CancellationToken::new();
    if let Some(target) = request.target() {
      target.on_start();
    }
    let outcome = self.executor.execute(&request, &token);
    deliver(&request, &outcome);
    outcome
  }

  /// Dispatch a request to the worker pools.
  ///
  /// `on_start` fires on the calling thread before dispatch. Terminal
  /// callbacks fire on the worker that completed the request. Cancelling
  /// the returned handle detaches this subscriber; the underlying
  /// execution keeps running while other subscribers remain.
  pub fn submit(&self, request: ImageRequest) -> RequestHandle {
    let request = self.resolve_request(request);
    let token = CancellationToken::new();
    if let Some(target) = request.target() {
      target.on_start();
    }

    let (tx, rx) = mpsc::channel();
    let executor = Arc::clone(&self.executor);
    let job_token = token.clone();
    self.io_pool.execute(move || {
      let outcome = executor.execute(&request, &job_token);
      deliver(&request, &outcome);
      let _ = tx.send(outcome);
    });

    RequestHandle {
      token,
      state: Mutex::new(HandleState::Pending(rx)),
    }
  }
}

/// Invoke the request's target for a terminal outcome.
///
/// A subscriber that cancelled gets neither callback: cancellation is a
/// distinct terminal state, not an error.
fn deliver(request: &ImageRequest, outcome: &Result<ImageResult>) {
  let Some(target) = request.target() else {
    return;
  };
  match outcome {
    Ok(result) => target.on_success(result),
    Err(Error::Cancelled) => {}
    Err(error) => target.on_error(error),
  }
}

/// Live handle to a submitted request.
pub struct RequestHandle {
  token: CancellationToken,
  state: Mutex<HandleState>,
}

enum HandleState {
  Pending(mpsc::Receiver<Result<ImageResult>>),
  Done(Result<ImageResult>),
}

impl RequestHandle {
  /// This subscriber's cancellation token.
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  /// Detach this subscriber; takes effect at the next stage boundary.
  pub fn cancel(&self) {
    self.token.cancel();
  }

  /// Block until the request reaches a terminal state. Subsequent calls
  /// return the same outcome.
  pub fn wait(&self) -> Result<ImageResult> {
    let mut state = self
      .state
      .lock()
      .map_err(|_| Error::Other("request handle poisoned".to_string()))?;
    match &*state {
      HandleState::Done(outcome) => outcome.clone(),
      HandleState::Pending(receiver) => {
        let outcome = receiver
          .recv()
          .map_err(|_| Error::Other("request worker disappeared".to_string()))?;
        *state = HandleState::Done(outcome.clone());
        outcome
      }
    }
  }
}
