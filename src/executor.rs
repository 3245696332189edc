//! Request executor: the pipeline state machine
//!
//! Drives one request through `CacheCheck → Fetching → Decoding →
//! Transforming → Delivering`, consulting the memory cache, the in-flight
//! coalescer, the result cache, and the component registry in that order.
//! The cancellation token is checked at every stage boundary; cancellation
//! is cooperative, never preemptive.
//!
//! Concurrency shape: any number of executions may run concurrently, but
//! the coalescer guarantees at most one fetch+decode per fingerprint. The
//! sole executor ("owner") broadcasts its outcome to all joiners before
//! the in-flight entry is retired. Raw network bytes land in the result
//! cache before decode, so a decode failure preserves fetch progress and a
//! retry skips the network.

use crate::cache::{MemoryCache, ResultCache};
use crate::coalesce::{Coalescer, InFlightEntry, Join};
use crate::error::{Error, Result};
use crate::fetch::{DataSource, FetchResult};
use crate::image::{DataFrom, ImageResult, ImageValue};
use crate::interceptor::{
  DecodeInterceptor, DecodeInterceptorChain, RequestInterceptorChain,
  TransformationDecodeInterceptor,
};
use crate::key;
use crate::pool::BitmapPool;
use crate::registry::ComponentRegistry;
use crate::request::ImageRequest;
use crate::token::{CancellationToken, Stage};
use crate::worker::WorkerPool;
use std::sync::Arc;

/// What the owner broadcasts to coalesced subscribers.
type LoadOutput = (Arc<ImageValue>, DataFrom);

/// Mutable-per-execution wrapper around one immutable request.
///
/// Owned by exactly one pipeline execution; never shared.
pub(crate) struct RequestContext {
  request: ImageRequest,
  fingerprint: String,
  download_key: String,
}

impl RequestContext {
  fn new(request: ImageRequest) -> Self {
    let fingerprint = key::fingerprint(&request);
    let download_key = key::download_key(&request);
    Self {
      request,
      fingerprint,
      download_key,
    }
  }
}

/// Shared pipeline engine: caches, coalescer, registry, worker handoff.
pub struct RequestExecutor {
  registry: ComponentRegistry,
  memory_cache: Arc<MemoryCache>,
  result_cache: Option<Arc<ResultCache>>,
  coalescer: Coalescer<LoadOutput>,
  /// Decode/transform stages are shipped here when present.
  cpu_pool: Option<Arc<WorkerPool>>,
  /// Recycles superseded transform buffers.
  bitmap_pool: Option<Arc<BitmapPool>>,
}

impl RequestExecutor {
  pub(crate) fn new(
    registry: ComponentRegistry,
    memory_cache: Arc<MemoryCache>,
    result_cache: Option<Arc<ResultCache>>,
    cpu_pool: Option<Arc<WorkerPool>>,
    bitmap_pool: Option<Arc<BitmapPool>>,
  ) -> Self {
    Self {
      registry,
      memory_cache,
      result_cache,
      coalescer: Coalescer::new(),
      cpu_pool,
      bitmap_pool,
    }
  }

  pub fn memory_cache(&self) -> &Arc<MemoryCache> {
    &self.memory_cache
  }

  pub fn result_cache(&self) -> Option<&Arc<ResultCache>> {
    self.result_cache.as_ref()
  }

  pub fn registry(&self) -> &ComponentRegistry {
    &self.registry
  }

  /// Number of fingerprints currently in flight (diagnostics).
  pub fn in_flight(&self) -> usize {
    self.coalescer.in_flight()
  }

  /// Run one request to a terminal state on the calling thread.
  ///
  /// `own_token` is this subscriber's token: cancelling it detaches this
  /// subscriber, and cancels the underlying execution only if nobody else
  /// is interested.
  pub fn execute(&self, request: &ImageRequest, own_token: &CancellationToken) -> Result<ImageResult> {
    own_token.check(Stage::Pending)?;
    let context = RequestContext::new(request.clone());

    let mut engine =
      |_request: &ImageRequest| -> Result<ImageResult> { self.engine(&context, own_token) };
    let mut chain = RequestInterceptorChain::new(
      &context.request,
      &context.fingerprint,
      own_token,
      self.registry.request_interceptors(),
      &mut engine,
    );
    chain.proceed()
  }

  /// The terminal stage of the request-interceptor chain: memory cache,
  /// coalescing, then the fetch/decode pipeline.
  fn engine(&self, context: &RequestContext, own_token: &CancellationToken) -> Result<ImageResult> {
    own_token.check(Stage::CacheCheck)?;

    if context.request.memory_cache().read {
      if let Some(image) = self.memory_cache.get(&context.fingerprint) {
        return Ok(ImageResult {
          image,
          fingerprint: context.fingerprint.clone(),
          data_from: DataFrom::MemoryCache,
        });
      }
    }

    match self.coalescer.join_or_start(&context.fingerprint) {
      Join::Joiner(entry) => {
        tracing::debug!(fingerprint = %context.fingerprint, "joined in-flight execution");
        let (image, data_from) = self.coalescer.wait(&entry, own_token)?;
        Ok(ImageResult {
          image,
          fingerprint: context.fingerprint.clone(),
          data_from,
        })
      }
      Join::Owner(entry) => {
        let outcome = self.produce(context, own_token, &entry);
        self.coalescer.finish(&context.fingerprint, &entry, outcome.clone());
        let (image, data_from) = outcome?;
        if own_token.is_cancelled() {
          // The execution completed for other subscribers, but this one
          // cancelled; it gets the distinct terminal state instead.
          return Err(Error::Cancelled);
        }
        Ok(ImageResult {
          image,
          fingerprint: context.fingerprint.clone(),
          data_from,
        })
      }
    }
  }

  /// Sole execution for one fingerprint: result cache → fetch → decode →
  /// transform → store.
  fn produce(
    &self,
    context: &RequestContext,
    own_token: &CancellationToken,
    entry: &Arc<InFlightEntry<LoadOutput>>,
  ) -> Result<LoadOutput> {
    let exec_token = entry.execution_token();
    let mut owner_detached = false;

    self.owner_check(Stage::Fetching, &exec_token, own_token, entry, &mut owner_detached)?;
    let fetched = self.acquire_bytes(context)?;

    self.owner_check(Stage::Decoding, &exec_token, own_token, entry, &mut owner_detached)?;
    let value = self.decode(context, &exec_token, &fetched)?;

    self.owner_check(Stage::Delivering, &exec_token, own_token, entry, &mut owner_detached)?;
    let value = Arc::new(value);
    if context.request.memory_cache().write {
      self.memory_cache.put(&context.fingerprint, Arc::clone(&value));
    }
    Ok((value, fetched.data_from))
  }

  /// Stage boundary for the owner. Checks the shared execution token, and
  /// folds the owner's own cancellation into the interest count exactly
  /// once: if the owner was the last interested subscriber, the execution
  /// token trips and the pipeline stops here.
  fn owner_check(
    &self,
    stage: Stage,
    exec_token: &CancellationToken,
    own_token: &CancellationToken,
    entry: &Arc<InFlightEntry<LoadOutput>>,
    owner_detached: &mut bool,
  ) -> Result<()> {
    exec_token.check(stage)?;
    if own_token.is_cancelled() && !*owner_detached {
      *owner_detached = true;
      self.coalescer.release_interest(entry);
      exec_token.check(stage)?;
    }
    Ok(())
  }

  /// Result-cache hit, or registry-resolved fetch with best-effort
  /// persistence of raw network bytes.
  fn acquire_bytes(&self, context: &RequestContext) -> Result<FetchResult> {
    if context.request.result_cache().read {
      if let Some(cache) = &self.result_cache {
        if let Some((bytes, meta)) = cache.read(&context.download_key) {
          tracing::debug!(key = %context.download_key, "result cache hit");
          return Ok(FetchResult::new(
            DataSource::new(bytes),
            meta.content_type,
            DataFrom::ResultCache,
          ));
        }
      }
    }

    let fetcher = self
      .registry
      .resolve_fetcher(&context.request)
      .ok_or_else(|| Error::NoApplicableFetcher {
        uri: context.request.uri().to_string(),
      })?;
    let fetched = fetcher.fetch()?;

    // Persist before decode so a decode failure still preserves the fetch.
    // Cache writes are best-effort: failures are logged, never surfaced.
    if context.request.result_cache().write && fetched.data_from == DataFrom::Network {
      if let Some(cache) = &self.result_cache {
        if let Err(err) = cache.write(
          &context.download_key,
          fetched.data.as_bytes(),
          fetched.mime_type.as_deref(),
        ) {
          tracing::warn!(error = %err, "result-cache write failed; delivering anyway");
        }
      }
    }
    Ok(fetched)
  }

  /// Run the decode-interceptor chain, shipping it to the CPU pool when
  /// one is configured.
  fn decode(
    &self,
    context: &RequestContext,
    exec_token: &CancellationToken,
    fetched: &FetchResult,
  ) -> Result<ImageValue> {
    match &self.cpu_pool {
      Some(pool) => {
        let registry = self.registry.clone();
        let request = context.request.clone();
        let fingerprint = context.fingerprint.clone();
        let token = exec_token.clone();
        let fetched = fetched.clone();
        let bitmap_pool = self.bitmap_pool.clone();
        pool.run_and_wait(move || {
          run_decode_chain(&registry, &request, &fingerprint, &token, &fetched, bitmap_pool)
        })
      }
      None => run_decode_chain(
        &self.registry,
        &context.request,
        &context.fingerprint,
        exec_token,
        fetched,
        self.bitmap_pool.clone(),
      ),
    }
  }
}

/// Decode chain: user decode interceptors, then the built-in transform
/// application, then the registry-resolved decoder.
fn run_decode_chain(
  registry: &ComponentRegistry,
  request: &ImageRequest,
  fingerprint: &str,
  token: &CancellationToken,
  fetched: &FetchResult,
  bitmap_pool: Option<Arc<BitmapPool>>,
) -> Result<ImageValue> {
  let mut interceptors: Vec<Arc<dyn DecodeInterceptor>> =
    registry.decode_interceptors().to_vec();
  interceptors.push(Arc::new(TransformationDecodeInterceptor::new(bitmap_pool)));

  let mut engine = |request: &ImageRequest| -> Result<ImageValue> {
    token.check(Stage::Decoding)?;
    let decoder = registry
      .resolve_decoder(request, fetched)
      .ok_or_else(|| Error::NoApplicableDecoder {
        uri: request.uri().to_string(),
      })?;
    let decoded = decoder.decode()?;
    Ok(ImageValue::new(decoded.pixels, decoded.intrinsic_size))
  };
  let mut chain =
    DecodeInterceptorChain::new(request, fingerprint, token, &interceptors, &mut engine);
  chain.proceed()
}
