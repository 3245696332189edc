//! Component registry
//!
//! Ordered, pluggable lists of fetcher factories, decoder factories, and
//! interceptors. Resolution walks each list in order and takes the first
//! factory that accepts the request — so registration order is the
//! override mechanism: prepend to win, append to act as a fallback.
//!
//! Registries are immutable once built and require no synchronization for
//! reads. [`ComponentRegistryBuilder`] produces a new registry; composing
//! two registries never mutates either. Duplicate factories (same
//! `component_key`) are dropped during composition so repeated
//! `support_*`-style registration is a no-op.

use crate::decode::{Decoder, DecoderFactory};
use crate::fetch::{FetchResult, Fetcher, FetcherFactory};
use crate::interceptor::{DecodeInterceptor, RequestInterceptor};
use crate::request::ImageRequest;
use std::sync::Arc;

/// Immutable component lists consulted by the executor.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
  fetcher_factories: Vec<Arc<dyn FetcherFactory>>,
  decoder_factories: Vec<Arc<dyn DecoderFactory>>,
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  decode_interceptors: Vec<Arc<dyn DecodeInterceptor>>,
}

impl ComponentRegistry {
  pub fn builder() -> ComponentRegistryBuilder {
    ComponentRegistryBuilder::default()
  }

  /// First fetcher whose factory accepts the request's URI, or a typed
  /// absence the pipeline maps to `Error::NoApplicableFetcher`.
  pub fn resolve_fetcher(&self, request: &ImageRequest) -> Option<Arc<dyn Fetcher>> {
    self
      .fetcher_factories
      .iter()
      .find_map(|factory| factory.create(request))
  }

  /// First decoder whose factory accepts the fetched content signature.
  pub fn resolve_decoder(
    &self,
    request: &ImageRequest,
    fetched: &FetchResult,
  ) -> Option<Box<dyn Decoder>> {
    self
      .decoder_factories
      .iter()
      .find_map(|factory| factory.create(request, fetched))
  }

  pub fn request_interceptors(&self) -> &[Arc<dyn RequestInterceptor>] {
    &self.request_interceptors
  }

  pub fn decode_interceptors(&self) -> &[Arc<dyn DecodeInterceptor>] {
    &self.decode_interceptors
  }

  pub fn fetcher_count(&self) -> usize {
    self.fetcher_factories.len()
  }

  pub fn decoder_count(&self) -> usize {
    self.decoder_factories.len()
  }

  /// Start a builder seeded with this registry's components.
  pub fn to_builder(&self) -> ComponentRegistryBuilder {
    ComponentRegistryBuilder {
      fetcher_factories: self.fetcher_factories.clone(),
      decoder_factories: self.decoder_factories.clone(),
      request_interceptors: self.request_interceptors.clone(),
      decode_interceptors: self.decode_interceptors.clone(),
    }
  }
}

/// Accumulates components, then freezes them into a [`ComponentRegistry`].
#[derive(Default)]
pub struct ComponentRegistryBuilder {
  fetcher_factories: Vec<Arc<dyn FetcherFactory>>,
  decoder_factories: Vec<Arc<dyn DecoderFactory>>,
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  decode_interceptors: Vec<Arc<dyn DecodeInterceptor>>,
}

impl ComponentRegistryBuilder {
  /// Append a fetcher factory (consulted after existing ones).
  pub fn add_fetcher(mut self, factory: Arc<dyn FetcherFactory>) -> Self {
    self.fetcher_factories.push(factory);
    self
  }

  /// Prepend a fetcher factory so it overrides existing registrations.
  pub fn prepend_fetcher(mut self, factory: Arc<dyn FetcherFactory>) -> Self {
    self.fetcher_factories.insert(0, factory);
    self
  }

  /// Append a decoder factory (consulted after existing ones).
  pub fn add_decoder(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
    self.decoder_factories.push(factory);
    self
  }

  /// Prepend a decoder factory so it overrides existing registrations.
  pub fn prepend_decoder(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
    self.decoder_factories.insert(0, factory);
    self
  }

  /// Append a request interceptor; interceptors run in registration order.
  pub fn add_request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
    self.request_interceptors.push(interceptor);
    self
  }

  /// Append a decode interceptor; interceptors run in registration order.
  pub fn add_decode_interceptor(mut self, interceptor: Arc<dyn DecodeInterceptor>) -> Self {
    self.decode_interceptors.push(interceptor);
    self
  }

  /// Append another registry's components, dropping factories whose
  /// `component_key` is already present. Merging a registry into itself
  /// is a no-op for factories.
  pub fn merge(mut self, other: &ComponentRegistry) -> Self {
    let fetcher_keys: Vec<String> = self
      .fetcher_factories
      .iter()
      .map(|f| f.component_key())
      .collect();
    for factory in &other.fetcher_factories {
      if !fetcher_keys.contains(&factory.component_key()) {
        self.fetcher_factories.push(Arc::clone(factory));
      }
    }

    let decoder_keys: Vec<String> = self
      .decoder_factories
      .iter()
      .map(|f| f.component_key())
      .collect();
    for factory in &other.decoder_factories {
      if !decoder_keys.contains(&factory.component_key()) {
        self.decoder_factories.push(Arc::clone(factory));
      }
    }

    for interceptor in &other.request_interceptors {
      self.request_interceptors.push(Arc::clone(interceptor));
    }
    for interceptor in &other.decode_interceptors {
      self.decode_interceptors.push(Arc::clone(interceptor));
    }
    self
  }

  pub fn build(self) -> ComponentRegistry {
    ComponentRegistry {
      fetcher_factories: self.fetcher_factories,
      decoder_factories: self.decoder_factories,
      request_interceptors: self.request_interceptors,
      decode_interceptors: self.decode_interceptors,
    }
  }
}
