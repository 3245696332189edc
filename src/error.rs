//! Error types for the image pipeline
//!
//! This module provides error types for all pipeline subsystems:
//! - Component resolution (no applicable fetcher/decoder)
//! - Fetch errors (network, filesystem, data URIs)
//! - Decode errors (corrupt or unsupported data)
//! - Cache errors (internal; cache writes are best-effort and never surface)
//!
//! All errors use the `thiserror` crate for minimal boilerplate and proper
//! error trait implementations. Every error type is `Clone`: pipeline results
//! are broadcast to coalesced subscribers, so the same error value may be
//! delivered more than once.

use thiserror::Error;

/// Result type alias for pipeline operations
///
/// # Examples
///
/// ```
/// use imagepipe::Result;
///
/// fn fetch_bytes(uri: &str) -> Result<Vec<u8>> {
///     Ok(Vec::new())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the image pipeline
///
/// Each variant either marks a registry resolution failure, wraps a more
/// specific error type for that stage, or marks cooperative cancellation.
/// `Cancelled` is a distinct terminal state rather than a failure: it is
/// never delivered to subscribers who cancelled themselves.
#[derive(Error, Debug, Clone)]
pub enum Error {
  /// No registered fetcher factory accepted the request's URI
  #[error("No applicable fetcher for '{uri}'")]
  NoApplicableFetcher { uri: String },

  /// No registered decoder factory accepted the fetched data
  #[error("No applicable decoder for '{uri}'")]
  NoApplicableDecoder { uri: String },

  /// Fetch stage failure (network, filesystem, data URI)
  #[error("Fetch error: {0}")]
  Fetch(#[from] FetchError),

  /// Decode stage failure (corrupt or unsupported data)
  #[error("Decode error: {0}")]
  Decode(#[from] DecodeError),

  /// Transform stage failure
  #[error("Transform error: {0}")]
  Transform(#[from] TransformError),

  /// The request was cancelled before completing
  #[error("Request cancelled")]
  Cancelled,

  /// Generic error for miscellaneous issues
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Whether this error is the cooperative-cancellation terminal state.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Error::Cancelled)
  }
}

/// Errors that occur while fetching raw encoded bytes
///
/// These happen when a URI cannot be retrieved from the network, the
/// filesystem, or an inline data URI. The result cache is left untouched by
/// fetch failures, so partial state from earlier requests stays valid.
///
/// # Examples
///
/// ```
/// use imagepipe::error::FetchError;
///
/// let error = FetchError::Http {
///     uri: "https://example.com/image.png".to_string(),
///     reason: "404 Not Found".to_string(),
/// };
/// ```
#[derive(Error, Debug, Clone)]
pub enum FetchError {
  /// HTTP request failed or returned an unusable response
  #[error("HTTP fetch of '{uri}' failed: {reason}")]
  Http { uri: String, reason: String },

  /// Local file could not be read
  #[error("Failed to read '{uri}': {reason}")]
  File { uri: String, reason: String },

  /// Malformed data: URI
  #[error("Invalid data URI: {reason}")]
  InvalidDataUri { reason: String },

  /// Response exceeded the configured size limit
  #[error("Response for '{uri}' exceeded {limit} bytes")]
  TooLarge { uri: String, limit: usize },

  /// Empty response body
  #[error("Empty response body for '{uri}'")]
  EmptyBody { uri: String },
}

/// Errors that occur while decoding fetched bytes into pixels
///
/// Cached raw bytes remain valid after a decode failure, so a retry with
/// different decode options skips the fetch.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
  /// Content signature did not match any supported format
  #[error("Unrecognized image format for '{uri}'")]
  UnknownFormat { uri: String },

  /// Decoder rejected the data
  #[error("Failed to decode '{uri}': {reason}")]
  Failed { uri: String, reason: String },

  /// Decoded dimensions exceed configured limits
  #[error("Image '{uri}' is {width}x{height}, over the configured limit")]
  TooLarge { uri: String, width: u32, height: u32 },
}

/// Errors produced by a transformation in the request's transform chain.
#[derive(Error, Debug, Clone)]
pub enum TransformError {
  /// The transformation could not be applied to this buffer
  #[error("Transformation '{key}' failed: {reason}")]
  Failed { key: String, reason: String },
}

/// Errors internal to the cache layers
///
/// Cache write errors are never propagated to request subscribers; the
/// executor logs them and delivers the in-memory result regardless. This
/// type exists so cache internals can report failures to their callers
/// (and tests) with structure.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
  /// Persisting an entry to disk failed
  #[error("Failed to write cache entry '{key}': {reason}")]
  Write { key: String, reason: String },

  /// Reading an entry back failed (treated as a miss by callers)
  #[error("Failed to read cache entry '{key}': {reason}")]
  Read { key: String, reason: String },
}
