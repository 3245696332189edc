//! Fetchers: URI → raw encoded bytes
//!
//! A [`Fetcher`] retrieves the encoded bytes behind one URI. Fetchers are
//! created per-request by a [`FetcherFactory`] registered in the
//! [`crate::registry::ComponentRegistry`]; the first factory whose
//! predicate accepts the URI wins.
//!
//! Built-in implementations:
//! - [`HttpUriFetcher`]: `http://` / `https://` over `ureq`, with bounded
//!   redirects, a response-size cap, and configurable timeout/user agent
//! - [`FileUriFetcher`]: `file://` URIs and bare filesystem paths
//! - [`Base64UriFetcher`]: inline `data:` URIs
//!
//! # Thread safety
//!
//! Fetchers must be `Send + Sync`; one fetcher instance is only ever driven
//! by the single execution that created it, but factories are shared.

use crate::error::{FetchError, Result};
use crate::image::DataFrom;
use crate::request::ImageRequest;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default User-Agent header for HTTP fetches
pub const DEFAULT_USER_AGENT: &str = "imagepipe/0.1";

/// Maximum redirect hops before an HTTP fetch gives up
const MAX_REDIRECTS: usize = 8;

// ============================================================================
// Core types
// ============================================================================

/// Raw encoded bytes produced by a fetch.
///
/// Cheap to clone; the payload is shared. Exposes a small header-sniffing
/// accessor so decoders can select themselves on content signature rather
/// than file extension.
#[derive(Debug, Clone)]
pub struct DataSource {
  bytes: Arc<Vec<u8>>,
}

impl DataSource {
  pub fn new(bytes: Vec<u8>) -> Self {
    Self { bytes: Arc::new(bytes) }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  /// The first `len` bytes (or fewer if the payload is shorter), for
  /// content-signature sniffing.
  pub fn header(&self, len: usize) -> &[u8] {
    &self.bytes[..len.min(self.bytes.len())]
  }
}

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub data: DataSource,
  /// Declared MIME type, if the source provided one. Advisory only:
  /// decoder selection sniffs the content signature.
  pub mime_type: Option<String>,
  pub data_from: DataFrom,
}

impl FetchResult {
  pub fn new(data: DataSource, mime_type: Option<String>, data_from: DataFrom) -> Self {
    Self { data, mime_type, data_from }
  }
}

// ============================================================================
// Fetcher trait + factory
// ============================================================================

/// Retrieves the raw bytes for the URI it was created with.
pub trait Fetcher: Send + Sync {
  fn fetch(&self) -> Result<FetchResult>;
}

/// Creates a [`Fetcher`] when the request's URI is in this factory's
/// territory; returns `None` otherwise so resolution moves to the next
/// registered factory.
pub trait FetcherFactory: Send + Sync {
  fn create(&self, request: &ImageRequest) -> Option<Arc<dyn Fetcher>>;

  /// Stable identity built from type name + construction parameters.
  /// Registries use it to drop duplicate registrations when composing.
  fn component_key(&self) -> String;
}

// ============================================================================
// URI resolution
// ============================================================================

/// Resolve a possibly-relative URI reference against an optional base.
///
/// Absolute URIs and `data:` URIs pass through untouched. A relative
/// reference without a usable base is returned unchanged.
pub fn resolve_uri(base: Option<&str>, uri: &str) -> String {
  if uri.is_empty() || uri.starts_with("data:") {
    return uri.to_string();
  }
  if let Ok(parsed) = Url::parse(uri) {
    return parsed.to_string();
  }
  if let Some(base) = base {
    if let Ok(base_url) = Url::parse(base) {
      if let Ok(joined) = base_url.join(uri) {
        return joined.to_string();
      }
    }
  }
  uri.to_string()
}

// ============================================================================
// HttpUriFetcher
// ============================================================================

/// Options for the HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcherOptions {
  pub timeout: Duration,
  pub user_agent: String,
  /// Maximum response size in bytes; larger bodies fail the fetch.
  pub max_response_size: usize,
}

impl Default for HttpFetcherOptions {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(30),
      user_agent: DEFAULT_USER_AGENT.to_string(),
      max_response_size: 50 * 1024 * 1024,
    }
  }
}

impl HttpFetcherOptions {
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = user_agent.into();
    self
  }

  pub fn with_max_response_size(mut self, max: usize) -> Self {
    self.max_response_size = max;
    self
  }
}

/// Fetches one `http://` or `https://` URI.
pub struct HttpUriFetcher {
  uri: String,
  options: HttpFetcherOptions,
}

impl HttpUriFetcher {
  pub fn new(uri: impl Into<String>, options: HttpFetcherOptions) -> Self {
    Self { uri: uri.into(), options }
  }

  fn http_error(&self, reason: impl Into<String>) -> FetchError {
    FetchError::Http {
      uri: self.uri.clone(),
      reason: reason.into(),
    }
  }
}

impl Fetcher for HttpUriFetcher {
  fn fetch(&self) -> Result<FetchResult> {
    let config = ureq::Agent::config_builder()
      .timeout_global(Some(self.options.timeout))
      .build();
    let agent: ureq::Agent = config.into();

    let mut current = self.uri.clone();
    for _ in 0..MAX_REDIRECTS {
      let mut response = agent
        .get(&current)
        .header("User-Agent", &self.options.user_agent)
        .call()
        .map_err(|e| self.http_error(e.to_string()))?;

      let status = response.status();
      if (300..400).contains(&status.as_u16()) {
        if let Some(location) = response.headers().get("location").and_then(|h| h.to_str().ok()) {
          current = Url::parse(&current)
            .ok()
            .and_then(|base| base.join(location).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| location.to_string());
          continue;
        }
      }

      let mime_type = response
        .headers()
        .get("content-type")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

      let bytes = response
        .body_mut()
        .with_config()
        .limit(self.options.max_response_size as u64)
        .read_to_vec()
        .map_err(|e| match e {
          ureq::Error::BodyExceedsLimit(_) => FetchError::TooLarge {
            uri: self.uri.clone(),
            limit: self.options.max_response_size,
          },
          other => self.http_error(other.to_string()),
        })?;

      if bytes.is_empty() {
        return Err(FetchError::EmptyBody { uri: self.uri.clone() }.into());
      }
      return Ok(FetchResult::new(
        DataSource::new(bytes),
        mime_type,
        DataFrom::Network,
      ));
    }

    Err(self.http_error("too many redirects").into())
  }
}

/// Factory for [`HttpUriFetcher`]; accepts `http://` and `https://` URIs.
#[derive(Debug, Clone, Default)]
pub struct HttpUriFetcherFactory {
  options: HttpFetcherOptions,
}

impl HttpUriFetcherFactory {
  pub fn new(options: HttpFetcherOptions) -> Self {
    Self { options }
  }
}

impl FetcherFactory for HttpUriFetcherFactory {
  fn create(&self, request: &ImageRequest) -> Option<Arc<dyn Fetcher>> {
    let uri = request.uri();
    if uri.starts_with("http://") || uri.starts_with("https://") {
      Some(Arc::new(HttpUriFetcher::new(uri, self.options.clone())))
    } else {
      None
    }
  }

  fn component_key(&self) -> String {
    format!(
      "HttpUriFetcherFactory(timeout={}ms,max={})",
      self.options.timeout.as_millis(),
      self.options.max_response_size
    )
  }
}

// ============================================================================
// FileUriFetcher
// ============================================================================

/// Fetches `file://` URIs and bare filesystem paths.
pub struct FileUriFetcher {
  uri: String,
}

impl FileUriFetcher {
  pub fn new(uri: impl Into<String>) -> Self {
    Self { uri: uri.into() }
  }
}

impl Fetcher for FileUriFetcher {
  fn fetch(&self) -> Result<FetchResult> {
    let path = self.uri.strip_prefix("file://").unwrap_or(&self.uri);
    let bytes = std::fs::read(path).map_err(|e| FetchError::File {
      uri: self.uri.clone(),
      reason: e.to_string(),
    })?;
    let mime_type = guess_mime_from_path(path);
    Ok(FetchResult::new(
      DataSource::new(bytes),
      mime_type,
      DataFrom::Local,
    ))
  }
}

/// Factory for [`FileUriFetcher`]; accepts `file://` URIs and anything with
/// no scheme (treated as a local path).
#[derive(Debug, Clone, Default)]
pub struct FileUriFetcherFactory;

impl FetcherFactory for FileUriFetcherFactory {
  fn create(&self, request: &ImageRequest) -> Option<Arc<dyn Fetcher>> {
    let uri = request.uri();
    let schemeless = !uri.contains("://") && !uri.starts_with("data:");
    if uri.starts_with("file://") || schemeless {
      Some(Arc::new(FileUriFetcher::new(uri)))
    } else {
      None
    }
  }

  fn component_key(&self) -> String {
    "FileUriFetcherFactory".to_string()
  }
}

/// Guess a MIME type from a file path extension
fn guess_mime_from_path(path: &str) -> Option<String> {
  let ext = Path::new(path)
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_lowercase())?;

  let mime = match ext.as_str() {
    "png" => "image/png",
    "jpg" | "jpeg" => "image/jpeg",
    "gif" => "image/gif",
    "webp" => "image/webp",
    "bmp" => "image/bmp",
    "ico" => "image/x-icon",
    _ => return None,
  };
  Some(mime.to_string())
}

// ============================================================================
// Base64UriFetcher
// ============================================================================

/// Decodes inline `data:` URIs.
pub struct Base64UriFetcher {
  uri: String,
}

impl Base64UriFetcher {
  pub fn new(uri: impl Into<String>) -> Self {
    Self { uri: uri.into() }
  }
}

impl Fetcher for Base64UriFetcher {
  fn fetch(&self) -> Result<FetchResult> {
    let (bytes, mime_type) = decode_data_uri(&self.uri)?;
    Ok(FetchResult::new(
      DataSource::new(bytes),
      mime_type,
      DataFrom::Local,
    ))
  }
}

/// Factory for [`Base64UriFetcher`]; accepts `data:` URIs.
#[derive(Debug, Clone, Default)]
pub struct Base64UriFetcherFactory;

impl FetcherFactory for Base64UriFetcherFactory {
  fn create(&self, request: &ImageRequest) -> Option<Arc<dyn Fetcher>> {
    if request.uri().starts_with("data:") {
      Some(Arc::new(Base64UriFetcher::new(request.uri())))
    } else {
      None
    }
  }

  fn component_key(&self) -> String {
    "Base64UriFetcherFactory".to_string()
  }
}

/// Decode a `data:` URI into bytes + declared media type.
fn decode_data_uri(uri: &str) -> Result<(Vec<u8>, Option<String>)> {
  let rest = uri.strip_prefix("data:").ok_or_else(|| FetchError::InvalidDataUri {
    reason: "missing 'data:' prefix".to_string(),
  })?;
  let comma = rest.find(',').ok_or_else(|| FetchError::InvalidDataUri {
    reason: "missing comma".to_string(),
  })?;

  let header = &rest[..comma];
  let payload = &rest[comma + 1..];

  let is_base64 = header.ends_with(";base64");
  let media_type = header
    .split(';')
    .next()
    .filter(|s| !s.is_empty() && s.contains('/'))
    .map(|s| s.to_string());

  let bytes = if is_base64 {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
      .decode(payload)
      .map_err(|e| FetchError::InvalidDataUri {
        reason: format!("invalid base64: {e}"),
      })?
  } else {
    percent_decode(payload)?
  };

  Ok((bytes, media_type))
}

/// Percent-decode a string to bytes
fn percent_decode(input: &str) -> Result<Vec<u8>> {
  let bytes = input.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' {
      if i + 2 >= bytes.len() {
        return Err(
          FetchError::InvalidDataUri {
            reason: "incomplete percent-escape".to_string(),
          }
          .into(),
        );
      }
      let hi = (bytes[i + 1] as char).to_digit(16);
      let lo = (bytes[i + 2] as char).to_digit(16);
      match (hi, lo) {
        (Some(hi), Some(lo)) => {
          out.push(((hi << 4) | lo) as u8);
          i += 3;
        }
        _ => {
          return Err(
            FetchError::InvalidDataUri {
              reason: "invalid percent-escape".to_string(),
            }
            .into(),
          )
        }
      }
    } else {
      out.push(bytes[i]);
      i += 1;
    }
  }
  Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
