//! Persistent result cache
//!
//! Content-addressed store of raw encoded bytes keyed by a request's
//! download key. Layout: `<dir>/<sha256(key)>.bin` plus a `.bin.meta` JSON
//! sidecar, with an `index.jsonl` journal (see `disk_index`) tracking sizes
//! and access order for eviction.
//!
//! Writes are atomic: bytes land in a `.tmp` sibling and are renamed into
//! place, so a crash mid-write never yields a corrupt visible entry. Reads
//! hold an in-process lease that eviction sweeps refuse to delete, making
//! read/evict safe to run concurrently.
//!
//! All failures here are best-effort by design: a failed write is reported
//! to the caller (who logs and moves on), a failed read is a miss.

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[path = "disk_index.rs"]
mod disk_index;
use disk_index::{meta_path_for_data, CacheIndex};

/// Sidecar metadata persisted next to each entry's bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMetadata {
  /// The (unhashed) key the entry was stored under.
  pub key: String,
  /// Declared MIME type at fetch time, if any.
  pub content_type: Option<String>,
  /// Seconds since the epoch at store time.
  pub stored_at: u64,
  /// Payload length; mismatches invalidate the entry.
  pub len: usize,
}

/// Configuration for [`ResultCache`].
#[derive(Debug, Clone, Copy)]
pub struct ResultCacheConfig {
  /// Maximum total payload bytes kept on disk. `0` disables eviction.
  pub max_bytes: u64,
}

impl Default for ResultCacheConfig {
  fn default() -> Self {
    Self {
      max_bytes: 512 * 1024 * 1024,
    }
  }
}

/// Disk-backed cache of encoded (pre-decode) bytes.
#[derive(Debug)]
pub struct ResultCache {
  cache_dir: PathBuf,
  config: ResultCacheConfig,
  index: CacheIndex,
  /// Entry-key → outstanding reader count. Evictions skip leased entries.
  leases: Arc<Mutex<HashMap<String, usize>>>,
}

impl ResultCache {
  /// Open (creating if needed) a cache rooted at `cache_dir`.
  pub fn open(cache_dir: impl Into<PathBuf>, config: ResultCacheConfig) -> Self {
    let cache_dir = cache_dir.into();
    let _ = fs::create_dir_all(&cache_dir);
    let index = CacheIndex::open(cache_dir.clone());
    Self {
      cache_dir,
      config,
      index,
      leases: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn cache_dir(&self) -> &Path {
    &self.cache_dir
  }

  /// Total payload bytes currently indexed.
  pub fn total_bytes(&self) -> u64 {
    self.index.total_bytes()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.index.contains(&entry_key(key))
  }

  /// Read an entry's bytes and metadata. Any inconsistency is a miss.
  pub fn read(&self, key: &str) -> Option<(Vec<u8>, StoredMetadata)> {
    let entry = entry_key(key);
    let _lease = self.lease(&entry);

    let data_path = self.data_path(&entry);
    let meta_path = meta_path_for_data(&data_path);

    let meta_bytes = fs::read(&meta_path).ok()?;
    let meta: StoredMetadata = serde_json::from_slice(&meta_bytes).ok()?;
    let bytes = fs::read(&data_path).ok()?;
    if bytes.len() != meta.len {
      tracing::warn!(key, "result-cache entry length mismatch; dropping");
      self.index.record_removal(&entry);
      return None;
    }

    self.index.record_touch(&entry);
    Some((bytes, meta))
  }

  /// Persist an entry atomically and run an eviction sweep.
  pub fn write(
    &self,
    key: &str,
    bytes: &[u8],
    content_type: Option<&str>,
  ) -> std::result::Result<(), CacheError> {
    if bytes.is_empty() {
      tracing::debug!(key, "skipping result-cache write of empty payload");
      return Ok(());
    }

    let entry = entry_key(key);
    let data_path = self.data_path(&entry);
    let meta_path = meta_path_for_data(&data_path);
    let data_tmp = tmp_path(&data_path);
    let meta_tmp = tmp_path(&meta_path);

    let meta = StoredMetadata {
      key: key.to_string(),
      content_type: content_type.map(|s| s.to_string()),
      stored_at: now_seconds(),
      len: bytes.len(),
    };
    let serialized = serde_json::to_vec(&meta).map_err(|e| CacheError::Write {
      key: key.to_string(),
      reason: e.to_string(),
    })?;

    let write_err = |e: std::io::Error| CacheError::Write {
      key: key.to_string(),
      reason: e.to_string(),
    };
    let cleanup = || {
      let _ = fs::remove_file(&data_tmp);
      let _ = fs::remove_file(&meta_tmp);
    };

    if let Err(e) = fs::write(&data_tmp, bytes) {
      cleanup();
      return Err(write_err(e));
    }
    if let Err(e) = fs::write(&meta_tmp, &serialized) {
      cleanup();
      return Err(write_err(e));
    }
    if let Err(e) = fs::rename(&data_tmp, &data_path) {
      cleanup();
      return Err(write_err(e));
    }
    if let Err(e) = fs::rename(&meta_tmp, &meta_path) {
      let _ = fs::remove_file(&meta_tmp);
      self.index.record_removal(&entry);
      return Err(write_err(e));
    }

    self.index.record_insert(&entry, bytes.len() as u64, &data_path, &meta_path);

    let leases = Arc::clone(&self.leases);
    self.index.evict_if_needed(self.config.max_bytes, |candidate| {
      leases
        .lock()
        .map(|map| !map.contains_key(candidate))
        .unwrap_or(false)
    });
    Ok(())
  }

  pub fn remove(&self, key: &str) {
    self.index.record_removal(&entry_key(key));
  }

  pub fn clear(&self) {
    self.index.clear();
  }

  fn data_path(&self, entry: &str) -> PathBuf {
    self.cache_dir.join(format!("{entry}.bin"))
  }

  fn lease(&self, entry: &str) -> ReadLease<'_> {
    if let Ok(mut map) = self.leases.lock() {
      *map.entry(entry.to_string()).or_insert(0) += 1;
    }
    ReadLease { cache: self, entry: entry.to_string() }
  }

  #[cfg(test)]
  fn leased(&self, entry: &str) -> bool {
    self
      .leases
      .lock()
      .map(|map| map.contains_key(entry))
      .unwrap_or(false)
  }
}

/// RAII reader lease; releasing removes the eviction veto.
struct ReadLease<'a> {
  cache: &'a ResultCache,
  entry: String,
}

impl Drop for ReadLease<'_> {
  fn drop(&mut self) {
    if let Ok(mut map) = self.cache.leases.lock() {
      if let Some(count) = map.get_mut(&self.entry) {
        *count -= 1;
        if *count == 0 {
          map.remove(&self.entry);
        }
      }
    }
  }
}

/// Content-address a user key: SHA-256 hex of the key bytes, avoiding any
/// filesystem-path issues with raw URIs.
fn entry_key(key: &str) -> String {
  use std::fmt::Write;

  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  let digest = hasher.finalize();
  let mut out = String::with_capacity(64);
  for byte in digest {
    let _ = write!(out, "{byte:02x}");
  }
  out
}

fn tmp_path(path: &Path) -> PathBuf {
  let mut name = path.as_os_str().to_owned();
  name.push(".tmp");
  PathBuf::from(name)
}

fn now_seconds() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}
