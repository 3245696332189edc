//! Decoded-image memory cache
//!
//! Byte-budgeted LRU keyed by request fingerprint. Accounting and order
//! live behind one mutex: an entry map plus a `BTreeMap` keyed by access
//! sequence, mirroring each other. `put` evicts synchronously while over
//! budget; `trim_to_size` is the external memory-pressure hook.
//!
//! Sharing rules: shareable entries are handed out by `Arc` and the cache
//! refuses to evict an entry whose payload still has outside references
//! (an in-flight delivery). Non-shareable entries are deep-copied on every
//! `get` so no external mutation can corrupt the cached payload.

use crate::image::ImageValue;
use crate::pool::BitmapPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct CacheEntry {
  value: Arc<ImageValue>,
  size: u64,
  seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
  entries: HashMap<String, CacheEntry>,
  /// Access order: lowest sequence = least recently used.
  order: BTreeMap<u64, String>,
  total_bytes: u64,
  next_seq: u64,
}

impl MemoryState {
  fn bump(&mut self, key: &str) {
    let Some(entry) = self.entries.get_mut(key) else {
      return;
    };
    self.order.remove(&entry.seq);
    entry.seq = self.next_seq;
    self.next_seq += 1;
    self.order.insert(entry.seq, key.to_string());
  }

  fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
    let entry = self.entries.remove(key)?;
    self.order.remove(&entry.seq);
    self.total_bytes = self.total_bytes.saturating_sub(entry.size);
    Some(entry)
  }

  /// Evict least-recently-used entries until `total_bytes <= target`,
  /// skipping entries whose payload is still referenced outside the cache.
  /// Evicted buffers with no outside references go back to the pool.
  fn evict_to(&mut self, target: u64, pool: Option<&Arc<BitmapPool>>) {
    if self.total_bytes <= target {
      return;
    }
    let victims: Vec<(u64, String)> = self
      .order
      .iter()
      .map(|(&seq, key)| (seq, key.clone()))
      .collect();
    for (_, key) in victims {
      if self.total_bytes <= target {
        break;
      }
      let referenced = self
        .entries
        .get(&key)
        .map(|entry| Arc::strong_count(&entry.value) > 1)
        .unwrap_or(false);
      if referenced {
        continue;
      }
      if let Some(entry) = self.remove_entry(&key) {
        if let (Some(pool), Ok(value)) = (pool, Arc::try_unwrap(entry.value)) {
          pool.release(value.into_pixels());
        }
      }
    }
  }
}

/// Bounded in-memory cache of decoded images.
///
/// Safe to share across pipeline executions; all operations are internally
/// synchronized.
#[derive(Debug)]
pub struct MemoryCache {
  state: Mutex<MemoryState>,
  max_bytes: u64,
  pool: Option<Arc<BitmapPool>>,
}

impl MemoryCache {
  /// Create a cache bounded to `max_bytes` of pixel payload.
  pub fn new(max_bytes: u64) -> Self {
    Self {
      state: Mutex::new(MemoryState::default()),
      max_bytes,
      pool: None,
    }
  }

  /// Recycle evicted, otherwise-unreferenced buffers into `pool`.
  pub fn with_pool(mut self, pool: Arc<BitmapPool>) -> Self {
    self.pool = Some(pool);
    self
  }

  pub fn max_size(&self) -> u64 {
    self.max_bytes
  }

  /// Current payload bytes held.
  pub fn size(&self) -> u64 {
    self.state.lock().map(|s| s.total_bytes).unwrap_or(0)
  }

  pub fn len(&self) -> usize {
    self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Look up a fingerprint, refreshing its recency.
  ///
  /// Non-shareable payloads come back as an independent copy.
  pub fn get(&self, fingerprint: &str) -> Option<Arc<ImageValue>> {
    let mut state = self.state.lock().ok()?;
    state.bump(fingerprint);
    let entry = state.entries.get(fingerprint)?;
    if entry.value.is_shareable() {
      Some(Arc::clone(&entry.value))
    } else {
      Some(Arc::new(entry.value.deep_copy()))
    }
  }

  /// Insert a payload, evicting LRU entries if the budget is exceeded.
  ///
  /// A payload larger than the whole budget is not stored at all: admitting
  /// it could never satisfy the budget invariant.
  pub fn put(&self, fingerprint: &str, value: Arc<ImageValue>) {
    let size = value.byte_size();
    if size > self.max_bytes {
      tracing::debug!(
        fingerprint,
        size,
        budget = self.max_bytes,
        "payload exceeds whole cache budget; not stored"
      );
      return;
    }
    let Ok(mut state) = self.state.lock() else {
      return;
    };
    state.remove_entry(fingerprint);
    let seq = state.next_seq;
    state.next_seq += 1;
    state.order.insert(seq, fingerprint.to_string());
    state.total_bytes += size;
    state.entries.insert(
      fingerprint.to_string(),
      CacheEntry { value, size, seq },
    );
    state.evict_to(self.max_bytes, self.pool.as_ref());
  }

  pub fn remove(&self, fingerprint: &str) -> Option<Arc<ImageValue>> {
    let mut state = self.state.lock().ok()?;
    state.remove_entry(fingerprint).map(|entry| entry.value)
  }

  /// External memory-pressure hook: evict LRU entries until at most
  /// `target_bytes` remain.
  pub fn trim_to_size(&self, target_bytes: u64) {
    if let Ok(mut state) = self.state.lock() {
      state.evict_to(target_bytes, self.pool.as_ref());
    }
  }

  pub fn clear(&self) {
    if let Ok(mut state) = self.state.lock() {
      state.entries.clear();
      state.order.clear();
      state.total_bytes = 0;
    }
  }
}
