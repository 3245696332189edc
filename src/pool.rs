//! Bitmap pool: reusable decoded-image buffers
//!
//! Decoding allocates large RGBA buffers at high churn. The pool keeps
//! released buffers bucketed by capacity so a decode targeting similar
//! dimensions can reuse one instead of allocating. Buffers are tracked by
//! id while checked out; releasing a buffer the pool does not consider
//! checked out is logged and ignored rather than treated as fatal.

use crate::image::PixelBuffer;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A released buffer is pooled only if its capacity is within this factor
/// of the capacity bucket it would serve.
const REUSE_SLOP_FACTOR: u64 = 2;

#[derive(Debug, Default)]
struct PoolState {
  /// Free buffers keyed by byte capacity. Multiple buffers may share a
  /// capacity; they are interchangeable.
  free: BTreeMap<u64, Vec<PooledBuffer>>,
  /// Ids of buffers currently checked out.
  checked_out: HashSet<u64>,
  total_bytes: u64,
}

#[derive(Debug)]
struct PooledBuffer {
  id: u64,
  data: Vec<u8>,
}

/// Shared pool of reusable RGBA8 buffers.
///
/// Safe for concurrent `acquire`/`release` from multiple decode threads.
#[derive(Debug)]
pub struct BitmapPool {
  state: Mutex<PoolState>,
  max_bytes: u64,
  next_id: AtomicU64,
}

impl BitmapPool {
  /// Create a pool retaining at most `max_bytes` of free buffers.
  pub fn new(max_bytes: u64) -> Self {
    Self {
      state: Mutex::new(PoolState::default()),
      max_bytes,
      next_id: AtomicU64::new(1),
    }
  }

  /// Total bytes currently held by free buffers.
  pub fn free_bytes(&self) -> u64 {
    self.state.lock().map(|s| s.total_bytes).unwrap_or(0)
  }

  /// Borrow a buffer for `width * height` RGBA pixels.
  ///
  /// Returns a zero-filled buffer whose backing capacity is at least the
  /// required size and within [`REUSE_SLOP_FACTOR`] of it, or `None` when
  /// no suitable buffer is free. The caller must eventually [`release`]
  /// the buffer (or drop it, forfeiting reuse).
  ///
  /// [`release`]: BitmapPool::release
  pub fn acquire(&self, width: u32, height: u32) -> Option<PixelBuffer> {
    let needed = width as u64 * height as u64 * 4;
    if needed == 0 {
      return None;
    }
    let mut state = self.state.lock().ok()?;

    // Smallest free capacity that can hold the request without waste
    // beyond the slop factor.
    let capacity = state
      .free
      .range(needed..=needed.saturating_mul(REUSE_SLOP_FACTOR))
      .find(|(_, buffers)| !buffers.is_empty())
      .map(|(&capacity, _)| capacity)?;

    let buffers = state.free.get_mut(&capacity)?;
    let mut pooled = buffers.pop()?;
    if buffers.is_empty() {
      state.free.remove(&capacity);
    }
    state.total_bytes = state.total_bytes.saturating_sub(capacity);
    state.checked_out.insert(pooled.id);

    pooled.data.clear();
    pooled.data.resize(needed as usize, 0);
    let mut buffer = PixelBuffer::from_vec(width, height, pooled.data);
    buffer.pool_id = Some(pooled.id);
    Some(buffer)
  }

  /// Return a buffer to the pool.
  ///
  /// Buffers the pool never handed out (no pool id) are adopted if there
  /// is room. A buffer whose id is not currently checked out indicates a
  /// double release; it is logged and dropped.
  pub fn release(&self, buffer: PixelBuffer) {
    let pool_id = buffer.pool_id;
    let data = buffer.into_vec();
    let capacity = data.capacity() as u64;
    if capacity == 0 {
      return;
    }

    let Ok(mut state) = self.state.lock() else {
      return;
    };

    let id = match pool_id {
      Some(id) => {
        if !state.checked_out.remove(&id) {
          tracing::warn!(id, "release of a buffer that is not checked out; dropping");
          return;
        }
        id
      }
      None => self.next_id.fetch_add(1, Ordering::Relaxed),
    };

    if state.total_bytes.saturating_add(capacity) > self.max_bytes {
      // Pool full; let the allocation drop.
      return;
    }
    state.total_bytes += capacity;
    state.free.entry(capacity).or_default().push(PooledBuffer { id, data });
  }
}
