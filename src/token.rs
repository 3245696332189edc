//! Cooperative cancellation
//!
//! Each request owns a [`CancellationToken`]. Cancellation is cooperative:
//! the executor checks the token between pipeline stages, never preemptively.
//! Tokens are cheap to clone and safe to share across threads.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pipeline stages, in execution order.
///
/// Used for cancellation checkpoints and diagnostics. A request is in
/// exactly one stage at a time; transitions are strictly sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
  Pending,
  CacheCheck,
  Fetching,
  Decoding,
  Transforming,
  Delivering,
}

impl Stage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Pending => "pending",
      Stage::CacheCheck => "cache-check",
      Stage::Fetching => "fetching",
      Stage::Decoding => "decoding",
      Stage::Transforming => "transforming",
      Stage::Delivering => "delivering",
    }
  }
}

/// Shared cancellation flag for one request.
///
/// Cancelling is idempotent and one-way. For coalesced requests each
/// subscriber holds its own token; the shared execution is only cancelled
/// when the last interested subscriber cancels (see
/// [`crate::coalesce::RequestCoalescer`]).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
  cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Request cancellation. Takes effect at the next stage boundary.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  /// Stage-boundary checkpoint: maps a cancelled token to `Error::Cancelled`.
  pub fn check(&self, stage: Stage) -> Result<()> {
    if self.is_cancelled() {
      tracing::debug!(stage = stage.as_str(), "request cancelled at stage boundary");
      return Err(Error::Cancelled);
    }
    Ok(())
  }
}
