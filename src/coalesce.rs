//! In-flight request coalescing
//!
//! At most one execution runs per fingerprint at any instant. The first
//! caller to register becomes the owner and runs the producer; callers that
//! arrive while the entry exists become joiners and block on the shared
//! result. The result slot is written (and waiters notified) strictly
//! before the entry leaves the map, so a joiner that acquired the entry
//! concurrently with completion always observes the result.
//!
//! Interest counting drives cancellation: every subscriber (owner included)
//! holds one unit of interest. Releasing the last unit cancels the shared
//! execution token; releasing any earlier unit leaves the execution running
//! for the remaining subscribers.

use crate::error::{Error, Result};
use crate::token::CancellationToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// How often a blocked joiner re-checks its own cancellation token.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One in-flight execution: shared result slot plus subscriber bookkeeping.
pub struct InFlightEntry<T> {
  slot: Mutex<Option<Result<T>>>,
  cv: Condvar,
  interest: AtomicUsize,
  exec_token: CancellationToken,
}

impl<T: Clone> InFlightEntry<T> {
  fn new() -> Self {
    Self {
      slot: Mutex::new(None),
      cv: Condvar::new(),
      interest: AtomicUsize::new(1),
      exec_token: CancellationToken::new(),
    }
  }

  /// Token the owner threads through the pipeline. Cancelled only when the
  /// last interested subscriber goes away.
  pub fn execution_token(&self) -> CancellationToken {
    self.exec_token.clone()
  }

  /// Current number of interested subscribers.
  pub fn interest(&self) -> usize {
    self.interest.load(Ordering::SeqCst)
  }

  fn set(&self, result: Result<T>) {
    if let Ok(mut slot) = self.slot.lock() {
      *slot = Some(result);
      self.cv.notify_all();
    }
  }

  fn peek(&self) -> Option<Result<T>> {
    self.slot.lock().ok().and_then(|slot| slot.clone())
  }
}

/// Outcome of [`Coalescer::join_or_start`].
pub enum Join<T> {
  /// This caller is the sole executor for the fingerprint.
  Owner(Arc<InFlightEntry<T>>),
  /// An execution is already in flight; subscribe to its result.
  Joiner(Arc<InFlightEntry<T>>),
}

/// Fingerprint → in-flight execution map.
///
/// The map mutex is also the serialization point for interest accounting,
/// so a joiner can never slip in between "sole subscriber cancelled" and
/// "execution token cancelled".
pub struct Coalescer<T> {
  entries: Mutex<HashMap<String, Arc<InFlightEntry<T>>>>,
}

impl<T: Clone> Coalescer<T> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  /// Number of fingerprints currently executing.
  pub fn in_flight(&self) -> usize {
    self.entries.lock().map(|map| map.len()).unwrap_or(0)
  }

  /// Register interest in `fingerprint`, becoming the owner if nothing is
  /// in flight.
  pub fn join_or_start(&self, fingerprint: &str) -> Join<T> {
    let mut map = self.entries.lock().unwrap();
    if let Some(existing) = map.get(fingerprint) {
      existing.interest.fetch_add(1, Ordering::SeqCst);
      return Join::Joiner(Arc::clone(existing));
    }
    let entry = Arc::new(InFlightEntry::new());
    map.insert(fingerprint.to_string(), Arc::clone(&entry));
    Join::Owner(entry)
  }

  /// Broadcast the result to all subscribers, then retire the entry.
  ///
  /// Ordering is load-bearing: the slot is filled before the entry is
  /// removed from the map, so no joiner is lost in the gap.
  pub fn finish(&self, fingerprint: &str, entry: &Arc<InFlightEntry<T>>, result: Result<T>) {
    entry.set(result);
    if let Ok(mut map) = self.entries.lock() {
      if map
        .get(fingerprint)
        .map(|current| Arc::ptr_eq(current, entry))
        .unwrap_or(false)
      {
        map.remove(fingerprint);
      }
    }
  }

  /// Drop one unit of interest. Cancels the shared execution when the last
  /// unit is released.
  pub fn release_interest(&self, entry: &Arc<InFlightEntry<T>>) {
    let _guard = self.entries.lock().unwrap();
    if entry.interest.fetch_sub(1, Ordering::SeqCst) == 1 {
      entry.exec_token.cancel();
    }
  }

  /// Whether `entry` has exactly one interested subscriber, decided under
  /// the same lock that admits joiners.
  pub fn is_sole_subscriber(&self, entry: &Arc<InFlightEntry<T>>) -> bool {
    let _guard = self.entries.lock().unwrap();
    entry.interest.load(Ordering::SeqCst) == 1
  }

  /// Block until the shared result arrives or `own_token` is cancelled.
  ///
  /// A cancelled joiner releases its interest and gets `Error::Cancelled`;
  /// the shared execution keeps running for the remaining subscribers.
  pub fn wait(
    &self,
    entry: &Arc<InFlightEntry<T>>,
    own_token: &CancellationToken,
  ) -> Result<T> {
    let mut guard = entry.slot.lock().unwrap();
    loop {
      if let Some(result) = guard.as_ref() {
        return result.clone();
      }
      if own_token.is_cancelled() {
        drop(guard);
        self.release_interest(entry);
        return Err(Error::Cancelled);
      }
      let (next, _timeout) = entry.cv.wait_timeout(guard, JOIN_POLL_INTERVAL).unwrap();
      guard = next;
    }
  }
}

impl<T: Clone> Default for Coalescer<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Barrier;
  use std::thread;

  #[test]
  fn first_caller_is_owner() {
    let coalescer: Coalescer<u32> = Coalescer::new();
    match coalescer.join_or_start("f1") {
      Join::Owner(entry) => {
        assert_eq!(entry.interest(), 1);
        assert_eq!(coalescer.in_flight(), 1);
        coalescer.finish("f1", &entry, Ok(7));
        assert_eq!(coalescer.in_flight(), 0);
      }
      Join::Joiner(_) => panic!("expected owner"),
    }
  }

  #[test]
  fn joiner_receives_owner_result() {
    let coalescer: Arc<Coalescer<u32>> = Arc::new(Coalescer::new());
    let Join::Owner(owner_entry) = coalescer.join_or_start("f1") else {
      panic!("expected owner");
    };

    let joiner_coalescer = Arc::clone(&coalescer);
    let barrier = Arc::new(Barrier::new(2));
    let joiner_barrier = Arc::clone(&barrier);
    let joiner = thread::spawn(move || {
      let Join::Joiner(entry) = joiner_coalescer.join_or_start("f1") else {
        panic!("expected joiner");
      };
      joiner_barrier.wait();
      joiner_coalescer.wait(&entry, &CancellationToken::new())
    });

    barrier.wait();
    coalescer.finish("f1", &owner_entry, Ok(42));
    assert_eq!(joiner.join().unwrap().unwrap(), 42);
  }

  #[test]
  fn joiner_after_set_before_removal_still_receives() {
    let coalescer: Coalescer<u32> = Coalescer::new();
    let Join::Owner(entry) = coalescer.join_or_start("f1") else {
      panic!("expected owner");
    };
    // Simulate the completion window: slot filled, entry not yet removed.
    entry.set(Ok(9));

    let Join::Joiner(late) = coalescer.join_or_start("f1") else {
      panic!("entry should still be joinable");
    };
    assert_eq!(coalescer.wait(&late, &CancellationToken::new()).unwrap(), 9);
  }

  #[test]
  fn errors_are_broadcast() {
    let coalescer: Coalescer<u32> = Coalescer::new();
    let Join::Owner(entry) = coalescer.join_or_start("f1") else {
      panic!("expected owner");
    };
    let Join::Joiner(joiner) = coalescer.join_or_start("f1") else {
      panic!("expected joiner");
    };
    coalescer.finish("f1", &entry, Err(Error::Other("boom".to_string())));
    let err = coalescer.wait(&joiner, &CancellationToken::new()).unwrap_err();
    assert!(format!("{err}").contains("boom"));
  }

  #[test]
  fn cancelled_joiner_leaves_execution_running() {
    let coalescer: Coalescer<u32> = Coalescer::new();
    let Join::Owner(entry) = coalescer.join_or_start("f1") else {
      panic!("expected owner");
    };
    let Join::Joiner(joiner) = coalescer.join_or_start("f1") else {
      panic!("expected joiner");
    };
    assert_eq!(entry.interest(), 2);

    let own_token = CancellationToken::new();
    own_token.cancel();
    let result = coalescer.wait(&joiner, &own_token);
    assert!(matches!(result, Err(Error::Cancelled)));

    // Owner remains interested: the shared execution is not cancelled.
    assert_eq!(entry.interest(), 1);
    assert!(!entry.execution_token().is_cancelled());
  }

  #[test]
  fn last_release_cancels_execution() {
    let coalescer: Coalescer<u32> = Coalescer::new();
    let Join::Owner(entry) = coalescer.join_or_start("f1") else {
      panic!("expected owner");
    };
    coalescer.release_interest(&entry);
    assert!(entry.execution_token().is_cancelled());
  }

  #[test]
  fn sole_subscriber_check_tracks_joins() {
    let coalescer: Coalescer<u32> = Coalescer::new();
    let Join::Owner(entry) = coalescer.join_or_start("f1") else {
      panic!("expected owner");
    };
    assert!(coalescer.is_sole_subscriber(&entry));
    let Join::Joiner(_joiner) = coalescer.join_or_start("f1") else {
      panic!("expected joiner");
    };
    assert!(!coalescer.is_sole_subscriber(&entry));
  }

  #[test]
  fn finish_only_removes_own_generation() {
    let coalescer: Coalescer<u32> = Coalescer::new();
    let Join::Owner(first) = coalescer.join_or_start("f1") else {
      panic!("expected owner");
    };
    coalescer.finish("f1", &first, Ok(1));

    // A new generation registers under the same fingerprint.
    let Join::Owner(second) = coalescer.join_or_start("f1") else {
      panic!("expected new owner");
    };
    // A stale finish from the first generation must not evict it.
    coalescer.finish("f1", &first, Ok(1));
    assert_eq!(coalescer.in_flight(), 1);
    coalescer.finish("f1", &second, Ok(2));
    assert_eq!(coalescer.in_flight(), 0);
  }
}
