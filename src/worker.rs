//! Worker pools
//!
//! Two fixed pools back asynchronous request submission: an I/O pool that
//! runs the fetch-side pipeline stages (cache checks, coalescer waits,
//! network and disk reads) and a CPU pool that runs decode and transform
//! kernels. Jobs are plain boxed closures over an mpsc channel; the pool
//! joins its threads on drop.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
  /// Set inside pool threads so nested dispatch can run inline instead of
  /// deadlocking on its own pool.
  static ON_POOL_WORKER: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Fixed-size thread pool draining a shared job queue.
pub(crate) struct WorkerPool {
  sender: Mutex<Option<mpsc::Sender<Job>>>,
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
  pub fn new(name: &str, threads: usize) -> Self {
    let threads = threads.max(1);
    let (sender, receiver) = mpsc::channel::<Job>();
    let receiver = Arc::new(Mutex::new(receiver));

    let mut handles = Vec::with_capacity(threads);
    for i in 0..threads {
      let receiver = Arc::clone(&receiver);
      let handle = std::thread::Builder::new()
        .name(format!("{name}-{i}"))
        .spawn(move || {
          ON_POOL_WORKER.with(|flag| flag.set(true));
          loop {
            let job = {
              let guard = receiver.lock().unwrap();
              guard.recv()
            };
            match job {
              Ok(job) => job(),
              Err(_) => break,
            }
          }
        })
        .expect("spawn worker thread");
      handles.push(handle);
    }

    Self {
      sender: Mutex::new(Some(sender)),
      handles: Mutex::new(handles),
    }
  }

  /// Whether the calling thread belongs to any [`WorkerPool`].
  pub fn on_worker_thread() -> bool {
    ON_POOL_WORKER.with(|flag| flag.get())
  }

  /// Queue a job; runs it inline if the pool is shutting down.
  pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
    let sent = {
      let guard = self.sender.lock().unwrap();
      match guard.as_ref() {
        Some(sender) => sender.send(Box::new(job)).map_err(|e| e.0),
        None => Err(Box::new(job) as Job),
      }
    };
    if let Err(job) = sent {
      job();
    }
  }

  /// Run `job` on the pool and block for its output. Runs inline when the
  /// caller is already a pool worker, so pools never wait on themselves.
  pub fn run_and_wait<T, F>(&self, job: F) -> T
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
  {
    if Self::on_worker_thread() {
      return job();
    }
    let (tx, rx) = mpsc::channel();
    self.execute(move || {
      let _ = tx.send(job());
    });
    match rx.recv() {
      Ok(value) => value,
      // The worker died mid-job; nothing sensible to return.
      Err(err) => panic!("worker pool dropped a job: {err}"),
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    if let Ok(mut sender) = self.sender.lock() {
      sender.take();
    }
    if let Ok(mut handles) = self.handles.lock() {
      for handle in handles.drain(..) {
        let _ = handle.join();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn runs_queued_jobs() {
    let pool = WorkerPool::new("test", 2);
    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    for _ in 0..16 {
      let counter = Arc::clone(&counter);
      let tx = tx.clone();
      pool.execute(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(());
      });
    }
    for _ in 0..16 {
      rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 16);
  }

  #[test]
  fn run_and_wait_returns_value() {
    let pool = WorkerPool::new("test", 1);
    let value = pool.run_and_wait(|| 21 * 2);
    assert_eq!(value, 42);
  }

  #[test]
  fn nested_dispatch_runs_inline() {
    let pool = Arc::new(WorkerPool::new("test", 1));
    let inner_pool = Arc::clone(&pool);
    // With a single worker, a nested run_and_wait would deadlock unless it
    // runs inline on the worker thread.
    let value = pool.run_and_wait(move || inner_pool.run_and_wait(|| 7));
    assert_eq!(value, 7);
  }

  #[test]
  fn drop_joins_workers() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
      let pool = WorkerPool::new("test", 2);
      for _ in 0..8 {
        let counter = Arc::clone(&counter);
        pool.execute(move || {
          counter.fetch_add(1, Ordering::SeqCst);
        });
      }
    }
    // Pool dropped: all queued jobs must have completed.
    assert_eq!(counter.load(Ordering::SeqCst), 8);
  }
}
