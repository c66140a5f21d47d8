//! Bounded FIFO worker pool
//!
//! Fixed set of named worker threads draining one shared channel, so the
//! number of simultaneous fetch/decode operations is capped and queued jobs
//! run in submission order. Dropping the pool closes the channel; workers
//! finish the job they hold and exit, and the drop joins them.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
  sender: Option<Sender<Job>>,
  workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub(crate) fn new(worker_count: usize, name_prefix: &str) -> Self {
    let worker_count = worker_count.max(1);
    let (sender, receiver) = channel::<Job>();
    let receiver = Arc::new(Mutex::new(receiver));

    let mut workers = Vec::with_capacity(worker_count);
    for index in 0..worker_count {
      let receiver = Arc::clone(&receiver);
      let handle = thread::Builder::new()
        .name(format!("{name_prefix}-{index}"))
        .spawn(move || worker_loop(&receiver))
        .expect("spawn worker thread");
      workers.push(handle);
    }

    Self {
      sender: Some(sender),
      workers,
    }
  }

  /// Queue a job. Jobs submitted after the pool started shutting down are
  /// silently dropped.
  pub(crate) fn execute<F>(&self, job: F)
  where
    F: FnOnce() + Send + 'static,
  {
    if let Some(sender) = &self.sender {
      let _ = sender.send(Box::new(job));
    }
  }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
  loop {
    // Hold the receiver lock only while dequeueing, never while running.
    let job = match receiver.lock() {
      Ok(guard) => guard.recv(),
      Err(_) => return,
    };
    match job {
      Ok(job) => job(),
      Err(_) => return,
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.sender.take();
    for handle in self.workers.drain(..) {
      let _ = handle.join();
    }
  }
}
