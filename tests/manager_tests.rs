//! End-to-end tests for [`FetchManager`]: deduplication, cancellation,
//! cache round-trips, and failure delivery, driven by an in-process fetcher.

use image::{ImageFormat, RgbaImage};
use picfetch::{
  DownloadOptions, Error, FetchError, FetchListener, FetchManager, FetchManagerConfig,
  FetchedResource, ResourceFetcher, TargetSize,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(300);

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
  let image = RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
  let mut out = Vec::new();
  image
    .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
    .expect("encode png");
  out
}

/// Serves the same PNG for every URL, counting calls. When gated, `fetch`
/// blocks after signalling start until `release` is called.
struct StubFetcher {
  bytes: Vec<u8>,
  calls: AtomicUsize,
  started: Mutex<Option<Sender<()>>>,
  gate: Option<(Mutex<bool>, Condvar)>,
}

impl StubFetcher {
  fn new(bytes: Vec<u8>) -> Self {
    Self {
      bytes,
      calls: AtomicUsize::new(0),
      started: Mutex::new(None),
      gate: None,
    }
  }

  /// Gated variant: returns the fetcher plus a receiver that fires once per
  /// fetch entering the gate.
  fn gated(bytes: Vec<u8>) -> (Self, Receiver<()>) {
    let (tx, rx) = mpsc::channel();
    let fetcher = Self {
      bytes,
      calls: AtomicUsize::new(0),
      started: Mutex::new(Some(tx)),
      gate: Some((Mutex::new(false), Condvar::new())),
    };
    (fetcher, rx)
  }

  fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn release(&self) {
    if let Some((flag, condvar)) = &self.gate {
      *flag.lock().unwrap() = true;
      condvar.notify_all();
    }
  }
}

impl ResourceFetcher for StubFetcher {
  fn fetch(&self, _url: &str) -> picfetch::Result<FetchedResource> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(tx) = self.started.lock().unwrap().as_ref() {
      let _ = tx.send(());
    }
    if let Some((flag, condvar)) = &self.gate {
      let mut released = flag.lock().unwrap();
      while !*released {
        released = condvar.wait(released).unwrap();
      }
    }
    Ok(FetchedResource::new(
      self.bytes.clone(),
      Some("image/png".to_string()),
    ))
  }
}

struct FailingFetcher;

impl ResourceFetcher for FailingFetcher {
  fn fetch(&self, url: &str) -> picfetch::Result<FetchedResource> {
    Err(
      FetchError::Status {
        url: url.to_string(),
        status: 503,
      }
      .into(),
    )
  }
}

#[derive(Debug, PartialEq)]
enum Event {
  Success {
    label: &'static str,
    url: String,
    width: u32,
    height: u32,
    image_addr: usize,
  },
  Failure {
    label: &'static str,
    url: String,
  },
}

struct RecordingListener {
  label: &'static str,
  tx: Mutex<Sender<Event>>,
}

impl RecordingListener {
  fn new(label: &'static str, tx: Sender<Event>) -> Arc<dyn FetchListener> {
    Arc::new(Self {
      label,
      tx: Mutex::new(tx),
    })
  }
}

impl FetchListener for RecordingListener {
  fn on_success(&self, image: &Arc<picfetch::DecodedImage>, url: &str) {
    let (width, height) = image.dimensions();
    let _ = self.tx.lock().unwrap().send(Event::Success {
      label: self.label,
      url: url.to_string(),
      width,
      height,
      image_addr: Arc::as_ptr(image) as *const () as usize,
    });
  }

  fn on_failure(&self, url: &str, _error: &Error) {
    let _ = self.tx.lock().unwrap().send(Event::Failure {
      label: self.label,
      url: url.to_string(),
    });
  }
}

fn memory_only_config() -> FetchManagerConfig {
  FetchManagerConfig::new().with_workers(2)
}

#[test]
fn download_delivers_decoded_image() {
  let fetcher = Arc::new(StubFetcher::new(png_bytes(16, 9)));
  let manager = FetchManager::with_fetcher(fetcher.clone(), memory_only_config());

  let (tx, rx) = mpsc::channel();
  let listener = RecordingListener::new("a", tx);
  manager.download("https://img.test/one.png", &listener, DownloadOptions::new());

  match rx.recv_timeout(WAIT).expect("callback") {
    Event::Success {
      url, width, height, ..
    } => {
      assert_eq!(url, "https://img.test/one.png");
      assert_eq!((width, height), (16, 9));
    }
    other => panic!("expected success, got {other:?}"),
  }
  assert_eq!(fetcher.calls(), 1);
}

#[test]
fn concurrent_downloads_share_one_fetch() {
  let (fetcher, started) = StubFetcher::gated(png_bytes(4, 4));
  let fetcher = Arc::new(fetcher);
  let manager = FetchManager::with_fetcher(fetcher.clone(), memory_only_config());

  let (tx, rx) = mpsc::channel();
  let first = RecordingListener::new("a", tx.clone());
  let second = RecordingListener::new("b", tx);
  let url = "https://img.test/shared.png";

  manager.download(url, &first, DownloadOptions::new());
  started.recv_timeout(WAIT).expect("fetch started");
  // The fetch is blocked in the gate; this registration must join it.
  manager.download(url, &second, DownloadOptions::new());
  fetcher.release();

  let events = [
    rx.recv_timeout(WAIT).expect("first callback"),
    rx.recv_timeout(WAIT).expect("second callback"),
  ];
  let addrs: Vec<(&'static str, usize)> = events
    .iter()
    .map(|event| match event {
      Event::Success {
        label, image_addr, ..
      } => (*label, *image_addr),
      other => panic!("expected success, got {other:?}"),
    })
    .collect();

  // Registration-order fan-out, one shared decoded image.
  assert_eq!(addrs[0].0, "a");
  assert_eq!(addrs[1].0, "b");
  assert_eq!(addrs[0].1, addrs[1].1);
  assert_eq!(fetcher.calls(), 1);
}

#[test]
fn cancel_before_completion_suppresses_callbacks_but_not_the_fetch() {
  let (fetcher, started) = StubFetcher::gated(png_bytes(4, 4));
  let fetcher = Arc::new(fetcher);
  let manager = FetchManager::with_fetcher(fetcher.clone(), memory_only_config());

  let (tx, rx) = mpsc::channel();
  let cancelled = RecordingListener::new("cancelled", tx.clone());
  let kept = RecordingListener::new("kept", tx);
  let url = "https://img.test/cancel.png";

  manager.download(url, &cancelled, DownloadOptions::new());
  started.recv_timeout(WAIT).expect("fetch started");
  manager.download(url, &kept, DownloadOptions::new());
  manager.cancel(&cancelled);
  fetcher.release();

  match rx.recv_timeout(WAIT).expect("surviving callback") {
    Event::Success { label, .. } => assert_eq!(label, "kept"),
    other => panic!("expected success, got {other:?}"),
  }
  // The cancelled listener never hears anything.
  assert_eq!(rx.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));
  // The fetch itself ran to completion and populated the cache.
  assert_eq!(fetcher.calls(), 1);
  let key = manager.cache_key(url, TargetSize::native()).expect("key");
  assert!(manager.store().peek_memory(&key).is_some());
}

#[test]
fn cancelling_every_listener_still_caches_the_result() {
  let (fetcher, started) = StubFetcher::gated(png_bytes(4, 4));
  let fetcher = Arc::new(fetcher);
  let manager = FetchManager::with_fetcher(fetcher.clone(), memory_only_config());

  let (tx, rx) = mpsc::channel();
  let listener = RecordingListener::new("only", tx);
  let url = "https://img.test/abandoned.png";

  manager.download(url, &listener, DownloadOptions::new());
  started.recv_timeout(WAIT).expect("fetch started");
  manager.cancel(&listener);
  fetcher.release();

  assert_eq!(rx.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));
  let key = manager.cache_key(url, TargetSize::native()).expect("key");
  // Poll briefly; the worker finishes the store write after release().
  let deadline = std::time::Instant::now() + WAIT;
  while manager.store().peek_memory(&key).is_none() {
    assert!(std::time::Instant::now() < deadline, "result never cached");
    std::thread::sleep(Duration::from_millis(10));
  }
  assert_eq!(fetcher.calls(), 1);
}

#[test]
fn second_download_is_served_from_cache() {
  let fetcher = Arc::new(StubFetcher::new(png_bytes(8, 8)));
  let manager = FetchManager::with_fetcher(fetcher.clone(), memory_only_config());
  let url = "https://img.test/reuse.png";

  let (tx, rx) = mpsc::channel();
  let first = RecordingListener::new("a", tx.clone());
  manager.download(url, &first, DownloadOptions::new());
  rx.recv_timeout(WAIT).expect("first callback");

  let second = RecordingListener::new("b", tx);
  manager.download(url, &second, DownloadOptions::new());
  rx.recv_timeout(WAIT).expect("second callback");

  assert_eq!(fetcher.calls(), 1);
}

#[test]
fn refresh_cached_skips_the_persistent_tier() {
  let dir = tempfile::tempdir().expect("tempdir");
  let fetcher = Arc::new(StubFetcher::new(png_bytes(8, 8)));
  let config = memory_only_config().with_disk_dir(dir.path());
  let manager = FetchManager::with_fetcher(fetcher.clone(), config);
  let url = "https://img.test/refresh.png";
  let (tx, rx) = mpsc::channel();

  let first = RecordingListener::new("a", tx.clone());
  manager.download(url, &first, DownloadOptions::new());
  rx.recv_timeout(WAIT).expect("initial fetch");
  assert_eq!(fetcher.calls(), 1);

  let key = manager.cache_key(url, TargetSize::native()).expect("key");

  // Memory dropped, disk intact: a normal download promotes from disk.
  manager.store().invalidate_memory(&key);
  let second = RecordingListener::new("b", tx.clone());
  manager.download(url, &second, DownloadOptions::new());
  rx.recv_timeout(WAIT).expect("disk-served callback");
  assert_eq!(fetcher.calls(), 1);

  // Memory dropped again: refresh mode ignores disk and refetches.
  manager.store().invalidate_memory(&key);
  let third = RecordingListener::new("c", tx);
  manager.download(
    url,
    &third,
    DownloadOptions::new().with_refresh_cached(true),
  );
  rx.recv_timeout(WAIT).expect("refetched callback");
  assert_eq!(fetcher.calls(), 2);
}

#[test]
fn disk_promotion_runs_on_worker_threads() {
  let dir = tempfile::tempdir().expect("tempdir");
  let (fetcher, started) = StubFetcher::gated(png_bytes(4, 4));
  let fetcher = Arc::new(fetcher);
  let config = FetchManagerConfig::new()
    .with_workers(1)
    .with_disk_dir(dir.path());
  let manager = FetchManager::with_fetcher(fetcher.clone(), config);

  // Seed the persistent tier directly; the memory tier stays empty.
  let disk_url = "https://img.test/on-disk.png";
  let key = manager.cache_key(disk_url, TargetSize::native()).expect("key");
  manager
    .store()
    .disk()
    .expect("disk tier")
    .write(&key, &png_bytes(8, 8), disk_url, Some("image/png"));

  let (tx, rx) = mpsc::channel();
  // Occupy the only worker with a blocked network fetch.
  let net = RecordingListener::new("net", tx.clone());
  manager.download("https://img.test/blocked.png", &net, DownloadOptions::new());
  started.recv_timeout(WAIT).expect("fetch started");

  // If promotion ran on this thread the callback would already be queued;
  // instead the job sits behind the occupied worker.
  let disk = RecordingListener::new("disk", tx);
  manager.download(disk_url, &disk, DownloadOptions::new());
  assert_eq!(rx.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));

  fetcher.release();
  let first = rx.recv_timeout(WAIT).expect("network callback");
  let second = rx.recv_timeout(WAIT).expect("disk callback");
  match first {
    Event::Success { label, .. } => assert_eq!(label, "net"),
    other => panic!("expected success, got {other:?}"),
  }
  match second {
    Event::Success { label, width, height, .. } => {
      assert_eq!(label, "disk");
      assert_eq!((width, height), (8, 8));
    }
    other => panic!("expected success, got {other:?}"),
  }
  // The persistent hit never touched the network.
  assert_eq!(fetcher.calls(), 1);
}

/// A listener whose success callback blocks until released, so tests can
/// observe cancellation racing an executing delivery.
struct BlockingDeliveryListener {
  entered: Mutex<Sender<()>>,
  release: Arc<(Mutex<bool>, Condvar)>,
  deliveries: AtomicUsize,
}

impl FetchListener for BlockingDeliveryListener {
  fn on_success(&self, _image: &Arc<picfetch::DecodedImage>, _url: &str) {
    let _ = self.entered.lock().unwrap().send(());
    let (flag, condvar) = &*self.release;
    let mut released = flag.lock().unwrap();
    while !*released {
      released = condvar.wait(released).unwrap();
    }
    drop(released);
    self.deliveries.fetch_add(1, Ordering::SeqCst);
  }

  fn on_failure(&self, _url: &str, _error: &Error) {
    self.deliveries.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn cancel_waits_for_an_executing_delivery() {
  let manager = Arc::new(FetchManager::with_fetcher(
    Arc::new(StubFetcher::new(png_bytes(4, 4))),
    memory_only_config(),
  ));
  let (entered_tx, entered_rx) = mpsc::channel();
  let release = Arc::new((Mutex::new(false), Condvar::new()));
  let inner = Arc::new(BlockingDeliveryListener {
    entered: Mutex::new(entered_tx),
    release: Arc::clone(&release),
    deliveries: AtomicUsize::new(0),
  });
  let listener: Arc<dyn FetchListener> = inner.clone();

  manager.download(
    "https://img.test/slow-callback.png",
    &listener,
    DownloadOptions::new(),
  );
  entered_rx.recv_timeout(WAIT).expect("callback running");

  let (cancel_tx, cancel_rx) = mpsc::channel();
  let cancel_manager = Arc::clone(&manager);
  let cancel_listener = Arc::clone(&listener);
  let canceller = thread::spawn(move || {
    cancel_manager.cancel(&cancel_listener);
    let _ = cancel_tx.send(());
  });

  // The barrier: cancel must not return while the delivery is executing.
  assert_eq!(cancel_rx.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));
  assert_eq!(inner.deliveries.load(Ordering::SeqCst), 0);

  let (flag, condvar) = &*release;
  *flag.lock().unwrap() = true;
  condvar.notify_all();

  cancel_rx
    .recv_timeout(WAIT)
    .expect("cancel returned once the delivery finished");
  canceller.join().unwrap();
  assert_eq!(inner.deliveries.load(Ordering::SeqCst), 1);

  // Nothing further fires for the cancelled listener.
  thread::sleep(SETTLE);
  assert_eq!(inner.deliveries.load(Ordering::SeqCst), 1);
}

#[test]
fn failure_is_delivered_exactly_once() {
  let manager = FetchManager::with_fetcher(Arc::new(FailingFetcher), memory_only_config());
  let (tx, rx) = mpsc::channel();
  let listener = RecordingListener::new("a", tx);
  let url = "https://img.test/missing.png";

  manager.download(url, &listener, DownloadOptions::new());

  match rx.recv_timeout(WAIT).expect("failure callback") {
    Event::Failure { url: reported, .. } => assert_eq!(reported, url),
    other => panic!("expected failure, got {other:?}"),
  }
  assert_eq!(rx.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));

  // Failures are not cached; the next attempt fetches again.
  let key = manager.cache_key(url, TargetSize::native()).expect("key");
  assert!(manager.store().peek_memory(&key).is_none());
}

#[test]
fn empty_url_fails_through_the_callback() {
  let manager = FetchManager::with_fetcher(
    Arc::new(StubFetcher::new(png_bytes(4, 4))),
    memory_only_config(),
  );
  let (tx, rx) = mpsc::channel();
  let listener = RecordingListener::new("a", tx);

  manager.download("", &listener, DownloadOptions::new());

  match rx.recv_timeout(WAIT).expect("failure callback") {
    Event::Failure { url, .. } => assert_eq!(url, ""),
    other => panic!("expected failure, got {other:?}"),
  }
}

#[test]
fn target_sizes_are_distinct_cache_entries() {
  let fetcher = Arc::new(StubFetcher::new(png_bytes(16, 16)));
  let manager = FetchManager::with_fetcher(fetcher.clone(), memory_only_config());
  let url = "https://img.test/sized.png";
  let (tx, rx) = mpsc::channel();

  let native = RecordingListener::new("native", tx.clone());
  manager.download(url, &native, DownloadOptions::new());
  match rx.recv_timeout(WAIT).expect("native callback") {
    Event::Success { width, height, .. } => assert_eq!((width, height), (16, 16)),
    other => panic!("expected success, got {other:?}"),
  }

  let sized = RecordingListener::new("sized", tx);
  manager.download(
    url,
    &sized,
    DownloadOptions::new().with_target(TargetSize::new(8, 8)),
  );
  match rx.recv_timeout(WAIT).expect("sized callback") {
    Event::Success { width, height, .. } => assert_eq!((width, height), (8, 8)),
    other => panic!("expected success, got {other:?}"),
  }

  // Different fingerprints, so the second request fetched again.
  assert_eq!(fetcher.calls(), 2);
}

#[test]
fn cancel_is_idempotent_and_does_not_block_later_downloads() {
  let fetcher = Arc::new(StubFetcher::new(png_bytes(4, 4)));
  let manager = FetchManager::with_fetcher(fetcher.clone(), memory_only_config());
  let (tx, rx) = mpsc::channel();
  let listener = RecordingListener::new("a", tx);

  manager.cancel(&listener);
  manager.cancel(&listener);

  manager.download("https://img.test/after.png", &listener, DownloadOptions::new());
  match rx.recv_timeout(WAIT).expect("callback") {
    Event::Success { .. } => {}
    other => panic!("expected success, got {other:?}"),
  }
}

/// A listener that cancels itself from inside its own success callback.
/// Regression guard for self-deadlock in the cancel barrier.
struct SelfCancellingListener {
  manager: Arc<FetchManager>,
  me: Mutex<Option<Arc<dyn FetchListener>>>,
  done: Mutex<Sender<()>>,
}

impl FetchListener for SelfCancellingListener {
  fn on_success(&self, _image: &Arc<picfetch::DecodedImage>, _url: &str) {
    if let Some(me) = self.me.lock().unwrap().take() {
      self.manager.cancel(&me);
    }
    let _ = self.done.lock().unwrap().send(());
  }

  fn on_failure(&self, _url: &str, _error: &Error) {}
}

#[test]
fn cancel_from_inside_a_callback_does_not_deadlock() {
  let manager = Arc::new(FetchManager::with_fetcher(
    Arc::new(StubFetcher::new(png_bytes(4, 4))),
    memory_only_config(),
  ));
  let (tx, rx) = mpsc::channel();
  let inner = Arc::new(SelfCancellingListener {
    manager: Arc::clone(&manager),
    me: Mutex::new(None),
    done: Mutex::new(tx),
  });
  let listener: Arc<dyn FetchListener> = inner.clone();
  *inner.me.lock().unwrap() = Some(Arc::clone(&listener));

  manager.download("https://img.test/self.png", &listener, DownloadOptions::new());
  rx.recv_timeout(WAIT).expect("callback completed without deadlock");
}
