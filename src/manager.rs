//! Request coordination and result fan-out
//!
//! [`FetchManager`] deduplicates concurrent downloads of the same resource,
//! tracks the listeners interested in each in-flight fetch, and fans the
//! outcome out to everyone still registered. Cache hits are delivered through
//! the same worker pool as network results so callers see one asynchronous
//! callback discipline for both paths.
//!
//! Cancellation removes interest, not work: an in-flight fetch always runs to
//! completion and populates the cache, but a cancelled listener's callbacks
//! are guaranteed not to run once `cancel` has returned. That guarantee is
//! implemented with per-registration delivery gates: a gate's listener slot is
//! either consumed exactly once by delivery or emptied by `cancel`, and
//! `cancel` waits out a delivery that is already executing.

use crate::cache::{ImageStore, ImageStoreConfig};
use crate::decode::{self, DecodedImage, DEFAULT_MAX_DECODED_PIXELS};
use crate::error::{Error, FetchError, Result};
use crate::fingerprint::{Fingerprint, TargetSize};
use crate::pool::WorkerPool;
use crate::resource::{HttpFetcher, ResourceFetcher};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Callbacks delivered to a downloader.
///
/// Exactly one of `on_success` / `on_failure` fires per `download` call that
/// is not cancelled before delivery; never both, never more than once.
/// Callbacks run on worker threads.
pub trait FetchListener: Send + Sync {
  fn on_success(&self, image: &Arc<DecodedImage>, url: &str);
  fn on_failure(&self, url: &str, error: &Error);
}

/// Per-call options for [`FetchManager::download`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
  /// Requested output dimensions; native when unset.
  pub target: TargetSize,
  /// Restrict the cache read to the memory tier, forcing a network fetch
  /// when only the persistent tier holds the entry. The write path is
  /// unaffected: a successful fetch still updates both tiers.
  pub refresh_cached: bool,
}

impl DownloadOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_target(mut self, target: TargetSize) -> Self {
    self.target = target;
    self
  }

  pub fn with_refresh_cached(mut self, refresh: bool) -> Self {
    self.refresh_cached = refresh;
    self
  }
}

/// Configuration for [`FetchManager`].
#[derive(Debug, Clone)]
pub struct FetchManagerConfig {
  /// Number of worker threads (simultaneous fetch/decode operations).
  pub workers: usize,
  /// Memory tier capacity in decoded bytes. `0` disables the memory tier.
  pub memory_capacity_bytes: usize,
  /// Persistent tier directory. `None` disables the persistent tier.
  pub disk_dir: Option<PathBuf>,
  /// Persistent tier quota in bytes. `0` disables eviction.
  pub disk_max_bytes: u64,
  /// Decoded-pixel guard. `0` disables the guard.
  pub max_decoded_pixels: u64,
  /// Timeout applied to the built-in HTTP fetcher. Ignored when a custom
  /// fetcher is supplied.
  pub fetch_timeout: Duration,
}

impl Default for FetchManagerConfig {
  fn default() -> Self {
    Self {
      workers: 4,
      memory_capacity_bytes: crate::cache::memory::DEFAULT_MEMORY_CAPACITY_BYTES,
      disk_dir: None,
      disk_max_bytes: crate::cache::disk::DEFAULT_DISK_MAX_BYTES,
      max_decoded_pixels: DEFAULT_MAX_DECODED_PIXELS,
      fetch_timeout: Duration::from_secs(30),
    }
  }
}

impl FetchManagerConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }

  pub fn with_memory_capacity_bytes(mut self, capacity: usize) -> Self {
    self.memory_capacity_bytes = capacity;
    self
  }

  pub fn with_disk_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.disk_dir = Some(dir.into());
    self
  }

  pub fn with_disk_max_bytes(mut self, max_bytes: u64) -> Self {
    self.disk_max_bytes = max_bytes;
    self
  }

  pub fn with_max_decoded_pixels(mut self, max: u64) -> Self {
    self.max_decoded_pixels = max;
    self
  }

  pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
    self.fetch_timeout = timeout;
    self
  }
}

/// Opaque listener identity: the allocation address of the caller's
/// `Arc<dyn FetchListener>`. Compared only for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenerKey(usize);

impl ListenerKey {
  fn of(listener: &Arc<dyn FetchListener>) -> Self {
    Self(Arc::as_ptr(listener) as *const () as usize)
  }
}

#[derive(Clone)]
enum FetchOutcome {
  Success(Arc<DecodedImage>),
  Failure(Arc<Error>),
}

/// One registration's delivery slot.
///
/// The slot is consumed exactly once by delivery or emptied by `revoke`. The
/// condvar lets `revoke` wait for a delivery that is already running on
/// another thread, which is what makes "no callback after `cancel` returns"
/// hold.
struct DeliveryGate {
  state: Mutex<GateState>,
  delivered: Condvar,
}

struct GateState {
  listener: Option<Arc<dyn FetchListener>>,
  delivering: Option<ThreadId>,
}

impl DeliveryGate {
  fn new(listener: Arc<dyn FetchListener>) -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(GateState {
        listener: Some(listener),
        delivering: None,
      }),
      delivered: Condvar::new(),
    })
  }

  fn deliver(&self, outcome: &FetchOutcome, url: &str) {
    let listener = {
      let Ok(mut state) = self.state.lock() else {
        return;
      };
      let Some(listener) = state.listener.take() else {
        return;
      };
      state.delivering = Some(thread::current().id());
      listener
    };

    // A panicking listener must not wedge revoke() on another thread.
    let result = catch_unwind(AssertUnwindSafe(|| match outcome {
      FetchOutcome::Success(image) => listener.on_success(image, url),
      FetchOutcome::Failure(error) => listener.on_failure(url, error),
    }));
    if result.is_err() {
      tracing::warn!(url, "listener callback panicked");
    }

    if let Ok(mut state) = self.state.lock() {
      state.delivering = None;
    }
    self.delivered.notify_all();
  }

  /// Empty the slot and wait for any in-progress delivery to finish.
  ///
  /// When called from inside the listener's own callback (same thread) the
  /// wait is skipped: the running delivery is the current stack frame and no
  /// further one can start once the slot is empty.
  fn revoke(&self) {
    let Ok(mut state) = self.state.lock() else {
      return;
    };
    state.listener = None;
    while let Some(thread_id) = state.delivering {
      if thread_id == thread::current().id() {
        break;
      }
      match self.delivered.wait(state) {
        Ok(next) => state = next,
        Err(_) => return,
      }
    }
  }
}

struct Registration {
  key: ListenerKey,
  gate: Arc<DeliveryGate>,
}

/// Listeners awaiting a fetch. The map entry itself is the in-flight marker:
/// it is created when the fetch job is submitted and removed only by
/// completion, so cancellation can empty the listener list without ever
/// allowing a duplicate fetch for the same fingerprint.
struct PendingRequest {
  url: String,
  listeners: Vec<Registration>,
}

#[derive(Default)]
struct CoordinatorState {
  pending: HashMap<Fingerprint, PendingRequest>,
  /// Every live gate per listener, covering both pending fetches and queued
  /// cache-hit deliveries, so `cancel` can neutralize all of them.
  gates: HashMap<ListenerKey, Vec<Arc<DeliveryGate>>>,
}

struct Inner {
  state: Mutex<CoordinatorState>,
  store: ImageStore,
  fetcher: Arc<dyn ResourceFetcher>,
  max_decoded_pixels: u64,
}

/// The fetch/cache manager.
///
/// Explicitly constructed and owned; there is no process-wide instance. Drop
/// shuts the worker pool down after queued jobs drain.
///
/// # Example
///
/// ```rust,no_run
/// # use picfetch::{DownloadOptions, FetchManager, FetchManagerConfig};
/// # use std::sync::Arc;
/// # fn demo(listener: Arc<dyn picfetch::FetchListener>) {
/// let manager = FetchManager::new(FetchManagerConfig::new().with_workers(2));
/// manager.download("https://example.com/a.png", &listener, DownloadOptions::new());
/// // ... later, if the caller loses interest:
/// manager.cancel(&listener);
/// # }
/// ```
pub struct FetchManager {
  inner: Arc<Inner>,
  pool: WorkerPool,
}

impl FetchManager {
  /// Create a manager using the built-in [`HttpFetcher`].
  pub fn new(config: FetchManagerConfig) -> Self {
    let fetcher = Arc::new(HttpFetcher::new().with_timeout(config.fetch_timeout));
    Self::with_fetcher(fetcher, config)
  }

  /// Create a manager with a custom byte fetcher (mocks, offline modes, ...).
  pub fn with_fetcher(fetcher: Arc<dyn ResourceFetcher>, config: FetchManagerConfig) -> Self {
    let store = ImageStore::new(
      ImageStoreConfig {
        memory_capacity_bytes: config.memory_capacity_bytes,
        disk_dir: config.disk_dir.clone(),
        disk: crate::cache::disk::DiskCacheConfig {
          max_bytes: config.disk_max_bytes,
        },
        max_decoded_pixels: config.max_decoded_pixels,
      },
    );
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(CoordinatorState::default()),
        store,
        fetcher,
        max_decoded_pixels: config.max_decoded_pixels,
      }),
      pool: WorkerPool::new(config.workers, "picfetch-worker"),
    }
  }

  /// Request a resource for `listener`.
  ///
  /// Never blocks on I/O: a memory-tier hit is queued for asynchronous
  /// delivery, and a miss registers the listener, submitting a worker job
  /// only when no job for this fingerprint is already in flight. The worker
  /// consults the persistent tier before falling back to the network, so disk
  /// reads and decodes never run on the caller's thread. An empty URL is
  /// reported through the failure callback like any other fetch error.
  pub fn download(&self, url: &str, listener: &Arc<dyn FetchListener>, options: DownloadOptions) {
    let key = ListenerKey::of(listener);

    if url.is_empty() {
      let error = Arc::new(Error::Fetch(FetchError::InvalidUrl {
        url: String::new(),
        reason: "empty URL".to_string(),
      }));
      self.queue_delivery(key, Arc::clone(listener), FetchOutcome::Failure(error), String::new());
      return;
    }

    let fingerprint = Fingerprint::compute(url, options.target);

    if let Some(image) = self.inner.store.peek_memory(&fingerprint) {
      tracing::debug!(url, %fingerprint, "memory cache hit");
      self.queue_delivery(key, Arc::clone(listener), FetchOutcome::Success(image), url.to_string());
      return;
    }

    let gate = DeliveryGate::new(Arc::clone(listener));
    let submit = {
      let mut state = self.inner.state.lock().expect("coordinator lock");
      state.gates.entry(key).or_default().push(Arc::clone(&gate));
      let registration = Registration {
        key,
        gate,
      };
      match state.pending.get_mut(&fingerprint) {
        Some(pending) => {
          pending.listeners.push(registration);
          false
        }
        None => {
          state.pending.insert(
            fingerprint.clone(),
            PendingRequest {
              url: url.to_string(),
              listeners: vec![registration],
            },
          );
          true
        }
      }
    };

    if submit {
      tracing::debug!(url, %fingerprint, "submitting fetch");
      let inner = Arc::clone(&self.inner);
      let target = options.target;
      let use_disk = !options.refresh_cached;
      self.pool.execute(move || inner.run_fetch(fingerprint, target, use_disk));
    } else {
      tracing::debug!(url, %fingerprint, "joined in-flight fetch");
    }
  }

  /// Remove every registration of `listener`, across all fingerprints.
  ///
  /// Idempotent; cancelling a listener that was never registered is a no-op.
  /// Does not cancel in-flight network work. Once this returns, no callback
  /// for `listener` will run.
  pub fn cancel(&self, listener: &Arc<dyn FetchListener>) {
    let key = ListenerKey::of(listener);
    let gates = {
      let mut state = self.inner.state.lock().expect("coordinator lock");
      for pending in state.pending.values_mut() {
        pending.listeners.retain(|registration| registration.key != key);
      }
      state.gates.remove(&key).unwrap_or_default()
    };
    // Outside the coordinator lock: revoking may wait for a delivery that is
    // mid-callback, and callbacks are free to call back into the manager.
    for gate in gates {
      gate.revoke();
    }
  }

  /// Fingerprint for `(url, target)`, or `None` for an empty URL.
  ///
  /// Lets a caller probe cache state (via [`ImageStore::peek_memory`])
  /// without registering interest.
  pub fn cache_key(&self, url: &str, target: TargetSize) -> Option<Fingerprint> {
    if url.is_empty() {
      return None;
    }
    Some(Fingerprint::compute(url, target))
  }

  /// The underlying two-tier store.
  pub fn store(&self) -> &ImageStore {
    &self.inner.store
  }

  /// Route a single-listener delivery through the worker pool, keeping cache
  /// hits on the same asynchronous callback path as network results.
  fn queue_delivery(
    &self,
    key: ListenerKey,
    listener: Arc<dyn FetchListener>,
    outcome: FetchOutcome,
    url: String,
  ) {
    let gate = DeliveryGate::new(listener);
    {
      let mut state = self.inner.state.lock().expect("coordinator lock");
      state.gates.entry(key).or_default().push(Arc::clone(&gate));
    }
    let inner = Arc::clone(&self.inner);
    self.pool.execute(move || {
      gate.deliver(&outcome, &url);
      inner.release_gate(key, &gate);
    });
  }
}

impl Inner {
  /// Worker entry point for a memory-tier miss. Tries the persistent tier
  /// first (unless the request asked for a refresh), then the network.
  fn run_fetch(self: Arc<Self>, fingerprint: Fingerprint, target: TargetSize, use_disk: bool) {
    let url = {
      let state = self.state.lock().expect("coordinator lock");
      match state.pending.get(&fingerprint) {
        Some(pending) => pending.url.clone(),
        // Completed elsewhere; nothing to do.
        None => return,
      }
    };

    if use_disk {
      if let Some(image) = self.store.get(&fingerprint, target) {
        tracing::debug!(url, %fingerprint, "promoted persistent tier entry");
        self.complete(&fingerprint, &url, FetchOutcome::Success(image));
        return;
      }
    }

    let outcome = match self.fetch_and_decode(&url, target) {
      Ok((image, raw_bytes, content_type)) => {
        // Store before fan-out so a download racing the delivery hits the
        // cache instead of re-registering.
        self.store.put(
          &fingerprint,
          Arc::clone(&image),
          &raw_bytes,
          &url,
          content_type.as_deref(),
        );
        FetchOutcome::Success(image)
      }
      Err(error) => {
        tracing::debug!(url, %error, "fetch failed");
        FetchOutcome::Failure(Arc::new(error))
      }
    };

    self.complete(&fingerprint, &url, outcome);
  }

  fn fetch_and_decode(
    &self,
    url: &str,
    target: TargetSize,
  ) -> Result<(Arc<DecodedImage>, Vec<u8>, Option<String>)> {
    let resource = self.fetcher.fetch(url)?;
    let decoded = decode::decode_and_scale(&resource.bytes, target, self.max_decoded_pixels, url)?;
    Ok((Arc::new(decoded), resource.bytes, resource.content_type))
  }

  /// Remove the pending entry and fan the outcome out, in registration
  /// order. An empty listener list (everyone cancelled) delivers to nobody.
  fn complete(&self, fingerprint: &Fingerprint, url: &str, outcome: FetchOutcome) {
    let registrations = {
      let mut state = self.state.lock().expect("coordinator lock");
      state
        .pending
        .remove(fingerprint)
        .map(|pending| pending.listeners)
        .unwrap_or_default()
    };

    for registration in registrations {
      registration.gate.deliver(&outcome, url);
      self.release_gate(registration.key, &registration.gate);
    }
  }

  /// Drop a gate from the per-listener index once it can no longer fire.
  fn release_gate(&self, key: ListenerKey, gate: &Arc<DeliveryGate>) {
    let mut state = self.state.lock().expect("coordinator lock");
    if let Some(gates) = state.gates.get_mut(&key) {
      gates.retain(|candidate| !Arc::ptr_eq(candidate, gate));
      if gates.is_empty() {
        state.gates.remove(&key);
      }
    }
  }
}
