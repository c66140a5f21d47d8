//! Byte-bounded LRU memory tier
//!
//! Entries are decoded images shared behind `Arc`; eviction drops the cache's
//! reference only, so images already handed to listeners stay alive. The lock
//! guards map bookkeeping exclusively; no I/O happens under it.

use crate::decode::DecodedImage;
use crate::fingerprint::Fingerprint;
use lru::LruCache;
use std::sync::{Arc, Mutex};

/// Default memory tier capacity: 32 MiB of decoded pixels.
pub const DEFAULT_MEMORY_CAPACITY_BYTES: usize = 32 * 1024 * 1024;

pub struct MemoryCache {
  state: Mutex<MemoryState>,
}

struct MemoryState {
  entries: LruCache<Fingerprint, Arc<DecodedImage>>,
  total_bytes: usize,
  capacity_bytes: usize,
}

impl MemoryCache {
  /// `capacity_bytes == 0` disables the memory tier entirely.
  pub fn new(capacity_bytes: usize) -> Self {
    Self {
      state: Mutex::new(MemoryState {
        entries: LruCache::unbounded(),
        total_bytes: 0,
        capacity_bytes,
      }),
    }
  }

  /// Look up an entry, marking it most-recently-used.
  pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<DecodedImage>> {
    let mut state = self.state.lock().ok()?;
    state.entries.get(fingerprint).cloned()
  }

  /// Insert an entry, evicting least-recently-used entries until the tracked
  /// total fits the capacity. Entries larger than the whole capacity are not
  /// admitted.
  pub fn put(&self, fingerprint: Fingerprint, image: Arc<DecodedImage>) {
    let Ok(mut state) = self.state.lock() else {
      return;
    };
    if state.capacity_bytes == 0 || image.byte_size > state.capacity_bytes {
      return;
    }

    let added = image.byte_size;
    if let Some(previous) = state.entries.put(fingerprint, image) {
      state.total_bytes = state.total_bytes.saturating_sub(previous.byte_size);
    }
    state.total_bytes += added;

    while state.total_bytes > state.capacity_bytes {
      match state.entries.pop_lru() {
        Some((_, evicted)) => {
          state.total_bytes = state.total_bytes.saturating_sub(evicted.byte_size);
        }
        None => break,
      }
    }
  }

  /// Drop a single entry, if present.
  pub fn invalidate(&self, fingerprint: &Fingerprint) {
    if let Ok(mut state) = self.state.lock() {
      if let Some(removed) = state.entries.pop(fingerprint) {
        state.total_bytes = state.total_bytes.saturating_sub(removed.byte_size);
      }
    }
  }

  /// Current tracked byte total.
  pub fn total_bytes(&self) -> usize {
    self.state.lock().map(|s| s.total_bytes).unwrap_or(0)
  }

  pub fn len(&self) -> usize {
    self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
