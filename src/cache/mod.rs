//! Two-tier cache store
//!
//! The memory tier holds decoded images behind a byte-bounded LRU; the
//! persistent tier holds the fetched source bytes keyed by fingerprint. A
//! persistent hit is re-decoded through the same pure decode/resize step the
//! workers use and promoted into memory.

pub mod disk;
pub mod memory;

use crate::decode::{self, DecodedImage, DEFAULT_MAX_DECODED_PIXELS};
use crate::fingerprint::{Fingerprint, TargetSize};
use disk::{DiskCache, DiskCacheConfig};
use memory::{MemoryCache, DEFAULT_MEMORY_CAPACITY_BYTES};
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for [`ImageStore`].
#[derive(Debug, Clone)]
pub struct ImageStoreConfig {
  /// Memory tier capacity in decoded bytes. `0` disables the memory tier.
  pub memory_capacity_bytes: usize,
  /// Persistent tier directory. `None` disables the persistent tier.
  pub disk_dir: Option<PathBuf>,
  /// Persistent tier quota and policy.
  pub disk: DiskCacheConfig,
  /// Decoded-pixel guard applied when promoting persistent entries.
  pub max_decoded_pixels: u64,
}

impl Default for ImageStoreConfig {
  fn default() -> Self {
    Self {
      memory_capacity_bytes: DEFAULT_MEMORY_CAPACITY_BYTES,
      disk_dir: None,
      disk: DiskCacheConfig::default(),
      max_decoded_pixels: DEFAULT_MAX_DECODED_PIXELS,
    }
  }
}

impl ImageStoreConfig {
  pub fn new() -> Self {
    Self::default()
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
    self.disk.max_bytes = max_bytes;
    self
  }

  pub fn with_max_decoded_pixels(mut self, max: u64) -> Self {
    self.max_decoded_pixels = max;
    self
  }
}

pub struct ImageStore {
  memory: MemoryCache,
  disk: Option<DiskCache>,
  max_decoded_pixels: u64,
}

impl ImageStore {
  pub fn new(config: ImageStoreConfig) -> Self {
    let disk = config
      .disk_dir
      .map(|dir| DiskCache::new(dir, config.disk.clone()));
    Self {
      memory: MemoryCache::new(config.memory_capacity_bytes),
      disk,
      max_decoded_pixels: config.max_decoded_pixels,
    }
  }

  /// Full two-tier lookup. A persistent hit is decoded for `target` and
  /// promoted into the memory tier. Returns `None` on a clean miss and on any
  /// absorbed persistent-tier failure.
  pub fn get(&self, fingerprint: &Fingerprint, target: TargetSize) -> Option<Arc<DecodedImage>> {
    if let Some(image) = self.memory.get(fingerprint) {
      return Some(image);
    }

    let disk = self.disk.as_ref()?;
    let (bytes, metadata) = disk.read(fingerprint)?;
    let url = metadata.map(|m| m.url).unwrap_or_default();
    match decode::decode_and_scale(&bytes, target, self.max_decoded_pixels, &url) {
      Ok(decoded) => {
        let image = Arc::new(decoded);
        self.memory.put(fingerprint.clone(), Arc::clone(&image));
        Some(image)
      }
      Err(err) => {
        // A persisted payload that no longer decodes is useless; drop it so
        // the next request re-fetches.
        tracing::warn!(%fingerprint, %err, "corrupt disk cache payload, removing");
        disk.remove(fingerprint);
        None
      }
    }
  }

  /// Memory-tier-only lookup (the "refresh cached" read path).
  pub fn peek_memory(&self, fingerprint: &Fingerprint) -> Option<Arc<DecodedImage>> {
    self.memory.get(fingerprint)
  }

  /// Write a fetched resource to both tiers: the decoded image into memory
  /// (subject to capacity), the source bytes into the persistent tier
  /// (best effort).
  pub fn put(
    &self,
    fingerprint: &Fingerprint,
    image: Arc<DecodedImage>,
    raw_bytes: &[u8],
    url: &str,
    content_type: Option<&str>,
  ) {
    self.memory.put(fingerprint.clone(), image);
    if let Some(disk) = &self.disk {
      disk.write(fingerprint, raw_bytes, url, content_type);
    }
  }

  /// Drop the memory entry while keeping the persistent copy.
  pub fn invalidate_memory(&self, fingerprint: &Fingerprint) {
    self.memory.invalidate(fingerprint);
  }

  pub fn memory(&self) -> &MemoryCache {
    &self.memory
  }

  /// Persistent tier handle, when configured.
  pub fn disk(&self) -> Option<&DiskCache> {
    self.disk.as_ref()
  }
}
