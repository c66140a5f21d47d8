//! Persistent cache tier
//!
//! One data file (`<fingerprint>.bin`) plus one JSON metadata sidecar
//! (`<fingerprint>.bin.meta`) per entry, stored flat in the cache directory.
//! The tier is addressable solely by fingerprint and survives restarts; no
//! index needs rebuilding.
//!
//! Every I/O failure is absorbed into a cache miss: the fetch path must never
//! fail because the disk tier is unavailable. Writes go through a tmp file and
//! rename so a torn write never leaves a corrupt entry under the final name.

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default persistent tier quota: 512 MiB.
pub const DEFAULT_DISK_MAX_BYTES: u64 = 512 * 1024 * 1024;

/// Configuration for [`DiskCache`].
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
  /// Maximum total bytes to keep on disk. `0` disables eviction.
  pub max_bytes: u64,
}

impl Default for DiskCacheConfig {
  fn default() -> Self {
    Self {
      max_bytes: DEFAULT_DISK_MAX_BYTES,
    }
  }
}

/// Sidecar metadata stored next to each data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
  pub url: String,
  pub content_type: Option<String>,
  /// Unix seconds at write time.
  pub stored_at: u64,
}

pub struct DiskCache {
  dir: PathBuf,
  config: DiskCacheConfig,
  /// Held only while scanning for eviction; writers that find it taken skip
  /// their eviction pass instead of queueing.
  eviction: Mutex<()>,
}

impl DiskCache {
  pub fn new(dir: impl Into<PathBuf>, config: DiskCacheConfig) -> Self {
    let dir = dir.into();
    if let Err(err) = fs::create_dir_all(&dir) {
      tracing::warn!(dir = %dir.display(), %err, "failed to create cache directory");
    }
    Self {
      dir,
      config,
      eviction: Mutex::new(()),
    }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Read an entry's bytes and sidecar metadata. Any failure is a miss.
  pub fn read(&self, fingerprint: &Fingerprint) -> Option<(Vec<u8>, Option<EntryMetadata>)> {
    match self.try_read(fingerprint) {
      Ok(found) => found,
      Err(err) => {
        tracing::warn!(%fingerprint, %err, "disk cache read failed, treating as miss");
        None
      }
    }
  }

  fn try_read(
    &self,
    fingerprint: &Fingerprint,
  ) -> Result<Option<(Vec<u8>, Option<EntryMetadata>)>, CacheError> {
    let data_path = self.data_path(fingerprint);
    if !data_path.exists() {
      return Ok(None);
    }
    let bytes = fs::read(&data_path).map_err(|e| io_error(&data_path, e))?;

    // A missing or unparseable sidecar does not invalidate the data file.
    let metadata = fs::read(self.meta_path(fingerprint))
      .ok()
      .and_then(|raw| serde_json::from_slice(&raw).ok());

    Ok(Some((bytes, metadata)))
  }

  /// Persist an entry, best effort. Runs a lazy eviction pass afterwards.
  pub fn write(&self, fingerprint: &Fingerprint, bytes: &[u8], url: &str, content_type: Option<&str>) {
    if let Err(err) = self.try_write(fingerprint, bytes, url, content_type) {
      tracing::warn!(%fingerprint, %err, "disk cache write failed");
      return;
    }
    self.maybe_evict();
  }

  fn try_write(
    &self,
    fingerprint: &Fingerprint,
    bytes: &[u8],
    url: &str,
    content_type: Option<&str>,
  ) -> Result<(), CacheError> {
    let data_path = self.data_path(fingerprint);
    let tmp = tmp_path(&data_path);
    fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, &data_path).map_err(|e| io_error(&data_path, e))?;

    let metadata = EntryMetadata {
      url: url.to_string(),
      content_type: content_type.map(|s| s.to_string()),
      stored_at: unix_seconds(),
    };
    let meta_path = self.meta_path(fingerprint);
    let encoded = serde_json::to_vec(&metadata).map_err(|e| CacheError::Metadata {
      path: meta_path.display().to_string(),
      reason: e.to_string(),
    })?;
    fs::write(&meta_path, encoded).map_err(|e| io_error(&meta_path, e))?;
    Ok(())
  }

  /// Remove an entry (e.g., after its payload failed to decode).
  pub fn remove(&self, fingerprint: &Fingerprint) {
    let _ = fs::remove_file(self.data_path(fingerprint));
    let _ = fs::remove_file(self.meta_path(fingerprint));
  }

  pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
    self.data_path(fingerprint).exists()
  }

  fn data_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.dir.join(format!("{}.bin", fingerprint.as_hex()))
  }

  fn meta_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.dir.join(format!("{}.bin.meta", fingerprint.as_hex()))
  }

  /// Evict oldest-modified entries until the tier fits its quota.
  ///
  /// Uses `try_lock` so a concurrent writer skips the pass rather than
  /// blocking; the next write picks it up. Reads are never blocked.
  fn maybe_evict(&self) {
    if self.config.max_bytes == 0 {
      return;
    }
    let Ok(_guard) = self.eviction.try_lock() else {
      return;
    };

    let mut entries: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
    let mut total: u64 = 0;
    let Ok(dir) = fs::read_dir(&self.dir) else {
      return;
    };
    for entry in dir.flatten() {
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) != Some("bin") {
        continue;
      }
      let Ok(meta) = entry.metadata() else { continue };
      let modified = meta.modified().unwrap_or(UNIX_EPOCH);
      total += meta.len();
      entries.push((path, meta.len(), modified));
    }

    if total <= self.config.max_bytes {
      return;
    }

    entries.sort_by_key(|(_, _, modified)| *modified);
    for (path, size, _) in entries {
      if total <= self.config.max_bytes {
        break;
      }
      let meta_path = append_suffix(&path, ".meta");
      if fs::remove_file(&path).is_ok() {
        total = total.saturating_sub(size);
        tracing::debug!(path = %path.display(), "evicted disk cache entry");
      }
      let _ = fs::remove_file(meta_path);
    }
  }
}

fn io_error(path: &Path, err: std::io::Error) -> CacheError {
  CacheError::Io {
    path: path.display().to_string(),
    reason: err.to_string(),
  }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
  let mut name = path.as_os_str().to_owned();
  name.push(suffix);
  PathBuf::from(name)
}

fn tmp_path(path: &Path) -> PathBuf {
  append_suffix(path, ".tmp")
}

fn unix_seconds() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}
