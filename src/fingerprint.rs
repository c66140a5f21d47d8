//! Cache and deduplication keys
//!
//! A [`Fingerprint`] is the sole key for both cache tiers and for in-flight
//! request deduplication. It is a SHA-256 digest of the resource URL plus the
//! requested target dimensions, so dimension-specific variants of the same
//! URL are cached and deduplicated independently.

use sha2::{Digest, Sha256};
use std::fmt;

/// Requested output dimensions for a fetched image.
///
/// `None` on an axis means "native size on that axis". When only one axis is
/// set, the other is derived from the source aspect ratio at decode time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TargetSize {
  pub width: Option<u32>,
  pub height: Option<u32>,
}

impl TargetSize {
  /// Native size, no resize.
  pub fn native() -> Self {
    Self::default()
  }

  pub fn new(width: u32, height: u32) -> Self {
    Self {
      width: Some(width),
      height: Some(height),
    }
  }

  /// True when neither axis requests a resize.
  pub fn is_native(&self) -> bool {
    self.width.is_none() && self.height.is_none()
  }
}

/// Deterministic, collision-resistant key derived from `(url, target)`.
///
/// Identical inputs always produce an identical fingerprint. The hex form is
/// filename-safe and is used directly as the persistent tier's file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn compute(url: &str, target: TargetSize) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    if let Some(w) = target.width {
      hasher.update(b"|w=");
      hasher.update(w.to_le_bytes());
    }
    if let Some(h) = target.height {
      hasher.update(b"|h=");
      hasher.update(h.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
      use fmt::Write;
      let _ = write!(hex, "{:02x}", byte);
    }
    Fingerprint(hex)
  }

  /// Hex digest, suitable as a file stem.
  pub fn as_hex(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
