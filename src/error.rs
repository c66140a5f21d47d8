//! Error types for picfetch
//!
//! This module provides error types for the fetch/cache subsystems:
//! - Fetch errors (network transport, HTTP status, response limits)
//! - Decode errors (malformed payloads, decode limits)
//! - Cache errors (persistent tier I/O, absorbed internally and never
//!   delivered to listeners)
//!
//! All errors use the `thiserror` crate for minimal boilerplate and
//! proper error trait implementations.

use thiserror::Error;

/// Result type alias for picfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for picfetch
///
/// Each variant wraps a more specific error type for that subsystem. Only
/// `Fetch` and `Decode` errors ever reach a listener's failure callback;
/// `Cache` errors are degraded to cache misses inside the store.
#[derive(Error, Debug)]
pub enum Error {
  /// Network retrieval error
  #[error("Fetch error: {0}")]
  Fetch(#[from] FetchError),

  /// Image decoding or resizing error
  #[error("Decode error: {0}")]
  Decode(#[from] DecodeError),

  /// Persistent cache tier error
  #[error("Cache error: {0}")]
  Cache(#[from] CacheError),
}

/// Errors that occur while retrieving resource bytes over the network
///
/// These are normalized at the worker boundary into a single failure
/// callback; workers never retry internally.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
  /// Transport-level failure (unreachable host, timeout, TLS, ...)
  #[error("Failed to fetch '{url}': {reason}")]
  Transport { url: String, reason: String },

  /// Non-success HTTP status
  #[error("HTTP {status} fetching '{url}'")]
  Status { url: String, status: u16 },

  /// The server returned an empty body
  #[error("Empty response body from '{url}'")]
  EmptyBody { url: String },

  /// Redirect chain exceeded the hop limit
  #[error("Too many redirects fetching '{url}'")]
  TooManyRedirects { url: String },

  /// The URL could not be used at all (empty or unparseable)
  #[error("Invalid URL '{url}': {reason}")]
  InvalidUrl { url: String, reason: String },
}

/// Errors that occur while decoding or resizing a fetched payload
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
  /// The payload is not a decodable image
  #[error("Failed to decode image from '{url}': {reason}")]
  Malformed { url: String, reason: String },

  /// Decoded dimensions exceed the configured pixel guard
  #[error("Image from '{url}' is too large: {width}x{height} exceeds {max_pixels} pixels")]
  TooLarge {
    url: String,
    width: u32,
    height: u32,
    max_pixels: u64,
  },
}

/// Errors raised by the persistent cache tier
///
/// Always absorbed by the store (logged and treated as a miss); defined so
/// the disk tier's internals can propagate with `?` before the absorption
/// boundary.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
  /// Reading or writing a cache file failed
  #[error("Cache I/O failed for '{path}': {reason}")]
  Io { path: String, reason: String },

  /// A cache metadata sidecar could not be serialized or parsed
  #[error("Cache metadata invalid for '{path}': {reason}")]
  Metadata { path: String, reason: String },
}
