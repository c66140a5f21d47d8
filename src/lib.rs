//! picfetch: a concurrent remote-image fetch and cache manager.
//!
//! [`FetchManager`] is the entry point: `download` hands a URL and a listener
//! to a bounded worker pool, deduplicating concurrent requests for the same
//! `(url, target size)` pair and fanning one result out to every registered
//! listener. Results are served from a two-tier cache (byte-bounded in-memory
//! LRU over decoded images, persistent on-disk store of fetched bytes) before
//! any network work is considered.

pub mod cache;
pub mod decode;
pub mod error;
pub mod fingerprint;
pub mod manager;
mod pool;
pub mod resource;

pub use cache::{ImageStore, ImageStoreConfig};
pub use decode::{decode_and_scale, DecodedImage, DEFAULT_MAX_DECODED_PIXELS};
pub use error::{CacheError, DecodeError, Error, FetchError, Result};
pub use fingerprint::{Fingerprint, TargetSize};
pub use manager::{DownloadOptions, FetchListener, FetchManager, FetchManagerConfig};
pub use resource::{FetchedResource, HttpFetcher, ResourceFetcher};
