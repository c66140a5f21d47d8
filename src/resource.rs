//! Resource fetching abstraction
//!
//! This module provides a trait-based abstraction for retrieving remote
//! resource bytes. The manager is agnostic about how bytes are obtained,
//! enabling:
//!
//! - Mocking for tests
//! - Offline modes (`file://` URLs)
//! - Custom transports or instrumentation
//!
//! # Example
//!
//! ```rust,ignore
//! use picfetch::resource::{ResourceFetcher, HttpFetcher};
//!
//! let fetcher = HttpFetcher::new();
//! let resource = fetcher.fetch("https://example.com/image.png")?;
//! println!("Got {} bytes", resource.bytes.len());
//! ```

use crate::error::{Error, FetchError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default User-Agent string used by [`HttpFetcher`]
pub const DEFAULT_USER_AGENT: &str = "picfetch/0.1";

/// Maximum number of redirect hops followed before giving up
const MAX_REDIRECT_HOPS: usize = 10;

/// Result of fetching an external resource
#[derive(Debug, Clone)]
pub struct FetchedResource {
  /// Raw bytes of the resource
  pub bytes: Vec<u8>,
  /// Content-Type header value, if available (e.g., "image/png")
  pub content_type: Option<String>,
}

impl FetchedResource {
  pub fn new(bytes: Vec<u8>, content_type: Option<String>) -> Self {
    Self { bytes, content_type }
  }
}

/// Trait for fetching external resources
///
/// URLs can be:
/// - `http://` or `https://` - fetch over network
/// - `file://` - read from filesystem
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the worker pool shares one fetcher
/// across all workers.
pub trait ResourceFetcher: Send + Sync {
  /// Fetch a resource from the given URL
  ///
  /// Returns `Ok(FetchedResource)` containing the bytes and optional
  /// content-type, or a [`FetchError`]-carrying error if the fetch fails.
  fn fetch(&self, url: &str) -> Result<FetchedResource>;
}

// Allow Arc<dyn ResourceFetcher> to be used as ResourceFetcher
impl<T: ResourceFetcher + ?Sized> ResourceFetcher for Arc<T> {
  fn fetch(&self, url: &str) -> Result<FetchedResource> {
    (**self).fetch(url)
  }
}

/// Default HTTP resource fetcher
///
/// Fetches resources over HTTP/HTTPS with configurable timeout, user agent,
/// and response size limit. Also handles `file://` URLs.
///
/// # Example
///
/// ```rust,ignore
/// use picfetch::resource::HttpFetcher;
/// use std::time::Duration;
///
/// let fetcher = HttpFetcher::new()
///     .with_timeout(Duration::from_secs(60))
///     .with_user_agent("MyApp/1.0");
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
  timeout: Duration,
  user_agent: String,
  max_size: usize,
}

impl HttpFetcher {
  /// Create a new HttpFetcher with default settings
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the request timeout
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Set the User-Agent header
  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = user_agent.into();
    self
  }

  /// Set the maximum response size in bytes
  pub fn with_max_size(mut self, max_size: usize) -> Self {
    self.max_size = max_size;
    self
  }

  /// Fetch from an HTTP/HTTPS URL
  fn fetch_http(&self, url: &str) -> Result<FetchedResource> {
    let config = ureq::Agent::config_builder()
      .timeout_global(Some(self.timeout))
      .max_redirects(0)
      .http_status_as_error(false)
      .build();
    let agent: ureq::Agent = config.into();

    let mut current = url.to_string();
    for _ in 0..MAX_REDIRECT_HOPS {
      let mut response = agent
        .get(&current)
        .header("User-Agent", &self.user_agent)
        .call()
        .map_err(|e| {
          Error::Fetch(FetchError::Transport {
            url: current.clone(),
            reason: e.to_string(),
          })
        })?;

      let status = response.status().as_u16();
      if (300..400).contains(&status) {
        if let Some(loc) = response
          .headers()
          .get("location")
          .and_then(|h| h.to_str().ok())
        {
          let next = Url::parse(&current)
            .ok()
            .and_then(|base| base.join(loc).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| loc.to_string());
          current = next;
          continue;
        }
      }

      if !(200..300).contains(&status) {
        return Err(Error::Fetch(FetchError::Status {
          url: current,
          status,
        }));
      }

      let content_type = response
        .headers()
        .get("content-type")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

      let bytes = response
        .body_mut()
        .with_config()
        .limit(self.max_size as u64)
        .read_to_vec()
        .map_err(|e| {
          Error::Fetch(FetchError::Transport {
            url: current.clone(),
            reason: e.to_string(),
          })
        })?;

      if bytes.is_empty() {
        return Err(Error::Fetch(FetchError::EmptyBody { url: current }));
      }
      return Ok(FetchedResource::new(bytes, content_type));
    }

    Err(Error::Fetch(FetchError::TooManyRedirects {
      url: url.to_string(),
    }))
  }

  /// Fetch from a file:// URL
  fn fetch_file(&self, url: &str) -> Result<FetchedResource> {
    let path = url.strip_prefix("file://").unwrap_or(url);
    let bytes = std::fs::read(path).map_err(|e| {
      Error::Fetch(FetchError::Transport {
        url: url.to_string(),
        reason: e.to_string(),
      })
    })?;

    let content_type = guess_content_type_from_path(path);
    Ok(FetchedResource::new(bytes, content_type))
  }
}

impl Default for HttpFetcher {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(30),
      user_agent: DEFAULT_USER_AGENT.to_string(),
      max_size: 50 * 1024 * 1024, // 50MB default limit
    }
  }
}

impl ResourceFetcher for HttpFetcher {
  fn fetch(&self, url: &str) -> Result<FetchedResource> {
    if url.starts_with("http://") || url.starts_with("https://") {
      self.fetch_http(url)
    } else if url.starts_with("file://") {
      self.fetch_file(url)
    } else {
      Err(Error::Fetch(FetchError::InvalidUrl {
        url: url.to_string(),
        reason: "unsupported scheme".to_string(),
      }))
    }
  }
}

/// Guess content-type from file path extension
fn guess_content_type_from_path(path: &str) -> Option<String> {
  let ext = Path::new(path)
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_lowercase())?;

  let mime = match ext.as_str() {
    "png" => "image/png",
    "jpg" | "jpeg" => "image/jpeg",
    "gif" => "image/gif",
    "webp" => "image/webp",
    "ico" => "image/x-icon",
    "bmp" => "image/bmp",
    "tif" | "tiff" => "image/tiff",
    _ => return None,
  };

  Some(mime.to_string())
}
