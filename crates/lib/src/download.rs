//! Content-addressed download cache.
//!
//! Remote archives are fetched at most once per machine and kept under
//! `<cache-root>/downloads/`. Before a cached copy is reused, a HEAD
//! request validates that the server still reports the same
//! `Content-Length`; any mismatch triggers a fresh download.
//!
//! Downloads are streamed to a temporary file and atomically renamed into
//! place, so a partially written file is never visible to other callers.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that can occur while downloading.
#[derive(Debug, Error)]
pub enum DownloadError {
  /// The server answered 404 or 410. Callers may try another mirror.
  #[error("not found: {url} (HTTP {status})")]
  NotFound { url: String, status: u16 },

  /// Any other non-success HTTP status.
  #[error("http error for {url}: HTTP {status}")]
  Http { url: String, status: u16 },

  /// Transport-level failure (DNS, TLS, connection reset, ...).
  #[error("network error for {url}: {source}")]
  Network {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  /// The HEAD validation request itself failed. This is a hard error,
  /// never a silent reuse of the cached copy.
  #[error("validation request failed for {url}: {source}")]
  HeadFailed {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("download cancelled")]
  Cancelled,
}

impl DownloadError {
  /// True when the resource is definitively absent (HTTP 404/410).
  pub fn is_not_found(&self) -> bool {
    matches!(self, DownloadError::NotFound { .. })
  }
}

/// A local cache of downloaded files, keyed by sanitized URL.
pub struct DownloadCache {
  root: PathBuf,
  client: reqwest::Client,
}

impl DownloadCache {
  /// Create a cache rooted at `root`.
  pub fn new(root: PathBuf) -> Self {
    Self {
      root,
      client: reqwest::Client::new(),
    }
  }

  /// Create a cache under the default downloads directory.
  pub fn with_default_root() -> Self {
    Self::new(crate::paths::downloads_dir())
  }

  /// The local path a URL caches to.
  pub fn cache_path(&self, url: &str) -> PathBuf {
    self.root.join(cache_filename(url))
  }

  /// Ensure the resource at `url` is available locally and return its path.
  ///
  /// A cached file is reused only after a HEAD request confirms the
  /// server-reported size matches the local size. HTTP 404/410 surface as
  /// [`DownloadError::NotFound`] so callers can fall back to a mirror.
  pub async fn download(&self, cancel: &CancellationToken, url: &str) -> Result<PathBuf, DownloadError> {
    let dest = self.cache_path(url);

    if dest.exists() {
      if self.validate_cached(url, &dest).await? {
        info!(url, path = %dest.display(), "reusing cached download");
        return Ok(dest);
      }
      debug!(url, "cached file is stale, re-downloading");
    }

    self.fetch(cancel, url, &dest).await?;
    Ok(dest)
  }

  /// HEAD-validate a cached file. Returns true when it can be reused.
  async fn validate_cached(&self, url: &str, dest: &Path) -> Result<bool, DownloadError> {
    let response = self
      .client
      .head(url)
      .send()
      .await
      .map_err(|e| DownloadError::HeadFailed {
        url: url.to_string(),
        source: e,
      })?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
      return Err(DownloadError::NotFound {
        url: url.to_string(),
        status: status.as_u16(),
      });
    }

    if !status.is_success() {
      debug!(url, status = status.as_u16(), "HEAD returned non-success, re-downloading");
      return Ok(false);
    }

    let remote_len = response.content_length();
    let local_len = tokio::fs::metadata(dest).await?.len();

    match remote_len {
      Some(len) if len == local_len => Ok(true),
      Some(len) => {
        debug!(url, remote = len, local = local_len, "size mismatch");
        Ok(false)
      }
      None => {
        debug!(url, "server did not report a length, re-downloading");
        Ok(false)
      }
    }
  }

  /// Stream `url` into `dest`, replacing it atomically.
  async fn fetch(&self, cancel: &CancellationToken, url: &str, dest: &Path) -> Result<(), DownloadError> {
    info!(url, "downloading");

    tokio::fs::create_dir_all(&self.root).await?;

    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| DownloadError::Network {
        url: url.to_string(),
        source: e,
      })?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
      return Err(DownloadError::NotFound {
        url: url.to_string(),
        status: status.as_u16(),
      });
    }
    if !status.is_success() {
      return Err(DownloadError::Http {
        url: url.to_string(),
        status: status.as_u16(),
      });
    }

    // The temp file lives in the cache directory so the final rename
    // stays on one filesystem. It is removed automatically on error.
    let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
    let mut file = tokio::fs::File::create(tmp.path()).await?;
    let mut stream = response;
    let mut total: u64 = 0;

    loop {
      let chunk = tokio::select! {
        chunk = stream.chunk() => chunk.map_err(|e| DownloadError::Network {
          url: url.to_string(),
          source: e,
        })?,
        _ = cancel.cancelled() => {
          warn!(url, "download cancelled");
          return Err(DownloadError::Cancelled);
        }
      };

      match chunk {
        Some(bytes) => {
          total += bytes.len() as u64;
          file.write_all(&bytes).await?;
        }
        None => break,
      }
    }

    file.flush().await?;
    drop(file);

    tmp.persist(dest).map_err(|e| DownloadError::Io(e.error))?;
    info!(url, size = total, path = %dest.display(), "download complete");
    Ok(())
  }
}

/// Derive a cache filename from a URL.
///
/// Runs of characters outside `[A-Za-z0-9.]` collapse to a single `_`,
/// which keeps archive suffixes (`.tar.gz`, `.zip`) intact so extraction
/// can still infer the format. Degenerate results fall back to a digest.
pub fn cache_filename(url: &str) -> String {
  let mut out = String::with_capacity(url.len());
  let mut last_was_sep = false;

  for ch in url.chars() {
    if ch.is_ascii_alphanumeric() || ch == '.' {
      out.push(ch);
      last_was_sep = false;
    } else if !last_was_sep {
      out.push('_');
      last_was_sep = true;
    }
  }

  let trimmed = out.trim_matches(|c| c == '_' || c == '.');
  if trimmed.is_empty() {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    return format!("download_{}", &hex::encode(hasher.finalize())[..16]);
  }
  trimmed.to_string()
}
