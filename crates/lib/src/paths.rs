//! Cache directory resolution.
//!
//! All persistent state lives under a single cache root:
//!
//! ```text
//! <root>/
//! ├── downloads/                              # shared download cache
//! ├── tools/<tool>/<version>/                 # shared toolchain installs
//! └── build-home/<pkg-digest>/<target>/<descriptor>/  # per-target HOME
//! ```
//!
//! The root is taken from `YB_CACHE_DIR` when set, otherwise the
//! OS-conventional cache location (e.g. `~/.cache/yb` on Linux).

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::consts::{APP_NAME, CACHE_DIR_ENV, PKG_DIGEST_LEN};

/// Resolve the cache root.
///
/// Precedence: `YB_CACHE_DIR`, then the platform cache directory, then
/// `~/.cache/yb` as a last resort.
pub fn cache_root() -> PathBuf {
  if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
    if !dir.is_empty() {
      return PathBuf::from(dir);
    }
  }

  if let Some(cache) = dirs::cache_dir() {
    return cache.join(APP_NAME);
  }

  home_dir().join(".cache").join(APP_NAME)
}

/// Shared download cache directory.
pub fn downloads_dir() -> PathBuf {
  cache_root().join("downloads")
}

/// Shared toolchain install root for host biomes.
pub fn tools_dir() -> PathBuf {
  cache_root().join("tools")
}

/// Per-package, per-target, per-platform HOME directory.
///
/// The package path is hashed to a short digest to bound the resulting
/// path length. `descriptor` partitions caches by `{os}-{arch}` so a
/// host build and a container build of the same target never share state.
pub fn build_home(package_dir: &Path, target: &str, descriptor: &str) -> PathBuf {
  cache_root()
    .join("build-home")
    .join(package_digest(package_dir))
    .join(target)
    .join(descriptor)
}

/// Root of all build-home directories for one package.
pub fn package_build_home(package_dir: &Path) -> PathBuf {
  cache_root().join("build-home").join(package_digest(package_dir))
}

/// Short, stable digest of a package path.
pub fn package_digest(package_dir: &Path) -> String {
  let mut hasher = Sha256::new();
  hasher.update(package_dir.to_string_lossy().as_bytes());
  let full = hex::encode(hasher.finalize());
  full[..PKG_DIGEST_LEN].to_string()
}

/// Returns the user's home directory.
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  let userprofile = std::env::var("USERPROFILE").expect("USERPROFILE not set");
  PathBuf::from(userprofile)
}

/// Returns the user's home directory.
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  let home = std::env::var("HOME").expect("HOME not set");
  PathBuf::from(home)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn cache_dir_env_takes_precedence() {
    temp_env::with_var(CACHE_DIR_ENV, Some("/custom/cache"), || {
      assert_eq!(cache_root(), PathBuf::from("/custom/cache"));
      assert_eq!(downloads_dir(), PathBuf::from("/custom/cache/downloads"));
      assert_eq!(tools_dir(), PathBuf::from("/custom/cache/tools"));
    });
  }

  #[test]
  #[serial]
  fn empty_cache_dir_env_is_ignored() {
    temp_env::with_var(CACHE_DIR_ENV, Some(""), || {
      assert_ne!(cache_root(), PathBuf::from(""));
    });
  }

  #[test]
  fn package_digest_is_stable() {
    let a = package_digest(Path::new("/work/project"));
    let b = package_digest(Path::new("/work/project"));
    assert_eq!(a, b);
    assert_eq!(a.len(), PKG_DIGEST_LEN);
  }

  #[test]
  fn package_digest_differs_per_path() {
    let a = package_digest(Path::new("/work/project-a"));
    let b = package_digest(Path::new("/work/project-b"));
    assert_ne!(a, b);
  }

  #[test]
  #[serial]
  fn build_home_layout() {
    temp_env::with_var(CACHE_DIR_ENV, Some("/cache"), || {
      let home = build_home(Path::new("/work/project"), "default", "linux-amd64");
      let digest = package_digest(Path::new("/work/project"));
      assert_eq!(
        home,
        PathBuf::from("/cache")
          .join("build-home")
          .join(digest)
          .join("default")
          .join("linux-amd64")
      );
    });
  }
}
