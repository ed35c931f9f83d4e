//! Implementation of `yb clean`.

use std::path::Path;

use tracing::info;

use yb_lib::paths;

use crate::output;

/// Remove cached build HOME directories for this package. With no
/// targets, the whole per-package cache goes; otherwise only the named
/// targets' directories.
pub fn cmd_clean(package_dir: &Path, targets: &[String]) -> u8 {
  let package_home = paths::package_build_home(package_dir);
  if !package_home.exists() {
    info!(path = %package_home.display(), "nothing to clean");
    return 0;
  }

  let roots: Vec<_> = if targets.is_empty() {
    vec![package_home]
  } else {
    targets.iter().map(|t| package_home.join(t)).collect()
  };

  let mut failed = false;
  for root in roots {
    if !root.exists() {
      continue;
    }
    match std::fs::remove_dir_all(&root) {
      Ok(()) => info!(path = %root.display(), "removed"),
      Err(err) => {
        output::print_error(&format!("failed to remove {}: {err}", root.display()));
        failed = true;
      }
    }
  }

  if failed { 2 } else { 0 }
}
