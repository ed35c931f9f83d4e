//! Implementation of `yb exec`.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use yb_lib::{run_exec, BuildOpts};

use crate::output;

/// Run the manifest's `exec:` phase, typically a long-running service
/// with its dependency containers up.
pub async fn cmd_exec(cancel: &CancellationToken, package_dir: &Path, reuse_containers: bool) -> u8 {
  let Some(manifest) = super::load_manifest(package_dir) else {
    return 2;
  };

  if manifest.exec.is_none() {
    output::print_error("manifest has no exec block");
    return 2;
  }

  let mut opts = BuildOpts::new(package_dir.to_path_buf());
  opts.reuse_containers = reuse_containers;

  match run_exec(cancel, &manifest, &opts).await {
    Ok(_) => 0,
    Err(err) => {
      output::print_error(&err.to_string());
      err.exit_code() as u8
    }
  }
}
