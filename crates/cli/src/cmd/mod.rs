mod build;
mod clean;
mod exec;
mod run;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use exec::cmd_exec;
pub use run::cmd_run;

use std::path::Path;

use yb_lib::consts::MANIFEST_FILE;
use yb_lib::Manifest;

use crate::output;

/// Load the package manifest, printing a diagnostic on failure.
pub(crate) fn load_manifest(package_dir: &Path) -> Option<Manifest> {
  let path = package_dir.join(MANIFEST_FILE);
  match Manifest::load(&path) {
    Ok(manifest) => Some(manifest),
    Err(err) => {
      output::print_error(&err.to_string());
      None
    }
  }
}
