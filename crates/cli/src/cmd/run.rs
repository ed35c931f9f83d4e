//! Implementation of `yb run`.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use yb_lib::{run_adhoc, BuildOpts};

use crate::output;

/// Run one command inside a target's provisioned environment.
pub async fn cmd_run(
  cancel: &CancellationToken,
  package_dir: &Path,
  target: &str,
  command: &[String],
) -> u8 {
  let Some(manifest) = super::load_manifest(package_dir) else {
    return 2;
  };

  let Ok(command) = shlex::try_join(command.iter().map(String::as_str)) else {
    output::print_error("command contains characters that cannot be quoted");
    return 2;
  };

  let opts = BuildOpts::new(package_dir.to_path_buf());
  match run_adhoc(cancel, &manifest, target, &command, &opts).await {
    Ok(_) => 0,
    Err(err) => {
      output::print_error(&err.to_string());
      err.exit_code() as u8
    }
  }
}
