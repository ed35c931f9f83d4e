//! Implementation of `yb build`.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::info;

use yb_lib::consts::DEFAULT_TARGET;
use yb_lib::{build_order, run_target, BuildOpts, BuildReport};

use crate::output;

/// Build the requested targets in dependency order.
pub async fn cmd_build(
  cancel: &CancellationToken,
  package_dir: &Path,
  targets: &[String],
  reuse_containers: bool,
  no_container: bool,
  env: &str,
) -> u8 {
  let Some(manifest) = super::load_manifest(package_dir) else {
    return 2;
  };

  let requested: Vec<String> = if targets.is_empty() {
    vec![DEFAULT_TARGET.to_string()]
  } else {
    targets.to_vec()
  };

  let order = match build_order(&manifest, &requested) {
    Ok(order) => order,
    Err(err) => {
      output::print_error(&err.to_string());
      return 2;
    }
  };
  info!(order = ?order, "resolved build order");

  let mut opts = BuildOpts::new(package_dir.to_path_buf());
  opts.env_name = env.to_string();
  opts.no_container = no_container;
  opts.reuse_containers = reuse_containers;

  let mut report = BuildReport::default();
  for name in &order {
    match run_target(cancel, &manifest, name, &opts).await {
      Ok(target_report) => report.targets.push(target_report),
      Err(err) => {
        output::print_build_failed(&err.to_string());
        output::print_timing_table(&report);
        return err.exit_code() as u8;
      }
    }
  }

  output::print_build_passed();
  output::print_timing_table(&report);
  0
}
