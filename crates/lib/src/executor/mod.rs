//! Target execution.
//!
//! Turns a named target into a validated command sequence and runs it
//! inside a freshly provisioned biome, with the target's toolchains
//! installed and its service containers running. Teardown of containers
//! and biomes always runs, including after failure or cancellation.

mod timer;
mod validation;

pub use timer::{BuildReport, CommandTimer, CommandTiming, TargetReport};
pub use validation::{validate_commands, CommandStep, ValidationError};

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::biome::container::ContainerBiome;
use crate::biome::{Arch, Biome, BiomeError, EnvBiome, HostBiome, Invocation, Os, OutputSink};
use crate::buildpack::{self, BuildpackError};
use crate::download::DownloadCache;
use crate::manifest::{Manifest, ManifestError, Target};
use crate::paths;
use crate::resource::{ResourceError, ResourceManager};
use crate::template::{self, TemplateError};

/// Anything that can sink a build.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error(transparent)]
  Buildpack(#[from] BuildpackError),

  #[error(transparent)]
  Resource(#[from] ResourceError),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error(transparent)]
  Biome(#[from] BiomeError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl BuildError {
  /// Process exit code for this failure: 1 when a build command itself
  /// exited non-zero, 2 for everything the infrastructure got wrong.
  pub fn exit_code(&self) -> i32 {
    match self {
      BuildError::Biome(BiomeError::CommandFailed { .. }) => 1,
      _ => 2,
    }
  }
}

/// Per-invocation knobs shared by every target of a build.
#[derive(Clone)]
pub struct BuildOpts {
  /// Directory holding the manifest and the package source.
  pub package_dir: PathBuf,
  /// Which `environment:` block feeds env templating.
  pub env_name: String,
  /// Run on the host even when the target declares a container.
  pub no_container: bool,
  /// Leave service containers running after the build.
  pub reuse_containers: bool,
  /// Pins the randomized buildpack install order.
  pub install_seed: Option<u64>,
  pub stdout: OutputSink,
  pub stderr: OutputSink,
}

impl BuildOpts {
  pub fn new(package_dir: PathBuf) -> Self {
    Self {
      package_dir,
      env_name: "default".to_string(),
      no_container: false,
      reuse_containers: false,
      install_seed: None,
      stdout: OutputSink::Stdout,
      stderr: OutputSink::Stderr,
    }
  }
}

/// Topological order of the requested targets and everything they
/// transitively `build_after`, deduplicated.
///
/// The order is stable: among targets whose prerequisites are all
/// scheduled, the one discovered first goes first.
pub fn build_order(manifest: &Manifest, requested: &[String]) -> Result<Vec<String>, ManifestError> {
  // Transitive closure in discovery order.
  let mut closure: Vec<&str> = Vec::new();
  let mut queue: VecDeque<&str> = VecDeque::new();
  for name in requested {
    queue.push_back(manifest.target(name)?.name.as_str());
  }
  while let Some(name) = queue.pop_front() {
    if closure.contains(&name) {
      continue;
    }
    closure.push(name);
    for dep in &manifest.target(name)?.build_after {
      queue.push_back(dep);
    }
  }

  let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
  for name in &closure {
    graph.add_node(*name);
  }
  for name in &closure {
    for dep in &manifest.target(name)?.build_after {
      graph.add_edge(dep.as_str(), *name, ());
    }
  }

  // Kahn's algorithm, always taking the earliest-discovered ready node.
  let mut order: Vec<String> = Vec::new();
  let mut pending = closure.clone();
  while !pending.is_empty() {
    let ready = pending.iter().position(|name| {
      graph
        .neighbors_directed(*name, Direction::Incoming)
        .all(|dep| order.iter().any(|o| o.as_str() == dep))
    });

    match ready {
      Some(index) => order.push(pending.remove(index).to_string()),
      None => return Err(ManifestError::DependencyCycle(pending[0].to_string())),
    }
  }

  Ok(order)
}

/// Build one target end to end.
pub async fn run_target(
  cancel: &CancellationToken,
  manifest: &Manifest,
  name: &str,
  opts: &BuildOpts,
) -> Result<TargetReport, BuildError> {
  let target = manifest.target(name)?;
  run_one(cancel, target, opts).await
}

/// Run the manifest's `exec:` phase with the same provisioning as a
/// build: its buildpacks installed, its service containers running.
pub async fn run_exec(
  cancel: &CancellationToken,
  manifest: &Manifest,
  opts: &BuildOpts,
) -> Result<TargetReport, BuildError> {
  let exec = manifest
    .exec
    .as_ref()
    .ok_or_else(|| ManifestError::NoSuchTarget("exec".to_string()))?;

  let target = Target {
    name: "exec".to_string(),
    root: String::new(),
    build_after: Vec::new(),
    dependencies: exec.dependencies.clone(),
    container: None,
    environment: exec.environment.clone(),
    commands: exec.commands.clone(),
    buildpacks: exec.buildpacks.clone(),
  };
  run_one(cancel, &target, opts).await
}

/// Run one ad-hoc command inside a target's provisioned environment.
pub async fn run_adhoc(
  cancel: &CancellationToken,
  manifest: &Manifest,
  name: &str,
  command: &str,
  opts: &BuildOpts,
) -> Result<TargetReport, BuildError> {
  let mut target = manifest.target(name)?.clone();
  target.commands = vec![command.to_string()];
  run_one(cancel, &target, opts).await
}

async fn run_one(
  cancel: &CancellationToken,
  target: &Target,
  opts: &BuildOpts,
) -> Result<TargetReport, BuildError> {
  let steps = validate_commands(&target.commands)?;

  info!(target = %target.name, commands = target.commands.len(), "building target");

  // Service containers come up first so a containerized build can join
  // their network and share the IP table.
  let mut resources = ResourceManager::new(opts.reuse_containers);
  let result = match resources.start_all(cancel, &target.dependencies.containers).await {
    Ok(()) => run_in_biome(cancel, target, &steps, &resources, opts).await,
    Err(err) => Err(err.into()),
  };

  // Teardown ignores the cancellation token so cleanup always finishes.
  resources.teardown().await;
  result
}

async fn run_in_biome(
  cancel: &CancellationToken,
  target: &Target,
  steps: &[CommandStep],
  resources: &ResourceManager,
  opts: &BuildOpts,
) -> Result<TargetReport, BuildError> {
  let biome: Arc<dyn Biome> = match &target.container {
    Some(def) if !opts.no_container => {
      let descriptor = format!("{}-{}", Os::Linux.as_str(), Arch::current().as_str());
      let home = paths::build_home(&opts.package_dir, &target.name, &descriptor);
      let tools = paths::tools_dir();
      std::fs::create_dir_all(&home)?;
      std::fs::create_dir_all(&tools)?;
      Arc::new(ContainerBiome::provision(def, &opts.package_dir, &home, &tools, resources.network()).await?)
    }
    _ => Arc::new(HostBiome::provision(&opts.package_dir, &target.name).await?),
  };

  let outcome = execute(cancel, biome.clone(), target, steps, resources, opts).await;

  if let Err(err) = biome.close().await {
    warn!(target = %target.name, error = %err, "failed to close biome");
  }
  outcome
}

async fn execute(
  cancel: &CancellationToken,
  biome: Arc<dyn Biome>,
  target: &Target,
  steps: &[CommandStep],
  resources: &ResourceManager,
  opts: &BuildOpts,
) -> Result<TargetReport, BuildError> {
  let cache = DownloadCache::with_default_root();
  let host_tools = paths::tools_dir();
  let mut overlay = buildpack::install_all(
    cancel,
    biome.as_ref(),
    &cache,
    &host_tools,
    &target.buildpacks,
    opts.install_seed,
  )
  .await?;

  // The target's own environment wins over anything a buildpack set.
  let ctx = resources.expansion_context();
  let vars = template::expand_env_entries(target.env_for(&opts.env_name), &ctx)?;
  for (key, value) in &vars {
    overlay = overlay.with_var(key, value);
  }

  let runner = EnvBiome::new(biome, overlay);

  let mut report = TargetReport::new(&target.name);
  let target_timer = Instant::now();
  let mut work_dir = if target.root.is_empty() {
    None
  } else {
    Some(target.root.clone())
  };

  for (step, raw) in steps.iter().zip(&target.commands) {
    match step {
      CommandStep::Chdir(path) => {
        work_dir = Some(match &work_dir {
          Some(current) => runner.clean_path(&runner.join_path(&[current, path])),
          None => path.clone(),
        });
      }
      CommandStep::Exec(argv) => {
        if cancel.is_cancelled() {
          report.duration = target_timer.elapsed();
          return Err(BiomeError::Cancelled.into());
        }

        let mut invocation = Invocation::new(argv.clone())
          .with_stdout(opts.stdout.clone())
          .with_stderr(opts.stderr.clone());
        if let Some(dir) = &work_dir {
          invocation = invocation.with_dir(dir);
        }

        let timer = CommandTimer::start(raw);
        let run = runner.run(cancel, invocation).await;
        report.timings.push(timer.stop());

        if let Err(err) = run {
          report.duration = target_timer.elapsed();
          error!(target = %target.name, command = %raw, error = %err, "command failed");
          return Err(err.into());
        }
      }
    }
  }

  report.duration = target_timer.elapsed();
  Ok(report)
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
  use super::*;
  use serial_test::serial;
  use tempfile::TempDir;

  fn opts_for(temp: &TempDir) -> (BuildOpts, Arc<std::sync::Mutex<Vec<u8>>>) {
    let package = temp.path().join("pkg");
    std::fs::create_dir_all(&package).unwrap();
    let (sink, buffer) = OutputSink::capture();
    let mut opts = BuildOpts::new(package);
    opts.stdout = sink;
    opts.stderr = OutputSink::Discard;
    (opts, buffer)
  }

  async fn run(manifest: &str, target: &str, opts: &BuildOpts) -> Result<TargetReport, BuildError> {
    let manifest = Manifest::parse(manifest).unwrap();
    let cancel = CancellationToken::new();
    run_target(&cancel, &manifest, target, opts).await
  }

  fn captured(buffer: &Arc<std::sync::Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
  }

  #[tokio::test]
  #[serial]
  async fn hello_world_build() {
    let temp = TempDir::new().unwrap();
    let (opts, buffer) = opts_for(&temp);

    temp_env::async_with_vars(
      [("YB_CACHE_DIR", Some(temp.path().join("cache").to_str().unwrap()))],
      async {
        let report = run(
          "build:\n  commands:\n    - \"echo hello\"\n",
          "default",
          &opts,
        )
        .await
        .unwrap();

        assert_eq!(report.timings.len(), 1);
        assert_eq!(captured(&buffer).trim(), "hello");
      },
    )
    .await;
  }

  #[tokio::test]
  #[serial]
  async fn commands_run_in_declared_order() {
    let temp = TempDir::new().unwrap();
    let (opts, buffer) = opts_for(&temp);

    temp_env::async_with_vars(
      [("YB_CACHE_DIR", Some(temp.path().join("cache").to_str().unwrap()))],
      async {
        run(
          "build:\n  commands:\n    - \"echo one\"\n    - \"echo two\"\n",
          "default",
          &opts,
        )
        .await
        .unwrap();

        assert_eq!(captured(&buffer), "one\ntwo\n");
      },
    )
    .await;
  }

  #[tokio::test]
  #[serial]
  async fn cd_updates_the_working_directory_without_spawning() {
    let temp = TempDir::new().unwrap();
    let (opts, buffer) = opts_for(&temp);
    std::fs::create_dir_all(opts.package_dir.join("sub")).unwrap();
    std::fs::write(opts.package_dir.join("sub/data.txt"), "from sub\n").unwrap();

    temp_env::async_with_vars(
      [("YB_CACHE_DIR", Some(temp.path().join("cache").to_str().unwrap()))],
      async {
        let report = run(
          "build:\n  commands:\n    - \"cd sub\"\n    - \"cat data.txt\"\n",
          "default",
          &opts,
        )
        .await
        .unwrap();

        // cd is a builtin, only cat gets timed.
        assert_eq!(report.timings.len(), 1);
        assert_eq!(captured(&buffer), "from sub\n");
      },
    )
    .await;
  }

  #[tokio::test]
  #[serial]
  async fn root_sets_the_initial_directory() {
    let temp = TempDir::new().unwrap();
    let (opts, buffer) = opts_for(&temp);
    std::fs::create_dir_all(opts.package_dir.join("svc")).unwrap();
    std::fs::write(opts.package_dir.join("svc/data.txt"), "rooted\n").unwrap();

    temp_env::async_with_vars(
      [("YB_CACHE_DIR", Some(temp.path().join("cache").to_str().unwrap()))],
      async {
        run(
          "build_targets:\n  - name: app\n    root: svc\n    commands:\n      - \"cat data.txt\"\n",
          "app",
          &opts,
        )
        .await
        .unwrap();

        assert_eq!(captured(&buffer), "rooted\n");
      },
    )
    .await;
  }

  #[tokio::test]
  #[serial]
  async fn failure_halts_the_sequence() {
    let temp = TempDir::new().unwrap();
    let (opts, buffer) = opts_for(&temp);

    temp_env::async_with_vars(
      [("YB_CACHE_DIR", Some(temp.path().join("cache").to_str().unwrap()))],
      async {
        let err = run(
          "build:\n  commands:\n    - \"echo before\"\n    - \"false\"\n    - \"echo after\"\n",
          "default",
          &opts,
        )
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 1);
        let out = captured(&buffer);
        assert!(out.contains("before"));
        assert!(!out.contains("after"));
      },
    )
    .await;
  }

  #[tokio::test]
  #[serial]
  async fn target_environment_reaches_commands() {
    let temp = TempDir::new().unwrap();
    let (opts, buffer) = opts_for(&temp);

    temp_env::async_with_vars(
      [("YB_CACHE_DIR", Some(temp.path().join("cache").to_str().unwrap()))],
      async {
        run(
          "build_targets:\n  - name: app\n    environment:\n      default:\n        - \"GREETING=hi there\"\n    commands:\n      - \"sh -c 'echo $GREETING'\"\n",
          "app",
          &opts,
        )
        .await
        .unwrap();

        assert_eq!(captured(&buffer).trim(), "hi there");
      },
    )
    .await;
  }

  #[tokio::test]
  #[serial]
  async fn invalid_command_fails_before_any_execution() {
    let temp = TempDir::new().unwrap();
    let (opts, buffer) = opts_for(&temp);

    temp_env::async_with_vars(
      [("YB_CACHE_DIR", Some(temp.path().join("cache").to_str().unwrap()))],
      async {
        let err = run(
          "build:\n  commands:\n    - \"echo ran\"\n    - \"cd /absolute\"\n",
          "default",
          &opts,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BuildError::Validation(_)));
        assert!(captured(&buffer).is_empty());
      },
    )
    .await;
  }

  mod ordering {
    use super::*;

    fn chain() -> Manifest {
      Manifest::parse(
        r#"
build_targets:
  - name: a
    commands: ["true"]
  - name: b
    build_after: [a]
    commands: ["true"]
  - name: c
    build_after: [b]
    commands: ["true"]
"#,
      )
      .unwrap()
    }

    #[test]
    fn chain_resolves_depth_first() {
      let order = build_order(&chain(), &["c".to_string()]).unwrap();
      assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn requested_order_is_deduplicated() {
      let order = build_order(&chain(), &["b".to_string(), "c".to_string(), "b".to_string()]).unwrap();
      assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_preserves_first_appearance() {
      let manifest = Manifest::parse(
        r#"
build_targets:
  - name: base
    commands: ["true"]
  - name: left
    build_after: [base]
    commands: ["true"]
  - name: right
    build_after: [base]
    commands: ["true"]
  - name: top
    build_after: [left, right]
    commands: ["true"]
"#,
      )
      .unwrap();

      let order = build_order(&manifest, &["top".to_string()]).unwrap();
      assert_eq!(order, vec!["base", "left", "right", "top"]);
    }

    #[test]
    fn cycle_is_detected() {
      let manifest = Manifest::parse(
        r#"
build_targets:
  - name: a
    build_after: [b]
    commands: ["true"]
  - name: b
    build_after: [a]
    commands: ["true"]
"#,
      )
      .unwrap();

      let err = build_order(&manifest, &["a".to_string()]).unwrap_err();
      assert!(matches!(err, ManifestError::DependencyCycle(_)));
    }

    #[test]
    fn unknown_target_is_rejected() {
      let err = build_order(&chain(), &["ghost".to_string()]).unwrap_err();
      assert!(matches!(err, ManifestError::NoSuchTarget(_)));
    }
  }
}
