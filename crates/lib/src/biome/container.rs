//! Container biome: runs the target inside a Docker container.
//!
//! The container is created on demand from the image named in the
//! target's `container:` block. The host package directory is
//! bind-mounted at `/workspace`, the per-target HOME cache at `/root`,
//! and the shared tools cache at `/root/.cache/yb/tools`, so toolchain
//! installs survive across builds exactly as they do on the host.

use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manifest::ContainerDef;

use super::{slash, Arch, Biome, BiomeError, Descriptor, Dirs, EnvOverlay, Invocation, Os};

/// In-container path of the package bind mount.
pub const CONTAINER_PACKAGE_DIR: &str = "/workspace";
/// In-container HOME.
pub const CONTAINER_HOME_DIR: &str = "/root";
/// In-container tools cache.
pub const CONTAINER_TOOLS_DIR: &str = "/root/.cache/yb/tools";

const CONTAINER_DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A biome backed by a Docker container created for one target.
pub struct ContainerBiome {
  docker: Docker,
  container_id: String,
  dirs: Dirs,
  descriptor: Descriptor,
}

impl ContainerBiome {
  /// Pull the image if needed, create and start the build container.
  ///
  /// When `network` is given the container joins that per-build network
  /// so it can reach the auxiliary service containers by IP.
  pub async fn provision(
    def: &ContainerDef,
    package_dir: &Path,
    home_dir: &Path,
    tools_dir: &Path,
    network: Option<&str>,
  ) -> Result<Self, BiomeError> {
    let docker = Docker::connect_with_local_defaults()?;

    ensure_image(&docker, &def.image).await?;

    let binds = bind_specs(def, package_dir, home_dir, tools_dir);
    let cmd = keepalive_command(def);

    let host_config = HostConfig {
      binds: Some(binds),
      network_mode: network.map(str::to_string),
      ..Default::default()
    };

    let config = Config {
      image: Some(def.image.clone()),
      cmd: Some(cmd),
      env: Some(def.environment.clone()),
      working_dir: Some(CONTAINER_PACKAGE_DIR.to_string()),
      host_config: Some(host_config),
      tty: Some(true),
      ..Default::default()
    };

    let created = docker
      .create_container(None::<CreateContainerOptions<String>>, config)
      .await?;
    docker.start_container::<String>(&created.id, None).await?;

    info!(image = %def.image, id = %created.id, "started build container");

    Ok(Self {
      docker,
      container_id: created.id,
      dirs: Dirs {
        package: CONTAINER_PACKAGE_DIR.to_string(),
        home: CONTAINER_HOME_DIR.to_string(),
        tools: CONTAINER_TOOLS_DIR.to_string(),
      },
      descriptor: Descriptor {
        os: Os::Linux,
        arch: Arch::current(),
      },
    })
  }

  /// IPv4 address of the build container on its network, when attached.
  pub async fn ip_address(&self) -> Result<Option<String>, BiomeError> {
    let inspect = self.docker.inspect_container(&self.container_id, None).await?;
    let ip = inspect
      .network_settings
      .and_then(|s| s.networks)
      .and_then(|nets| nets.values().filter_map(|n| n.ip_address.clone()).find(|ip| !ip.is_empty()));
    Ok(ip)
  }
}

#[async_trait]
impl Biome for ContainerBiome {
  fn describe(&self) -> Descriptor {
    self.descriptor
  }

  fn dirs(&self) -> &Dirs {
    &self.dirs
  }

  fn default_path(&self) -> String {
    CONTAINER_DEFAULT_PATH.to_string()
  }

  fn path_separator(&self) -> char {
    ':'
  }

  fn join_path(&self, parts: &[&str]) -> String {
    slash::join(parts)
  }

  fn clean_path(&self, path: &str) -> String {
    slash::clean(path)
  }

  fn is_abs_path(&self, path: &str) -> bool {
    slash::is_abs(path)
  }

  async fn run(&self, cancel: &CancellationToken, invocation: Invocation) -> Result<(), BiomeError> {
    if invocation.argv.is_empty() {
      return Err(BiomeError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "empty argv",
      )));
    }

    let working_dir = match invocation.dir.as_deref() {
      Some(dir) if slash::is_abs(dir) => dir.to_string(),
      Some(dir) => slash::clean(&slash::join(&[&self.dirs.package, dir])),
      None => self.dirs.package.clone(),
    };

    let env = render_exec_env(&invocation.env, CONTAINER_DEFAULT_PATH, &self.dirs.home);
    debug!(argv = ?invocation.argv, dir = %working_dir, "container exec");

    let exec = self
      .docker
      .create_exec(
        &self.container_id,
        CreateExecOptions {
          cmd: Some(invocation.argv.clone()),
          env: Some(env),
          working_dir: Some(working_dir),
          attach_stdout: Some(true),
          attach_stderr: Some(true),
          attach_stdin: Some(invocation.stdin.is_some()),
          ..Default::default()
        },
      )
      .await?;

    let results = self.docker.start_exec(&exec.id, None).await?;
    if let StartExecResults::Attached { mut output, mut input } = results {
      if let Some(bytes) = &invocation.stdin {
        input.write_all(bytes).await?;
        input.shutdown().await?;
      }

      loop {
        let item = tokio::select! {
          item = output.next() => item,
          _ = cancel.cancelled() => {
            warn!(argv = ?invocation.argv, "container exec cancelled");
            return Err(BiomeError::Cancelled);
          }
        };

        match item {
          Some(Ok(bollard::container::LogOutput::StdOut { message })) => invocation.stdout.write(&message),
          Some(Ok(bollard::container::LogOutput::StdErr { message })) => invocation.stderr.write(&message),
          Some(Ok(_)) => {}
          Some(Err(e)) => return Err(BiomeError::Docker(e)),
          None => break,
        }
      }
    }

    let inspect = self.docker.inspect_exec(&exec.id).await?;
    match inspect.exit_code {
      Some(0) | None => Ok(()),
      Some(code) => Err(BiomeError::CommandFailed {
        argv: invocation.argv,
        code: Some(code as i32),
      }),
    }
  }

  async fn close(&self) -> Result<(), BiomeError> {
    debug!(id = %self.container_id, "removing build container");
    let _ = self
      .docker
      .stop_container(&self.container_id, Some(StopContainerOptions { t: 5 }))
      .await;
    self
      .docker
      .remove_container(
        &self.container_id,
        Some(RemoveContainerOptions {
          force: true,
          ..Default::default()
        }),
      )
      .await?;
    Ok(())
  }
}

/// Pull an image unless it is already present locally.
pub(crate) async fn ensure_image(docker: &Docker, image: &str) -> Result<(), bollard::errors::Error> {
  if docker.inspect_image(image).await.is_ok() {
    return Ok(());
  }

  info!(image, "pulling image");
  let mut pull = docker.create_image(
    Some(CreateImageOptions {
      from_image: image.to_string(),
      ..Default::default()
    }),
    None,
    None,
  );
  while let Some(progress) = pull.next().await {
    progress?;
  }
  Ok(())
}

/// Compose the bind-mount list: the three canonical mounts plus any
/// mounts declared on the container definition (relative host paths are
/// joined to the package directory).
fn bind_specs(def: &ContainerDef, package_dir: &Path, home_dir: &Path, tools_dir: &Path) -> Vec<String> {
  let mut binds = vec![
    format!("{}:{}", package_dir.display(), CONTAINER_PACKAGE_DIR),
    format!("{}:{}", home_dir.display(), CONTAINER_HOME_DIR),
    format!("{}:{}", tools_dir.display(), CONTAINER_TOOLS_DIR),
  ];

  for mount in &def.mounts {
    match mount.split_once(':') {
      Some((host, container)) if !Path::new(host).is_absolute() => {
        binds.push(format!("{}:{}", package_dir.join(host).display(), container));
      }
      _ => binds.push(mount.clone()),
    }
  }

  binds
}

/// The command that keeps the build container alive between execs.
fn keepalive_command(def: &ContainerDef) -> Vec<String> {
  match &def.command {
    Some(command) => shlex::split(command).unwrap_or_else(|| vec![command.clone()]),
    None => vec!["sleep".to_string(), "infinity".to_string()],
  }
}

/// Render an overlay into docker-exec `KEY=VALUE` form, including the
/// deterministic PATH and HOME.
fn render_exec_env(overlay: &EnvOverlay, default_path: &str, home: &str) -> Vec<String> {
  let mut env = vec![
    format!("PATH={}", overlay.effective_path(default_path, ':')),
    format!("HOME={home}"),
    "LANG=C".to_string(),
    "LC_ALL=C".to_string(),
  ];
  for (key, value) in &overlay.vars {
    env.push(format!("{key}={value}"));
  }
  env
}
