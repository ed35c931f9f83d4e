//! Auxiliary service container lifecycle.
//!
//! Each target may declare service containers (a database, a queue)
//! that must be running before the first command. The manager starts
//! them on a per-build network, waits for declared ports to accept TCP
//! connections, and exposes their IPv4 addresses for env templating.
//!
//! An externally managed container can be adopted instead: when
//! `YB_CONTAINER_<LABEL>_IP` is set, its value is recorded and no
//! container is started under that label.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use rand::RngCore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consts::CONTAINER_IP_ENV_PREFIX;
use crate::manifest::{ContainerDef, PortWaitCheck};
use crate::template::ExpansionContext;

const PORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ResourceError {
  #[error("docker error: {0}")]
  Docker(#[from] bollard::errors::Error),

  #[error("container '{label}' has no IP address")]
  NoAddress { label: String },

  #[error("container '{label}' port {port} not ready after {timeout}s")]
  PortWaitTimeout { label: String, port: u16, timeout: u64 },

  #[error("startup cancelled")]
  Cancelled,
}

/// Lifecycle of one managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
  Pending,
  Creating,
  Running,
  Stopped,
  Removed,
}

impl ContainerState {
  /// Legal transitions only move forward through the lifecycle.
  pub fn can_become(self, next: ContainerState) -> bool {
    use ContainerState::*;
    matches!(
      (self, next),
      (Pending, Creating) | (Creating, Running) | (Running, Stopped) | (Stopped, Removed)
    )
  }
}

struct ManagedContainer {
  label: String,
  id: String,
  state: ContainerState,
}

/// Starts and tears down the service containers of one build.
pub struct ResourceManager {
  docker: Option<Docker>,
  network: Option<String>,
  containers: Vec<ManagedContainer>,
  ips: BTreeMap<String, String>,
  reuse: bool,
}

impl ResourceManager {
  pub fn new(reuse: bool) -> Self {
    Self {
      docker: None,
      network: None,
      containers: Vec::new(),
      ips: BTreeMap::new(),
      reuse,
    }
  }

  /// Label -> IPv4 map for env template expansion.
  pub fn expansion_context(&self) -> ExpansionContext {
    ExpansionContext::with_containers(self.ips.clone())
  }

  /// Name of the per-build network, once any container has started.
  pub fn network(&self) -> Option<&str> {
    self.network.as_deref()
  }

  /// Ensure every declared container is running and reachable.
  ///
  /// Adopted containers (those with a `YB_CONTAINER_<LABEL>_IP`
  /// override) are recorded without touching the Docker daemon at all.
  pub async fn start_all(
    &mut self,
    cancel: &CancellationToken,
    containers: &BTreeMap<String, ContainerDef>,
  ) -> Result<(), ResourceError> {
    for (label, def) in containers {
      if let Some(ip) = adopted_ip(label) {
        info!(label, ip = %ip, "adopting externally managed container");
        self.ips.insert(label.clone(), ip);
        continue;
      }

      if cancel.is_cancelled() {
        return Err(ResourceError::Cancelled);
      }

      self.start_one(cancel, label, def).await?;
    }
    Ok(())
  }

  async fn start_one(
    &mut self,
    cancel: &CancellationToken,
    label: &str,
    def: &ContainerDef,
  ) -> Result<(), ResourceError> {
    let docker = match &self.docker {
      Some(docker) => docker.clone(),
      None => {
        let docker = Docker::connect_with_local_defaults()?;
        self.docker = Some(docker.clone());
        docker
      }
    };

    let network = match &self.network {
      Some(network) => network.clone(),
      None => {
        let network = network_name();
        docker
          .create_network(CreateNetworkOptions {
            name: network.clone(),
            ..Default::default()
          })
          .await?;
        debug!(network = %network, "created build network");
        self.network = Some(network.clone());
        network
      }
    };

    crate::biome::container::ensure_image(&docker, &def.image).await?;

    let mut managed = ManagedContainer {
      label: label.to_string(),
      id: String::new(),
      state: ContainerState::Creating,
    };

    let config = Config {
      image: Some(def.image.clone()),
      env: Some(def.environment.clone()),
      cmd: def.command.as_deref().and_then(shlex::split),
      host_config: Some(HostConfig {
        network_mode: Some(network),
        port_bindings: port_bindings(&def.ports),
        ..Default::default()
      }),
      ..Default::default()
    };

    let created = docker
      .create_container(None::<CreateContainerOptions<String>>, config)
      .await?;
    managed.id = created.id.clone();

    docker
      .start_container(&created.id, None::<StartContainerOptions<String>>)
      .await?;
    managed.state = ContainerState::Running;
    info!(label, image = %def.image, id = %created.id, "started service container");

    let ip = container_ip(&docker, &created.id).await?.ok_or_else(|| ResourceError::NoAddress {
      label: label.to_string(),
    })?;

    // Containers started this build are torn down even when a later
    // one fails, so record before the port wait.
    self.containers.push(managed);
    self.ips.insert(label.to_string(), ip.clone());

    if let Some(check) = &def.port_check {
      wait_for_port(cancel, label, &ip, check).await?;
    }

    Ok(())
  }

  /// Stop and remove everything this build started. Reuse mode leaves
  /// containers running for the next invocation. Errors are logged and
  /// skipped so teardown always finishes.
  pub async fn teardown(&mut self) {
    if self.reuse {
      info!("leaving service containers running for reuse");
      return;
    }

    let Some(docker) = &self.docker else { return };

    for container in &mut self.containers {
      if let Err(err) = docker
        .stop_container(&container.id, Some(StopContainerOptions { t: 5 }))
        .await
      {
        warn!(label = %container.label, error = %err, "failed to stop container");
      } else {
        container.state = ContainerState::Stopped;
      }

      if let Err(err) = docker
        .remove_container(
          &container.id,
          Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
          }),
        )
        .await
      {
        warn!(label = %container.label, error = %err, "failed to remove container");
      } else {
        container.state = ContainerState::Removed;
      }
    }

    if let Some(network) = self.network.take() {
      if let Err(err) = docker.remove_network(&network).await {
        warn!(network = %network, error = %err, "failed to remove network");
      }
    }
  }
}

/// `YB_CONTAINER_<LABEL>_IP` override, with the label uppercased.
fn adopted_ip(label: &str) -> Option<String> {
  let var = format!("{CONTAINER_IP_ENV_PREFIX}{}_IP", label.to_uppercase());
  std::env::var(&var).ok().filter(|v| !v.is_empty())
}

fn network_name() -> String {
  let mut bytes = [0u8; 8];
  rand::thread_rng().fill_bytes(&mut bytes);
  format!("yb-{}", hex::encode(bytes))
}

/// Map `host:container` publications to the Docker API shape.
fn port_bindings(ports: &[String]) -> Option<HashMap<String, Option<Vec<PortBinding>>>> {
  if ports.is_empty() {
    return None;
  }

  let mut bindings = HashMap::new();
  for spec in ports {
    let Some((host, container)) = spec.split_once(':') else {
      continue;
    };
    bindings.insert(
      format!("{container}/tcp"),
      Some(vec![PortBinding {
        host_ip: None,
        host_port: Some(host.to_string()),
      }]),
    );
  }
  Some(bindings)
}

async fn container_ip(docker: &Docker, id: &str) -> Result<Option<String>, ResourceError> {
  let inspect = docker.inspect_container(id, None).await?;
  Ok(
    inspect
      .network_settings
      .and_then(|s| s.networks)
      .and_then(|nets| nets.values().filter_map(|n| n.ip_address.clone()).find(|ip| !ip.is_empty())),
  )
}

/// Poll a TCP connect against `ip:port` once a second until it succeeds
/// or the check's timeout elapses.
async fn wait_for_port(
  cancel: &CancellationToken,
  label: &str,
  ip: &str,
  check: &PortWaitCheck,
) -> Result<(), ResourceError> {
  let addr: SocketAddr = match ip.parse::<IpAddr>() {
    Ok(ip) => SocketAddr::new(ip, check.port),
    Err(_) => {
      return Err(ResourceError::NoAddress {
        label: label.to_string(),
      });
    }
  };

  let deadline = tokio::time::Instant::now() + Duration::from_secs(check.timeout);
  loop {
    // Bound each attempt so a blackholed address cannot stall the poll.
    let attempt = tokio::time::timeout(PORT_POLL_INTERVAL, tokio::net::TcpStream::connect(addr)).await;
    if matches!(attempt, Ok(Ok(_))) {
      debug!(label, port = check.port, "port is ready");
      return Ok(());
    }

    if tokio::time::Instant::now() >= deadline {
      return Err(ResourceError::PortWaitTimeout {
        label: label.to_string(),
        port: check.port,
        timeout: check.timeout,
      });
    }

    tokio::select! {
      _ = tokio::time::sleep(PORT_POLL_INTERVAL) => {}
      _ = cancel.cancelled() => return Err(ResourceError::Cancelled),
    }
  }
}
