//! Serde model of the on-disk manifest.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::manifest::ManifestError;

/// A parsed `tool:version` buildpack reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildpackSpec {
  pub tool: String,
  pub version: String,
}

impl BuildpackSpec {
  /// Parse a `tool:version` string. Both halves must be non-empty.
  pub fn parse(raw: &str) -> Result<Self, ManifestError> {
    let (tool, version) = raw
      .split_once(':')
      .ok_or_else(|| ManifestError::InvalidToolSpec(raw.to_string()))?;

    if tool.is_empty() || version.is_empty() {
      return Err(ManifestError::InvalidToolSpec(raw.to_string()));
    }

    Ok(Self {
      tool: tool.to_string(),
      version: version.to_string(),
    })
  }
}

impl std::fmt::Display for BuildpackSpec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.tool, self.version)
  }
}

/// TCP readiness probe for a service container.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PortWaitCheck {
  /// Container-side port to probe.
  pub port: u16,

  /// Seconds to keep probing before the build aborts.
  #[serde(default = "default_port_wait_timeout")]
  pub timeout: u64,
}

fn default_port_wait_timeout() -> u64 {
  30
}

/// Declarative description of one container, used both for auxiliary
/// services and as the build biome itself.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ContainerDef {
  pub image: String,

  #[serde(default)]
  pub label: String,

  /// `host-path:container-path` bind mounts, relative host paths are
  /// joined to the package directory.
  #[serde(default)]
  pub mounts: Vec<String>,

  /// `host:container` port publications.
  #[serde(default)]
  pub ports: Vec<String>,

  /// `KEY=VALUE` entries.
  #[serde(default)]
  pub environment: Vec<String>,

  /// Override for the image entrypoint command.
  #[serde(default)]
  pub command: Option<String>,

  #[serde(default)]
  pub port_check: Option<PortWaitCheck>,
}

/// `dependencies:` block shared by targets and the exec phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dependencies {
  #[serde(default)]
  pub build: Vec<String>,

  #[serde(default)]
  pub containers: BTreeMap<String, ContainerDef>,
}

/// One named unit of work.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
  pub name: String,

  /// Subdirectory of the package the commands start in.
  #[serde(default)]
  pub root: String,

  #[serde(default)]
  pub build_after: Vec<String>,

  #[serde(default)]
  pub dependencies: Dependencies,

  /// When present, this target runs inside the given container image
  /// instead of on the host.
  #[serde(default)]
  pub container: Option<ContainerDef>,

  /// Env lists keyed by environment name (`default` is used by builds).
  #[serde(default)]
  pub environment: BTreeMap<String, Vec<String>>,

  #[serde(default)]
  pub commands: Vec<String>,

  /// Normalized buildpack specs, global deps merged under target deps.
  /// Populated by [`Manifest::normalize`](crate::manifest::Manifest).
  #[serde(skip)]
  pub buildpacks: Vec<BuildpackSpec>,
}

impl Target {
  /// `KEY=VALUE` entries for the named environment, `default` by default.
  pub fn env_for(&self, env_name: &str) -> &[String] {
    self.environment.get(env_name).map(Vec::as_slice).unwrap_or_default()
  }
}

/// Top-level `build:` block used when no `build_targets` are declared.
#[derive(Debug, Clone, Deserialize)]
pub struct AnonymousBuild {
  #[serde(default)]
  pub root: String,

  #[serde(default)]
  pub dependencies: Dependencies,

  #[serde(default)]
  pub container: Option<ContainerDef>,

  #[serde(default)]
  pub environment: BTreeMap<String, Vec<String>>,

  #[serde(default)]
  pub commands: Vec<String>,
}

/// The `exec:` block - run the package the way `yb exec` would.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecPhase {
  #[serde(default)]
  pub dependencies: Dependencies,

  #[serde(default)]
  pub environment: BTreeMap<String, Vec<String>>,

  #[serde(default)]
  pub commands: Vec<String>,

  /// Normalized buildpack specs, filled during manifest normalization.
  #[serde(skip)]
  pub buildpacks: Vec<BuildpackSpec>,
}

/// `package:` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageSection {
  #[serde(default)]
  pub artifacts: Vec<String>,
}
