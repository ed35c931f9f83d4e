//! Manifest loading and normalization.
//!
//! The manifest (`.yourbase.yml`) is deserialized, then normalized:
//!
//! - A bare top-level `build:` block becomes a single target named
//!   `default`.
//! - Global `dependencies.build` entries are merged into each target's
//!   deps; when a target already lists the same tool (any version), the
//!   target's spec wins.
//! - Tool specs missing a `:version` are rejected at load time.
//! - `build_after` references are checked against the target set.

mod types;

pub use types::{AnonymousBuild, BuildpackSpec, ContainerDef, Dependencies, ExecPhase, PackageSection, PortWaitCheck, Target};

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::consts::DEFAULT_TARGET;

/// Errors raised while loading or validating a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read manifest {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse manifest: {0}")]
  Parse(#[from] serde_yaml::Error),

  /// A dependency entry is not of the form `tool:version`.
  #[error("invalid tool spec '{0}': expected tool:version")]
  InvalidToolSpec(String),

  #[error("duplicate build target: {0}")]
  DuplicateTarget(String),

  #[error("target '{target}' builds after unknown target '{dependency}'")]
  UnknownBuildAfter { target: String, dependency: String },

  #[error("no such build target: {0}")]
  NoSuchTarget(String),

  #[error("dependency cycle involving target '{0}'")]
  DependencyCycle(String),

  /// Requested against a registry that has no such buildpack.
  #[error("unknown build tool: {0}")]
  UnknownTool(String),
}

/// The loaded, normalized manifest. Immutable after [`Manifest::load`].
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
  #[serde(default)]
  pub dependencies: Dependencies,

  #[serde(default)]
  pub build_targets: Vec<Target>,

  #[serde(default)]
  build: Option<AnonymousBuild>,

  #[serde(default)]
  pub exec: Option<ExecPhase>,

  #[serde(default)]
  pub package: Option<PackageSection>,
}

impl Manifest {
  /// Load and normalize a manifest file.
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
      path: path.display().to_string(),
      source: e,
    })?;
    Self::parse(&contents)
  }

  /// Parse and normalize manifest text.
  pub fn parse(contents: &str) -> Result<Self, ManifestError> {
    let mut manifest: Manifest = serde_yaml::from_str(contents)?;
    manifest.normalize()?;
    Ok(manifest)
  }

  /// Look up a target by name.
  pub fn target(&self, name: &str) -> Result<&Target, ManifestError> {
    self
      .build_targets
      .iter()
      .find(|t| t.name == name)
      .ok_or_else(|| ManifestError::NoSuchTarget(name.to_string()))
  }

  fn normalize(&mut self) -> Result<(), ManifestError> {
    // A manifest without explicit targets but with a top-level build
    // block gets a single anonymous target named `default`.
    if self.build_targets.is_empty() {
      if let Some(build) = self.build.take() {
        debug!("synthesizing anonymous default target");
        self.build_targets.push(Target {
          name: DEFAULT_TARGET.to_string(),
          root: build.root,
          build_after: Vec::new(),
          dependencies: build.dependencies,
          container: build.container,
          environment: build.environment,
          commands: build.commands,
          buildpacks: Vec::new(),
        });
      }
    }

    let global = parse_specs(&self.dependencies.build)?;

    let mut seen = BTreeSet::new();
    for target in &self.build_targets {
      if !seen.insert(target.name.clone()) {
        return Err(ManifestError::DuplicateTarget(target.name.clone()));
      }
    }

    for target in &mut self.build_targets {
      let local = parse_specs(&target.dependencies.build)?;
      target.buildpacks = merge_specs(&global, local);
    }

    if let Some(exec) = &mut self.exec {
      let local = parse_specs(&exec.dependencies.build)?;
      exec.buildpacks = merge_specs(&global, local);
    }

    // build_after may only name targets in this manifest.
    let names: BTreeSet<&str> = self.build_targets.iter().map(|t| t.name.as_str()).collect();
    for target in &self.build_targets {
      for dep in &target.build_after {
        if !names.contains(dep.as_str()) {
          return Err(ManifestError::UnknownBuildAfter {
            target: target.name.clone(),
            dependency: dep.clone(),
          });
        }
      }
    }

    Ok(())
  }
}

fn parse_specs(raw: &[String]) -> Result<Vec<BuildpackSpec>, ManifestError> {
  raw.iter().map(|s| BuildpackSpec::parse(s)).collect()
}

/// Merge global specs under local ones. A local spec for the same tool
/// (any version) shadows the global spec; order is locals first, then
/// non-shadowed globals in declaration order.
fn merge_specs(global: &[BuildpackSpec], local: Vec<BuildpackSpec>) -> Vec<BuildpackSpec> {
  let mut merged = local;
  for spec in global {
    if !merged.iter().any(|s| s.tool == spec.tool) {
      merged.push(spec.clone());
    }
  }
  merged
}
