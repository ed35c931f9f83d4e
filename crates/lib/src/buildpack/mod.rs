//! Toolchain provisioning.
//!
//! A buildpack makes one `tool:version` pair usable inside a biome. The
//! payload is always installed on the host under the shared tools cache
//! (which container biomes bind-mount), so versions are downloaded and
//! extracted once and shared across packages and targets.
//!
//! Install is idempotent per `<tools>/<tool>/<version>`: a populated
//! directory is trusted and skipped. Extraction goes through a `.tmp`
//! sibling renamed into place, so an interrupted install leaves nothing
//! the next attempt would mistake for a finished one.

mod go;
mod gradle;
mod java;
mod node;
mod python;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::ExtractError;
use crate::biome::{Biome, BiomeError, EnvOverlay};
use crate::download::{DownloadCache, DownloadError};
use crate::manifest::BuildpackSpec;

#[derive(Debug, Error)]
pub enum BuildpackError {
  #[error("unknown tool: {0}")]
  UnknownTool(String),

  #[error("unsupported platform for {tool}: {platform}")]
  UnsupportedPlatform { tool: String, platform: String },

  #[error("invalid version for {tool}: {version}")]
  InvalidVersion { tool: String, version: String },

  #[error("buildpacks disagree on environment variable {var}: '{first}' vs '{second}'")]
  EnvCollision { var: String, first: String, second: String },

  #[error(transparent)]
  Download(#[from] DownloadError),

  #[error(transparent)]
  Extract(#[from] ExtractError),

  #[error(transparent)]
  Biome(#[from] BiomeError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Everything a buildpack needs to install and describe itself.
pub struct BuildpackCtx<'a> {
  pub spec: &'a BuildpackSpec,
  pub biome: &'a dyn Biome,
  pub cache: &'a DownloadCache,
  /// Host-side tools root where payloads are extracted.
  pub host_tools: &'a Path,
  pub cancel: &'a CancellationToken,
}

impl BuildpackCtx<'_> {
  /// Host path of this tool version's install directory.
  pub fn host_install_dir(&self) -> PathBuf {
    self.host_tools.join(&self.spec.tool).join(&self.spec.version)
  }

  /// The same directory in the biome's native path syntax.
  pub fn biome_install_dir(&self) -> String {
    let tools = self.biome.dirs().tools.clone();
    self.biome.join_path(&[&tools, &self.spec.tool, &self.spec.version])
  }
}

/// One provisionable toolchain.
#[async_trait]
pub trait Buildpack: Send + Sync + std::fmt::Debug {
  /// Fetch and extract the payload. Returns the host install directory.
  /// Must be a no-op when the directory is already populated.
  async fn install(&self, ctx: &BuildpackCtx<'_>) -> Result<PathBuf, BuildpackError>;

  /// The environment mutations that make the installed tool usable,
  /// expressed in the biome's path syntax.
  fn setup(&self, ctx: &BuildpackCtx<'_>) -> Result<EnvOverlay, BuildpackError>;
}

/// Resolve a tool name to its buildpack.
pub fn lookup(tool: &str) -> Result<Box<dyn Buildpack>, BuildpackError> {
  match tool {
    "go" | "golang" => Ok(Box::new(go::GoBuildpack)),
    "node" | "nodejs" => Ok(Box::new(node::NodeBuildpack)),
    "python" | "miniconda" => Ok(Box::new(python::PythonBuildpack)),
    "java" => Ok(Box::new(java::JavaBuildpack)),
    "gradle" => Ok(Box::new(gradle::GradleBuildpack)),
    other => Err(BuildpackError::UnknownTool(other.to_string())),
  }
}

/// Install every buildpack for a target and merge their overlays.
///
/// Installation order is shuffled so undeclared ordering assumptions
/// between buildpacks surface as failures; `seed` pins the shuffle for
/// deterministic replay in tests. Two buildpacks exporting the same
/// variable with different values is an error.
pub async fn install_all(
  cancel: &CancellationToken,
  biome: &dyn Biome,
  cache: &DownloadCache,
  host_tools: &Path,
  specs: &[BuildpackSpec],
  seed: Option<u64>,
) -> Result<EnvOverlay, BuildpackError> {
  let mut order: Vec<&BuildpackSpec> = specs.iter().collect();
  let mut rng = match seed {
    Some(seed) => StdRng::seed_from_u64(seed),
    None => StdRng::from_entropy(),
  };
  order.shuffle(&mut rng);

  let mut overlay = EnvOverlay::new();
  for spec in order {
    let pack = lookup(&spec.tool)?;
    let ctx = BuildpackCtx {
      spec,
      biome,
      cache,
      host_tools,
      cancel,
    };

    info!(tool = %spec.tool, version = %spec.version, "installing buildpack");
    let install_dir = pack.install(&ctx).await?;
    debug!(tool = %spec.tool, dir = %install_dir.display(), "buildpack installed");

    overlay = merge_checked(overlay, pack.setup(&ctx)?)?;
  }

  Ok(overlay)
}

/// Merge overlays, rejecting conflicting values for the same variable.
fn merge_checked(base: EnvOverlay, next: EnvOverlay) -> Result<EnvOverlay, BuildpackError> {
  for (var, value) in &next.vars {
    if let Some(existing) = base.vars.get(var) {
      if existing != value {
        return Err(BuildpackError::EnvCollision {
          var: var.clone(),
          first: existing.clone(),
          second: value.clone(),
        });
      }
    }
  }
  Ok(base.merge(&next))
}

/// Download `url` and extract it into the context's install directory,
/// skipping everything when the directory is already populated.
pub(crate) async fn fetch_and_unpack(
  ctx: &BuildpackCtx<'_>,
  url: &str,
  strip_components: usize,
) -> Result<PathBuf, BuildpackError> {
  let install_dir = ctx.host_install_dir();
  if is_populated(&install_dir) {
    debug!(dir = %install_dir.display(), "install directory already populated");
    return Ok(install_dir);
  }

  let archive = ctx.cache.download(ctx.cancel, url).await?;
  unpack_fresh(&archive, &install_dir, strip_components, ctx.cancel).await?;
  Ok(install_dir)
}

/// Extract into `<dir>.tmp` then rename, leaving no half-finished tree.
///
/// Extraction is blocking work, so it runs off the async runtime; the
/// token stops it between entries and leaves only the staging dir
/// behind, which the next attempt clears.
pub(crate) async fn unpack_fresh(
  archive: &Path,
  install_dir: &Path,
  strip_components: usize,
  cancel: &CancellationToken,
) -> Result<(), BuildpackError> {
  // Versions contain dots, so build the staging name by hand instead of
  // with_extension.
  let staging = match install_dir.file_name() {
    Some(name) => install_dir.with_file_name(format!("{}.tmp", name.to_string_lossy())),
    None => install_dir.with_extension("tmp"),
  };
  if staging.exists() {
    std::fs::remove_dir_all(&staging)?;
  }
  std::fs::create_dir_all(&staging)?;

  let archive = archive.to_path_buf();
  let staging_dir = staging.clone();
  let token = cancel.clone();
  tokio::task::spawn_blocking(move || {
    crate::archive::unpack_archive(&archive, &staging_dir, strip_components, &token)
  })
  .await
  .map_err(|e| BuildpackError::Io(std::io::Error::other(e)))??;

  if let Some(parent) = install_dir.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::rename(&staging, install_dir)?;
  Ok(())
}

pub(crate) fn is_populated(dir: &Path) -> bool {
  std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::biome::HostBiome;
  use tempfile::TempDir;

  fn specs(names: &[&str]) -> Vec<BuildpackSpec> {
    names
      .iter()
      .map(|n| BuildpackSpec::parse(&format!("{n}:1.0.0")).unwrap())
      .collect()
  }

  #[test]
  fn lookup_resolves_known_tools() {
    for tool in ["go", "node", "python", "java", "gradle"] {
      assert!(lookup(tool).is_ok(), "{tool} should resolve");
    }
  }

  #[test]
  fn lookup_rejects_unknown_tool() {
    let err = lookup("cobol").unwrap_err();
    assert!(matches!(err, BuildpackError::UnknownTool(t) if t == "cobol"));
  }

  #[test]
  fn merge_checked_allows_distinct_vars() {
    let a = EnvOverlay::new().with_var("GOROOT", "/t/go");
    let b = EnvOverlay::new().with_var("JAVA_HOME", "/t/java");
    let merged = merge_checked(a, b).unwrap();
    assert_eq!(merged.vars.len(), 2);
  }

  #[test]
  fn merge_checked_allows_agreeing_duplicates() {
    let a = EnvOverlay::new().with_var("LANG_HOME", "/t/x");
    let b = EnvOverlay::new().with_var("LANG_HOME", "/t/x");
    assert!(merge_checked(a, b).is_ok());
  }

  #[test]
  fn merge_checked_rejects_conflicts() {
    let a = EnvOverlay::new().with_var("TOOL_HOME", "/t/a");
    let b = EnvOverlay::new().with_var("TOOL_HOME", "/t/b");
    let err = merge_checked(a, b).unwrap_err();
    assert!(matches!(err, BuildpackError::EnvCollision { var, .. } if var == "TOOL_HOME"));
  }

  #[test]
  fn shuffle_is_deterministic_under_a_seed() {
    let specs = specs(&["go", "node", "java", "gradle", "python"]);

    let shuffled = |seed| {
      let mut order: Vec<&BuildpackSpec> = specs.iter().collect();
      order.shuffle(&mut StdRng::seed_from_u64(seed));
      order.iter().map(|s| s.tool.clone()).collect::<Vec<_>>()
    };

    assert_eq!(shuffled(42), shuffled(42));
  }

  #[tokio::test]
  async fn populated_install_dir_skips_download() {
    let temp = TempDir::new().unwrap();
    let host_tools = temp.path().join("tools");
    let install = host_tools.join("go").join("1.21.5");
    std::fs::create_dir_all(&install).unwrap();
    std::fs::write(install.join("marker"), b"x").unwrap();

    let package = temp.path().join("pkg");
    std::fs::create_dir_all(&package).unwrap();
    let biome = HostBiome::with_dirs(package, temp.path().join("home"), host_tools.clone());
    let cache = DownloadCache::new(temp.path().join("downloads"));
    let cancel = CancellationToken::new();
    let spec = BuildpackSpec::parse("go:1.21.5").unwrap();
    let ctx = BuildpackCtx {
      spec: &spec,
      biome: &biome,
      cache: &cache,
      host_tools: &host_tools,
      cancel: &cancel,
    };

    // The URL is unroutable; a skipped install never touches it.
    let dir = fetch_and_unpack(&ctx, "http://192.0.2.1/never", 1).await.unwrap();
    assert_eq!(dir, install);
  }

  fn make_payload(dir: &Path) -> PathBuf {
    let archive = dir.join("payload.tar.gz");
    let encoder = flate2::write::GzEncoder::new(
      std::fs::File::create(&archive).unwrap(),
      flate2::Compression::default(),
    );
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(5);
    header.set_mode(0o644);
    header.set_cksum();
    builder
      .append_data(&mut header, "tool-1.0/bin/tool", &b"hello"[..])
      .unwrap();
    builder.into_inner().unwrap().finish().unwrap();
    archive
  }

  #[tokio::test]
  async fn unpack_fresh_renames_staging_into_place() {
    let temp = TempDir::new().unwrap();
    let archive = make_payload(temp.path());

    let install = temp.path().join("tools").join("tool").join("1.0");
    unpack_fresh(&archive, &install, 1, &CancellationToken::new()).await.unwrap();

    assert!(install.join("bin/tool").is_file());
    assert!(!install.with_file_name("1.0.tmp").exists());
  }

  #[tokio::test]
  async fn unpack_fresh_stops_on_cancellation() {
    let temp = TempDir::new().unwrap();
    let archive = make_payload(temp.path());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let install = temp.path().join("tools").join("tool").join("1.0");
    let err = unpack_fresh(&archive, &install, 1, &cancel).await.unwrap_err();

    assert!(matches!(err, BuildpackError::Extract(ExtractError::Cancelled)));
    // Nothing renamed into place, so the next attempt starts clean.
    assert!(!install.exists());
  }
}
