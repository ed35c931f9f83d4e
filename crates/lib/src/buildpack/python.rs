//! Python toolchain, provisioned through the Miniconda installer.
//!
//! Unlike the archive-based tools, Miniconda ships a self-extracting
//! shell script that must run inside the target environment, so this is
//! the one buildpack whose install step executes through the biome. The
//! installer is staged under the shared tools cache, which container
//! biomes bind-mount, so the same host copy works everywhere.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::biome::{Arch, Descriptor, EnvOverlay, Invocation, Os, OutputSink};

use super::{is_populated, Buildpack, BuildpackCtx, BuildpackError};

#[derive(Debug)]
pub struct PythonBuildpack;

const REPO_HOST: &str = "https://repo.anaconda.com/miniconda";

/// Anaconda's platform naming: `Linux`/`MacOSX`, `x86_64`/`aarch64`
/// (with `arm64` only on macOS).
fn installer_name(version: &str, descriptor: Descriptor) -> Result<String, BuildpackError> {
  let os = match descriptor.os {
    Os::Linux => "Linux",
    Os::MacOs => "MacOSX",
    Os::Windows => {
      return Err(BuildpackError::UnsupportedPlatform {
        tool: "python".to_string(),
        platform: descriptor.to_string(),
      });
    }
  };
  let arch = match (descriptor.os, descriptor.arch) {
    (_, Arch::Amd64) => "x86_64",
    (Os::MacOs, Arch::Arm64) => "arm64",
    (_, Arch::Arm64) => "aarch64",
  };
  Ok(format!("Miniconda3-{version}-{os}-{arch}.sh"))
}

#[async_trait]
impl Buildpack for PythonBuildpack {
  async fn install(&self, ctx: &BuildpackCtx<'_>) -> Result<PathBuf, BuildpackError> {
    let install_dir = ctx.host_install_dir();
    if is_populated(&install_dir) {
      return Ok(install_dir);
    }

    let name = installer_name(&ctx.spec.version, ctx.biome.describe())?;
    let archive = ctx.cache.download(ctx.cancel, &format!("{REPO_HOST}/{name}")).await?;

    // Stage the installer inside the tools cache so the biome can see it.
    let staged_host = ctx.host_tools.join(&name);
    if let Some(parent) = staged_host.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&archive, &staged_host)?;

    let tools = ctx.biome.dirs().tools.clone();
    let staged = ctx.biome.join_path(&[&tools, &name]);
    let invocation = Invocation::new(vec![
      "sh".to_string(),
      staged,
      "-b".to_string(),
      "-p".to_string(),
      ctx.biome_install_dir(),
    ])
    .with_stdout(OutputSink::Discard);

    ctx.biome.run(ctx.cancel, invocation).await?;
    let _ = std::fs::remove_file(&staged_host);

    Ok(install_dir)
  }

  fn setup(&self, ctx: &BuildpackCtx<'_>) -> Result<EnvOverlay, BuildpackError> {
    let install = ctx.biome_install_dir();
    Ok(
      EnvOverlay::new()
        .with_var("CONDA_PREFIX", &install)
        .with_path_prepend(&ctx.biome.join_path(&[&install, "bin"])),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn installer_names_follow_anaconda_convention() {
    let linux = Descriptor {
      os: Os::Linux,
      arch: Arch::Amd64,
    };
    assert_eq!(
      installer_name("py311_23.11.0-2", linux).unwrap(),
      "Miniconda3-py311_23.11.0-2-Linux-x86_64.sh"
    );

    let mac_arm = Descriptor {
      os: Os::MacOs,
      arch: Arch::Arm64,
    };
    assert_eq!(
      installer_name("py311_23.11.0-2", mac_arm).unwrap(),
      "Miniconda3-py311_23.11.0-2-MacOSX-arm64.sh"
    );

    let linux_arm = Descriptor {
      os: Os::Linux,
      arch: Arch::Arm64,
    };
    assert_eq!(
      installer_name("latest", linux_arm).unwrap(),
      "Miniconda3-latest-Linux-aarch64.sh"
    );
  }

  #[test]
  fn windows_is_unsupported() {
    let windows = Descriptor {
      os: Os::Windows,
      arch: Arch::Amd64,
    };
    let err = installer_name("latest", windows).unwrap_err();
    assert!(matches!(err, BuildpackError::UnsupportedPlatform { .. }));
  }
}
