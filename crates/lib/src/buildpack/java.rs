//! Java toolchain from Adoptium Temurin releases.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::biome::{Arch, Descriptor, EnvOverlay, Os};

use super::{fetch_and_unpack, Buildpack, BuildpackCtx, BuildpackError};

#[derive(Debug)]
pub struct JavaBuildpack;

/// Temurin versions look like `17.0.9+9`. The release tag keeps the
/// `+` (percent-encoded in the URL) while the artifact name replaces it
/// with `_`.
fn download_url(version: &str, descriptor: Descriptor) -> Result<String, BuildpackError> {
  let major: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
  if major.is_empty() {
    return Err(BuildpackError::InvalidVersion {
      tool: "java".to_string(),
      version: version.to_string(),
    });
  }

  let os = match descriptor.os {
    Os::Linux => "linux",
    Os::MacOs => "mac",
    Os::Windows => "windows",
  };
  let arch = match descriptor.arch {
    Arch::Amd64 => "x64",
    Arch::Arm64 => "aarch64",
  };
  let extension = match descriptor.os {
    Os::Windows => "zip",
    _ => "tar.gz",
  };

  let tag = version.replace('+', "%2B");
  let file_version = version.replace('+', "_");
  Ok(format!(
    "https://github.com/adoptium/temurin{major}-binaries/releases/download/jdk-{tag}/OpenJDK{major}U-jdk_{arch}_{os}_hotspot_{file_version}.{extension}"
  ))
}

#[async_trait]
impl Buildpack for JavaBuildpack {
  async fn install(&self, ctx: &BuildpackCtx<'_>) -> Result<PathBuf, BuildpackError> {
    let url = download_url(&ctx.spec.version, ctx.biome.describe())?;
    // The archive wraps everything in a jdk-<version> directory.
    fetch_and_unpack(ctx, &url, 1).await
  }

  fn setup(&self, ctx: &BuildpackCtx<'_>) -> Result<EnvOverlay, BuildpackError> {
    let java_home = ctx.biome_install_dir();
    Ok(
      EnvOverlay::new()
        .with_var("JAVA_HOME", &java_home)
        .with_path_prepend(&ctx.biome.join_path(&[&java_home, "bin"])),
    )
  }
}
