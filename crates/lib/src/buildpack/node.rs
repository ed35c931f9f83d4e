//! Node.js toolchain.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::biome::{Arch, Descriptor, EnvOverlay, Os};

use super::{fetch_and_unpack, Buildpack, BuildpackCtx, BuildpackError};

#[derive(Debug)]
pub struct NodeBuildpack;

const DIST_HOST: &str = "https://nodejs.org/dist";

/// Node uses `x64` where most vendors say `amd64`, and ships zips only
/// for Windows.
fn download_url(version: &str, descriptor: Descriptor) -> Result<String, BuildpackError> {
  let arch = match descriptor.arch {
    Arch::Amd64 => "x64",
    Arch::Arm64 => "arm64",
  };
  let (os, extension) = match descriptor.os {
    Os::Linux => ("linux", "tar.gz"),
    Os::MacOs => ("darwin", "tar.gz"),
    Os::Windows => ("win", "zip"),
  };
  Ok(format!(
    "{DIST_HOST}/v{version}/node-v{version}-{os}-{arch}.{extension}"
  ))
}

#[async_trait]
impl Buildpack for NodeBuildpack {
  async fn install(&self, ctx: &BuildpackCtx<'_>) -> Result<PathBuf, BuildpackError> {
    let url = download_url(&ctx.spec.version, ctx.biome.describe())?;
    fetch_and_unpack(ctx, &url, 1).await
  }

  fn setup(&self, ctx: &BuildpackCtx<'_>) -> Result<EnvOverlay, BuildpackError> {
    let install = ctx.biome_install_dir();
    Ok(
      EnvOverlay::new()
        .with_var("NODE_HOME", &install)
        .with_path_prepend(&ctx.biome.join_path(&[&install, "bin"])),
    )
  }
}
