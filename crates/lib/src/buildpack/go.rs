//! Go toolchain.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::biome::{Descriptor, EnvOverlay, Os};

use super::{fetch_and_unpack, Buildpack, BuildpackCtx, BuildpackError};

#[derive(Debug)]
pub struct GoBuildpack;

/// Official download host, with the long-standing mirror as fallback
/// when a release has not propagated.
const PRIMARY_HOST: &str = "https://go.dev/dl";
const MIRROR_HOST: &str = "https://dl.google.com/go";

fn artifact(version: &str, descriptor: Descriptor) -> String {
  let extension = match descriptor.os {
    Os::Windows => "zip",
    _ => "tar.gz",
  };
  format!(
    "go{version}.{os}-{arch}.{extension}",
    os = descriptor.os.as_str(),
    arch = descriptor.arch.as_str(),
  )
}

#[async_trait]
impl Buildpack for GoBuildpack {
  async fn install(&self, ctx: &BuildpackCtx<'_>) -> Result<PathBuf, BuildpackError> {
    let artifact = artifact(&ctx.spec.version, ctx.biome.describe());
    let primary = format!("{PRIMARY_HOST}/{artifact}");

    match fetch_and_unpack(ctx, &primary, 1).await {
      Err(BuildpackError::Download(err)) if err.is_not_found() => {
        let mirror = format!("{MIRROR_HOST}/{artifact}");
        fetch_and_unpack(ctx, &mirror, 1).await
      }
      other => other,
    }
  }

  fn setup(&self, ctx: &BuildpackCtx<'_>) -> Result<EnvOverlay, BuildpackError> {
    let goroot = ctx.biome_install_dir();
    let home = ctx.biome.dirs().home.clone();
    let gopath = ctx.biome.join_path(&[&home, "go"]);

    Ok(
      EnvOverlay::new()
        .with_var("GOROOT", &goroot)
        .with_var("GOPATH", &gopath)
        .with_path_prepend(&ctx.biome.join_path(&[&goroot, "bin"]))
        .with_path_prepend(&ctx.biome.join_path(&[&gopath, "bin"])),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::biome::Arch;

  #[test]
  fn artifact_names_follow_upstream_convention() {
    let linux = Descriptor {
      os: Os::Linux,
      arch: Arch::Amd64,
    };
    assert_eq!(artifact("1.21.5", linux), "go1.21.5.linux-amd64.tar.gz");

    let mac = Descriptor {
      os: Os::MacOs,
      arch: Arch::Arm64,
    };
    assert_eq!(artifact("1.21.5", mac), "go1.21.5.darwin-arm64.tar.gz");

    let windows = Descriptor {
      os: Os::Windows,
      arch: Arch::Amd64,
    };
    assert_eq!(artifact("1.21.5", windows), "go1.21.5.windows-amd64.zip");
  }
}
