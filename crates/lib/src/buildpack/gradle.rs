//! Gradle build tool.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::biome::EnvOverlay;

use super::{fetch_and_unpack, Buildpack, BuildpackCtx, BuildpackError};

#[derive(Debug)]
pub struct GradleBuildpack;

/// Gradle distributions are platform-independent zips.
fn download_url(version: &str) -> String {
  format!("https://services.gradle.org/distributions/gradle-{version}-bin.zip")
}

#[async_trait]
impl Buildpack for GradleBuildpack {
  async fn install(&self, ctx: &BuildpackCtx<'_>) -> Result<PathBuf, BuildpackError> {
    // The zip wraps everything in gradle-<version>/.
    fetch_and_unpack(ctx, &download_url(&ctx.spec.version), 1).await
  }

  fn setup(&self, ctx: &BuildpackCtx<'_>) -> Result<EnvOverlay, BuildpackError> {
    let gradle_home = ctx.biome_install_dir();
    Ok(
      EnvOverlay::new()
        .with_var("GRADLE_HOME", &gradle_home)
        .with_path_prepend(&ctx.biome.join_path(&[&gradle_home, "bin"])),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn distribution_url() {
    assert_eq!(
      download_url("8.5"),
      "https://services.gradle.org/distributions/gradle-8.5-bin.zip"
    );
  }
}
