//! Overlay composition over another biome.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Biome, BiomeError, Descriptor, Dirs, EnvOverlay, Invocation};

/// Wraps another biome and merges an overlay into every run.
///
/// Nesting composes: `EnvBiome(EnvBiome(b, o1), o2).run(inv)` behaves
/// exactly like `b.run(inv with env = o1.merge(o2).merge(inv.env))`.
pub struct EnvBiome {
  inner: Arc<dyn Biome>,
  overlay: EnvOverlay,
}

impl EnvBiome {
  pub fn new(inner: Arc<dyn Biome>, overlay: EnvOverlay) -> Self {
    Self { inner, overlay }
  }
}

#[async_trait]
impl Biome for EnvBiome {
  fn describe(&self) -> Descriptor {
    self.inner.describe()
  }

  fn dirs(&self) -> &Dirs {
    self.inner.dirs()
  }

  fn default_path(&self) -> String {
    self.inner.default_path()
  }

  fn path_separator(&self) -> char {
    self.inner.path_separator()
  }

  fn join_path(&self, parts: &[&str]) -> String {
    self.inner.join_path(parts)
  }

  fn clean_path(&self, path: &str) -> String {
    self.inner.clean_path(path)
  }

  fn is_abs_path(&self, path: &str) -> bool {
    self.inner.is_abs_path(path)
  }

  async fn run(&self, cancel: &CancellationToken, invocation: Invocation) -> Result<(), BiomeError> {
    let env = self.overlay.merge(&invocation.env);
    self.inner.run(cancel, invocation.with_env(env)).await
  }

  async fn close(&self) -> Result<(), BiomeError> {
    self.inner.close().await
  }
}
