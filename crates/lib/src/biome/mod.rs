//! Execution environments.
//!
//! A [`Biome`] is the sole surface through which any build step runs a
//! subprocess. Three concrete variants exist - [`host::HostBiome`],
//! [`container::ContainerBiome`] and [`remote::RemoteBiome`] - and they
//! are indistinguishable to callers except through [`Biome::describe`].
//!
//! Environment mutations are expressed as [`EnvOverlay`] values and
//! composed with [`env::EnvBiome`], which wraps another biome and merges
//! an overlay into every run.

pub mod container;
pub mod env;
pub mod host;
pub mod remote;

pub use env::EnvBiome;
pub use host::HostBiome;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Operating system of a biome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
  Linux,
  MacOs,
  Windows,
}

impl Os {
  pub fn current() -> Self {
    if cfg!(target_os = "macos") {
      Os::MacOs
    } else if cfg!(target_os = "windows") {
      Os::Windows
    } else {
      Os::Linux
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Os::Linux => "linux",
      Os::MacOs => "darwin",
      Os::Windows => "windows",
    }
  }
}

/// CPU architecture of a biome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  Amd64,
  Arm64,
}

impl Arch {
  pub fn current() -> Self {
    if cfg!(target_arch = "aarch64") {
      Arch::Arm64
    } else {
      Arch::Amd64
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Arch::Amd64 => "amd64",
      Arch::Arm64 => "arm64",
    }
  }
}

/// Stable identity of a biome, used to partition caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
  pub os: Os,
  pub arch: Arch,
}

impl Descriptor {
  pub fn current_host() -> Self {
    Self {
      os: Os::current(),
      arch: Arch::current(),
    }
  }
}

impl std::fmt::Display for Descriptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}-{}", self.os.as_str(), self.arch.as_str())
  }
}

/// The three canonical directories of a biome, in its native path syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirs {
  /// Where the package source lives.
  pub package: String,
  /// Writable per-target HOME.
  pub home: String,
  /// Where buildpacks install their payloads.
  pub tools: String,
}

/// A set of environment mutations merged into a biome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
  pub vars: BTreeMap<String, String>,
  pub prepend_path: Vec<String>,
  pub append_path: Vec<String>,
}

impl EnvOverlay {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_var(mut self, key: &str, value: &str) -> Self {
    self.vars.insert(key.to_string(), value.to_string());
    self
  }

  pub fn with_path_prepend(mut self, dir: &str) -> Self {
    self.prepend_path.push(dir.to_string());
    self
  }

  pub fn with_path_append(mut self, dir: &str) -> Self {
    self.append_path.push(dir.to_string());
    self
  }

  pub fn is_empty(&self) -> bool {
    self.vars.is_empty() && self.prepend_path.is_empty() && self.append_path.is_empty()
  }

  /// Merge `later` over `self`. Later vars win; path lists concatenate
  /// in order, which makes the merge associative.
  pub fn merge(&self, later: &EnvOverlay) -> EnvOverlay {
    let mut merged = self.clone();
    for (key, value) in &later.vars {
      merged.vars.insert(key.clone(), value.clone());
    }
    merged.prepend_path.extend(later.prepend_path.iter().cloned());
    merged.append_path.extend(later.append_path.iter().cloned());
    merged
  }

  /// The effective PATH a spawned process sees:
  /// `prepend ++ default ++ append`, joined by `separator`.
  pub fn effective_path(&self, default_path: &str, separator: char) -> String {
    let mut parts: Vec<&str> = self.prepend_path.iter().map(String::as_str).collect();
    if !default_path.is_empty() {
      parts.push(default_path);
    }
    parts.extend(self.append_path.iter().map(String::as_str));
    parts.join(&separator.to_string())
  }
}

/// Where a command's output bytes go.
#[derive(Debug, Clone)]
pub enum OutputSink {
  /// Stream through to the orchestrator's stdout.
  Stdout,
  /// Stream through to the orchestrator's stderr.
  Stderr,
  /// Append into a shared buffer.
  Capture(Arc<Mutex<Vec<u8>>>),
  Discard,
}

impl OutputSink {
  /// A capture sink and the buffer it fills.
  pub fn capture() -> (Self, Arc<Mutex<Vec<u8>>>) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    (OutputSink::Capture(buffer.clone()), buffer)
  }

  pub(crate) fn write(&self, bytes: &[u8]) {
    match self {
      OutputSink::Stdout => {
        let mut out = std::io::stdout();
        let _ = out.write_all(bytes);
        let _ = out.flush();
      }
      OutputSink::Stderr => {
        let mut err = std::io::stderr();
        let _ = err.write_all(bytes);
        let _ = err.flush();
      }
      OutputSink::Capture(buffer) => {
        let mut buffer = buffer.lock().expect("capture buffer poisoned");
        buffer.extend_from_slice(bytes);
      }
      OutputSink::Discard => {}
    }
  }
}

/// One process to run inside a biome.
#[derive(Debug, Clone)]
pub struct Invocation {
  /// Argv; `argv[0]` is resolved against the effective PATH.
  pub argv: Vec<String>,
  /// Working directory. Relative paths are joined to the package dir.
  pub dir: Option<String>,
  pub env: EnvOverlay,
  pub stdin: Option<Vec<u8>>,
  pub stdout: OutputSink,
  pub stderr: OutputSink,
}

impl Invocation {
  pub fn new(argv: Vec<String>) -> Self {
    Self {
      argv,
      dir: None,
      env: EnvOverlay::new(),
      stdin: None,
      stdout: OutputSink::Stdout,
      stderr: OutputSink::Stderr,
    }
  }

  pub fn with_dir(mut self, dir: &str) -> Self {
    self.dir = Some(dir.to_string());
    self
  }

  pub fn with_env(mut self, env: EnvOverlay) -> Self {
    self.env = env;
    self
  }

  pub fn with_stdin(mut self, bytes: Vec<u8>) -> Self {
    self.stdin = Some(bytes);
    self
  }

  pub fn with_stdout(mut self, sink: OutputSink) -> Self {
    self.stdout = sink;
    self
  }

  pub fn with_stderr(mut self, sink: OutputSink) -> Self {
    self.stderr = sink;
    self
  }
}

/// Errors raised by biome operations.
#[derive(Debug, Error)]
pub enum BiomeError {
  /// A user command exited non-zero.
  #[error("command '{}' failed with {}", argv.join(" "), exit_label(*code))]
  CommandFailed { argv: Vec<String>, code: Option<i32> },

  #[error("program not found on PATH: {0}")]
  ProgramNotFound(String),

  #[error("docker error: {0}")]
  Docker(#[from] bollard::errors::Error),

  #[error("remote builder error: {0}")]
  Remote(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("run cancelled")]
  Cancelled,
}

/// A missing exit code means the process died to a signal.
fn exit_label(code: Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {code}"),
    None => "no exit code (terminated by signal)".to_string(),
  }
}

/// An execution environment for one target.
#[async_trait]
pub trait Biome: Send + Sync {
  /// Stable identity for cache partitioning.
  fn describe(&self) -> Descriptor;

  /// The three canonical directories.
  fn dirs(&self) -> &Dirs;

  /// The PATH a process sees when no overlay touches it.
  fn default_path(&self) -> String;

  /// PATH entry separator (`:` or `;`).
  fn path_separator(&self) -> char;

  /// Join path parts in the biome's native syntax.
  fn join_path(&self, parts: &[&str]) -> String;

  /// Normalize a path in the biome's native syntax.
  fn clean_path(&self, path: &str) -> String;

  fn is_abs_path(&self, path: &str) -> bool;

  /// Run one process to completion. Output is fully flushed to the
  /// invocation's sinks before this returns.
  async fn run(&self, cancel: &CancellationToken, invocation: Invocation) -> Result<(), BiomeError>;

  /// Release resources (stop containers, remove temp state).
  async fn close(&self) -> Result<(), BiomeError>;
}

/// Slash-syntax path helpers shared by the container and remote biomes.
pub(crate) mod slash {
  pub fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
      if part.is_empty() {
        continue;
      }
      if !out.is_empty() && !out.ends_with('/') {
        out.push('/');
      }
      out.push_str(part.trim_end_matches('/'));
    }
    out
  }

  pub fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();

    for part in path.split('/') {
      match part {
        "" | "." => {}
        ".." => {
          if stack.last().is_some_and(|p| *p != "..") {
            stack.pop();
          } else if !absolute {
            stack.push("..");
          }
        }
        _ => stack.push(part),
      }
    }

    let joined = stack.join("/");
    match (absolute, joined.is_empty()) {
      (true, true) => "/".to_string(),
      (true, false) => format!("/{joined}"),
      (false, true) => ".".to_string(),
      (false, false) => joined,
    }
  }

  pub fn is_abs(path: &str) -> bool {
    path.starts_with('/')
  }
}
