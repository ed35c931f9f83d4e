//! Host biome: runs processes natively with isolated caches.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::paths;

use super::{Biome, BiomeError, Descriptor, Dirs, Invocation, OutputSink};

/// A biome that spawns processes directly on the host.
///
/// HOME is a per-package, per-target cache under the data root; the
/// tools directory is shared across packages. Processes get a cleared
/// environment with a deterministic PATH and HOME, so builds cannot
/// leak host profile state.
pub struct HostBiome {
  descriptor: Descriptor,
  dirs: Dirs,
  default_path: String,
}

impl HostBiome {
  /// Provision the host biome for one target, creating its HOME and the
  /// shared tools directory.
  pub async fn provision(package_dir: &Path, target: &str) -> Result<Self, BiomeError> {
    let descriptor = Descriptor::current_host();
    let home = paths::build_home(package_dir, target, &descriptor.to_string());
    let tools = paths::tools_dir();

    tokio::fs::create_dir_all(&home).await?;
    tokio::fs::create_dir_all(&tools).await?;

    debug!(home = %home.display(), "provisioned host biome");
    Ok(Self::with_dirs(package_dir.to_path_buf(), home, tools))
  }

  /// Construct from explicit directories. Used by `provision` and by
  /// tests that point everything at a temp dir.
  pub fn with_dirs(package: PathBuf, home: PathBuf, tools: PathBuf) -> Self {
    let default_path =
      std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());

    Self {
      descriptor: Descriptor::current_host(),
      dirs: Dirs {
        package: package.to_string_lossy().to_string(),
        home: home.to_string_lossy().to_string(),
        tools: tools.to_string_lossy().to_string(),
      },
      default_path,
    }
  }
}

#[async_trait]
impl Biome for HostBiome {
  fn describe(&self) -> Descriptor {
    self.descriptor
  }

  fn dirs(&self) -> &Dirs {
    &self.dirs
  }

  fn default_path(&self) -> String {
    self.default_path.clone()
  }

  fn path_separator(&self) -> char {
    if cfg!(windows) { ';' } else { ':' }
  }

  fn join_path(&self, parts: &[&str]) -> String {
    let mut path = PathBuf::new();
    for part in parts {
      path.push(part);
    }
    path.to_string_lossy().to_string()
  }

  fn clean_path(&self, path: &str) -> String {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
      match component {
        Component::CurDir => {}
        Component::ParentDir => {
          if !out.pop() {
            out.push("..");
          }
        }
        other => out.push(other),
      }
    }
    out.to_string_lossy().to_string()
  }

  fn is_abs_path(&self, path: &str) -> bool {
    Path::new(path).is_absolute()
  }

  async fn run(&self, cancel: &CancellationToken, invocation: Invocation) -> Result<(), BiomeError> {
    if invocation.argv.is_empty() {
      return Err(BiomeError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "empty argv",
      )));
    }

    let effective_path = invocation
      .env
      .effective_path(&self.default_path, self.path_separator());
    let program = resolve_program(&invocation.argv[0], &effective_path, self.path_separator())?;
    let work_dir = self.resolve_work_dir(invocation.dir.as_deref());

    debug!(program = %program.display(), dir = %work_dir.display(), "spawning process");

    let inherit_stdout = matches!(invocation.stdout, OutputSink::Stdout);
    let inherit_stderr = matches!(invocation.stderr, OutputSink::Stderr);

    let mut command = Command::new(&program);
    command
      .args(&invocation.argv[1..])
      .current_dir(&work_dir)
      .env_clear()
      .env("PATH", &effective_path)
      .env("HOME", &self.dirs.home)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .stdin(if invocation.stdin.is_some() {
        Stdio::piped()
      } else {
        Stdio::null()
      })
      .stdout(if inherit_stdout { Stdio::inherit() } else { Stdio::piped() })
      .stderr(if inherit_stderr { Stdio::inherit() } else { Stdio::piped() })
      .kill_on_drop(true);

    for (key, value) in &invocation.env.vars {
      command.env(key, value);
    }

    let mut child = command.spawn()?;

    let mut stdin_pipe = child.stdin.take();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    enum Waited {
      Done(std::io::Result<(Vec<u8>, Vec<u8>, std::process::ExitStatus)>),
      Cancelled,
    }

    // Stdin is written while both output pipes drain, so a child that
    // fills stdout before reading stdin cannot deadlock on a full pipe.
    let waited = {
      let work = async {
        let write_in = async {
          if let (Some(bytes), Some(mut stdin)) = (&invocation.stdin, stdin_pipe.take()) {
            stdin.write_all(bytes).await?;
          }
          Ok::<_, std::io::Error>(())
        };
        let read_out = async {
          let mut buffer = Vec::new();
          if let Some(pipe) = stdout_pipe.as_mut() {
            pipe.read_to_end(&mut buffer).await?;
          }
          Ok::<_, std::io::Error>(buffer)
        };
        let read_err = async {
          let mut buffer = Vec::new();
          if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.read_to_end(&mut buffer).await?;
          }
          Ok::<_, std::io::Error>(buffer)
        };
        let ((), out, err, status) = tokio::try_join!(write_in, read_out, read_err, child.wait())?;
        Ok((out, err, status))
      };

      tokio::select! {
        result = work => Waited::Done(result),
        _ = cancel.cancelled() => Waited::Cancelled,
      }
    };

    match waited {
      Waited::Cancelled => {
        warn!(argv = ?invocation.argv, "run cancelled, killing process");
        let _ = child.start_kill();
        let _ = child.wait().await;
        Err(BiomeError::Cancelled)
      }
      Waited::Done(result) => {
        let (out, err, status) = result?;
        if !inherit_stdout {
          invocation.stdout.write(&out);
        }
        if !inherit_stderr {
          invocation.stderr.write(&err);
        }

        if status.success() {
          Ok(())
        } else {
          Err(BiomeError::CommandFailed {
            argv: invocation.argv,
            code: status.code(),
          })
        }
      }
    }
  }

  async fn close(&self) -> Result<(), BiomeError> {
    Ok(())
  }
}

impl HostBiome {
  fn resolve_work_dir(&self, dir: Option<&str>) -> PathBuf {
    match dir {
      Some(d) if Path::new(d).is_absolute() => PathBuf::from(d),
      Some(d) => Path::new(&self.dirs.package).join(d),
      None => PathBuf::from(&self.dirs.package),
    }
  }
}

/// Resolve a program name against an explicit PATH string.
///
/// Names containing a separator are used as-is; bare names are searched
/// left to right for an executable regular file.
fn resolve_program(name: &str, path: &str, separator: char) -> Result<PathBuf, BiomeError> {
  if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
    return Ok(PathBuf::from(name));
  }

  for dir in path.split(separator) {
    if dir.is_empty() {
      continue;
    }
    let candidate = Path::new(dir).join(name);
    if is_executable(&candidate) {
      return Ok(candidate);
    }
  }

  Err(BiomeError::ProgramNotFound(name.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  path
    .metadata()
    .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
  path.is_file()
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
  use super::*;
  use std::time::{Duration, Instant};
  use tempfile::TempDir;

  fn test_biome(temp: &TempDir) -> HostBiome {
    let package = temp.path().join("pkg");
    std::fs::create_dir_all(&package).unwrap();
    HostBiome::with_dirs(package, temp.path().join("home"), temp.path().join("tools"))
  }

  fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
  }

  #[tokio::test]
  async fn runs_and_captures_stdout() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    let (sink, buffer) = OutputSink::capture();
    let invocation = Invocation::new(argv(&["echo", "hello"])).with_stdout(sink);
    biome.run(&cancel, invocation).await.unwrap();

    assert_eq!(String::from_utf8(buffer.lock().unwrap().clone()).unwrap(), "hello\n");
  }

  #[tokio::test]
  async fn nonzero_exit_is_command_failed() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    let err = biome.run(&cancel, Invocation::new(argv(&["false"]))).await.unwrap_err();
    assert!(matches!(err, BiomeError::CommandFailed { code: Some(1), .. }));
  }

  #[tokio::test]
  async fn relative_dir_joins_package() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    std::fs::create_dir_all(Path::new(&biome.dirs().package).join("sub")).unwrap();

    let (sink, buffer) = OutputSink::capture();
    let invocation = Invocation::new(argv(&["pwd"])).with_dir("sub").with_stdout(sink);
    biome.run(&cancel, invocation).await.unwrap();

    let out = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    assert!(out.trim_end().ends_with("/sub"), "got {out}");
  }

  #[tokio::test]
  async fn overlay_vars_are_visible() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    let (sink, buffer) = OutputSink::capture();
    let invocation = Invocation::new(argv(&["sh", "-c", "echo $MY_VAR"]))
      .with_env(crate::biome::EnvOverlay::new().with_var("MY_VAR", "overlay-value"))
      .with_stdout(sink);
    biome.run(&cancel, invocation).await.unwrap();

    assert_eq!(
      String::from_utf8(buffer.lock().unwrap().clone()).unwrap().trim(),
      "overlay-value"
    );
  }

  #[tokio::test]
  async fn home_is_biome_home() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    let (sink, buffer) = OutputSink::capture();
    let invocation = Invocation::new(argv(&["sh", "-c", "echo $HOME"])).with_stdout(sink);
    biome.run(&cancel, invocation).await.unwrap();

    assert_eq!(
      String::from_utf8(buffer.lock().unwrap().clone()).unwrap().trim(),
      biome.dirs().home
    );
  }

  #[tokio::test]
  async fn unknown_program_is_not_found() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    let err = biome
      .run(&cancel, Invocation::new(argv(&["definitely-not-a-real-tool"])))
      .await
      .unwrap_err();
    assert!(matches!(err, BiomeError::ProgramNotFound(_)));
  }

  #[tokio::test]
  async fn stdin_bytes_reach_the_process() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    let (sink, buffer) = OutputSink::capture();
    let invocation = Invocation::new(argv(&["cat"]))
      .with_stdin(b"piped input".to_vec())
      .with_stdout(sink);
    biome.run(&cancel, invocation).await.unwrap();

    assert_eq!(&*buffer.lock().unwrap(), b"piped input");
  }

  #[tokio::test]
  async fn chatty_child_with_large_stdin_does_not_deadlock() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    // The child floods stdout past the pipe buffer before it reads any
    // stdin, then echoes stdin back.
    let payload = vec![b'x'; 1 << 20];
    let (sink, buffer) = OutputSink::capture();
    let invocation = Invocation::new(argv(&["sh", "-c", "head -c 1048576 /dev/zero; cat"]))
      .with_stdin(payload.clone())
      .with_stdout(sink);

    tokio::time::timeout(Duration::from_secs(30), biome.run(&cancel, invocation))
      .await
      .unwrap()
      .unwrap();

    assert_eq!(buffer.lock().unwrap().len(), (1 << 20) + payload.len());
  }

  #[tokio::test]
  async fn cancellation_kills_the_process() {
    let temp = TempDir::new().unwrap();
    let biome = test_biome(&temp);
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      token.cancel();
    });

    let start = Instant::now();
    let err = biome
      .run(&cancel, Invocation::new(argv(&["sleep", "30"])))
      .await
      .unwrap_err();

    assert!(matches!(err, BiomeError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(5));
  }

  #[test]
  fn prepended_path_wins_program_resolution() {
    let temp = TempDir::new().unwrap();
    let bin = temp.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let tool = bin.join("mytool");
    std::fs::write(&tool, "#!/bin/sh\n").unwrap();
    {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let path = format!("{}:/usr/bin", bin.display());
    let resolved = resolve_program("mytool", &path, ':').unwrap();
    assert_eq!(resolved, tool);
  }
}
