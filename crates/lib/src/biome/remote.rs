//! Remote builder biome.
//!
//! The package directory is tarred and uploaded once when the biome is
//! provisioned. Each [`Biome::run`] then submits the command over HTTP
//! and drives four concurrent legs: stdin push, stdout pull, stderr
//! pull, and a status poll with exponential backoff. Cancelling the
//! build cancels all four.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{slash, Arch, Biome, BiomeError, Descriptor, Dirs, Invocation, Os, OutputSink};

const REMOTE_PACKAGE_DIR: &str = "/workspace";
const REMOTE_HOME_DIR: &str = "/root";
const REMOTE_TOOLS_DIR: &str = "/root/.cache/yb/tools";
const REMOTE_DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const POLL_INITIAL: Duration = Duration::from_millis(100);
const POLL_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct SubmitCommand {
  argv: Vec<String>,
  dir: String,
  env: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Created {
  id: String,
}

#[derive(Debug, Deserialize)]
struct CommandStatus {
  finished: bool,
  exit_code: Option<i32>,
}

/// A biome backed by a remote builder service.
pub struct RemoteBiome {
  client: reqwest::Client,
  base_url: String,
  build_id: String,
  dirs: Dirs,
}

impl RemoteBiome {
  /// Tar up `package_dir` and upload it, opening a build session.
  pub async fn provision(base_url: &str, package_dir: &Path) -> Result<Self, BiomeError> {
    let client = reqwest::Client::new();
    let base_url = base_url.trim_end_matches('/').to_string();

    let archive = package_archive(package_dir.to_path_buf()).await?;
    debug!(bytes = archive.len(), "uploading package archive");

    let created: Created = client
      .post(format!("{base_url}/builds"))
      .header("content-type", "application/gzip")
      .body(archive)
      .send()
      .await
      .map_err(remote_err)?
      .error_for_status()
      .map_err(remote_err)?
      .json()
      .await
      .map_err(remote_err)?;

    Ok(Self {
      client,
      base_url,
      build_id: created.id,
      dirs: Dirs {
        package: REMOTE_PACKAGE_DIR.to_string(),
        home: REMOTE_HOME_DIR.to_string(),
        tools: REMOTE_TOOLS_DIR.to_string(),
      },
    })
  }

  fn command_url(&self, command_id: &str, leaf: &str) -> String {
    format!("{}/builds/{}/commands/{command_id}/{leaf}", self.base_url, self.build_id)
  }

  async fn pump_output(&self, url: String, sink: &OutputSink) -> Result<(), BiomeError> {
    let mut response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(remote_err)?
      .error_for_status()
      .map_err(remote_err)?;

    while let Some(chunk) = response.chunk().await.map_err(remote_err)? {
      sink.write(&chunk);
    }
    Ok(())
  }

  async fn push_stdin(&self, url: String, bytes: Option<Vec<u8>>) -> Result<(), BiomeError> {
    let Some(bytes) = bytes else { return Ok(()) };
    self
      .client
      .post(url)
      .body(bytes)
      .send()
      .await
      .map_err(remote_err)?
      .error_for_status()
      .map_err(remote_err)?;
    Ok(())
  }

  async fn poll_status(&self, url: String) -> Result<CommandStatus, BiomeError> {
    let mut delay = POLL_INITIAL;
    loop {
      let status: CommandStatus = self
        .client
        .get(&url)
        .send()
        .await
        .map_err(remote_err)?
        .error_for_status()
        .map_err(remote_err)?
        .json()
        .await
        .map_err(remote_err)?;

      if status.finished {
        return Ok(status);
      }

      tokio::time::sleep(delay).await;
      delay = next_delay(delay);
    }
  }
}

#[async_trait]
impl Biome for RemoteBiome {
  fn describe(&self) -> Descriptor {
    Descriptor {
      os: Os::Linux,
      arch: Arch::Amd64,
    }
  }

  fn dirs(&self) -> &Dirs {
    &self.dirs
  }

  fn default_path(&self) -> String {
    REMOTE_DEFAULT_PATH.to_string()
  }

  fn path_separator(&self) -> char {
    ':'
  }

  fn join_path(&self, parts: &[&str]) -> String {
    slash::join(parts)
  }

  fn clean_path(&self, path: &str) -> String {
    slash::clean(path)
  }

  fn is_abs_path(&self, path: &str) -> bool {
    slash::is_abs(path)
  }

  async fn run(&self, cancel: &CancellationToken, invocation: Invocation) -> Result<(), BiomeError> {
    if invocation.argv.is_empty() {
      return Err(BiomeError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "empty argv",
      )));
    }

    let dir = match invocation.dir.as_deref() {
      Some(dir) if slash::is_abs(dir) => dir.to_string(),
      Some(dir) => slash::clean(&slash::join(&[REMOTE_PACKAGE_DIR, dir])),
      None => REMOTE_PACKAGE_DIR.to_string(),
    };

    // Same baseline as the host and container biomes, so a command sees
    // an identical environment no matter where it runs.
    let mut env = vec![
      format!("PATH={}", invocation.env.effective_path(REMOTE_DEFAULT_PATH, ':')),
      format!("HOME={REMOTE_HOME_DIR}"),
      "LANG=C".to_string(),
      "LC_ALL=C".to_string(),
    ];
    for (key, value) in &invocation.env.vars {
      env.push(format!("{key}={value}"));
    }

    let submit = SubmitCommand {
      argv: invocation.argv.clone(),
      dir,
      env,
    };

    let created: Created = self
      .client
      .post(format!("{}/builds/{}/commands", self.base_url, self.build_id))
      .json(&submit)
      .send()
      .await
      .map_err(remote_err)?
      .error_for_status()
      .map_err(remote_err)?
      .json()
      .await
      .map_err(remote_err)?;

    debug!(argv = ?invocation.argv, command = %created.id, "submitted remote command");

    let legs = async {
      tokio::try_join!(
        self.push_stdin(self.command_url(&created.id, "stdin"), invocation.stdin.clone()),
        self.pump_output(self.command_url(&created.id, "stdout"), &invocation.stdout),
        self.pump_output(self.command_url(&created.id, "stderr"), &invocation.stderr),
        self.poll_status(self.command_url(&created.id, "status")),
      )
    };

    let status = tokio::select! {
      result = legs => {
        let (_, _, _, status) = result?;
        status
      }
      _ = cancel.cancelled() => {
        warn!(command = %created.id, "remote command cancelled");
        return Err(BiomeError::Cancelled);
      }
    };

    match status.exit_code {
      Some(0) | None => Ok(()),
      code => Err(BiomeError::CommandFailed {
        argv: invocation.argv,
        code,
      }),
    }
  }

  async fn close(&self) -> Result<(), BiomeError> {
    self
      .client
      .delete(format!("{}/builds/{}", self.base_url, self.build_id))
      .send()
      .await
      .map_err(remote_err)?;
    Ok(())
  }
}

fn remote_err(err: reqwest::Error) -> BiomeError {
  BiomeError::Remote(err.to_string())
}

/// Backoff schedule for status polling: doubles from 100ms, capped at 5s.
fn next_delay(current: Duration) -> Duration {
  (current * 2).min(POLL_CAP)
}

/// Build a gzipped tar of the package directory.
async fn package_archive(package_dir: PathBuf) -> Result<Vec<u8>, BiomeError> {
  tokio::task::spawn_blocking(move || {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", &package_dir)?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
  })
  .await
  .map_err(|e| BiomeError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
  use super::*;
  use flate2::read::GzDecoder;

  #[test]
  fn backoff_doubles_and_caps() {
    let mut delay = POLL_INITIAL;
    let mut schedule = Vec::new();
    for _ in 0..8 {
      schedule.push(delay.as_millis());
      delay = next_delay(delay);
    }
    assert_eq!(schedule, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
  }

  #[tokio::test]
  async fn package_archive_contains_source_files() {
    let temp = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("src")).unwrap();
    std::fs::write(temp.path().join("src/main.go"), "package main").unwrap();

    let archive = package_archive(temp.path().to_path_buf()).await.unwrap();

    let mut names = Vec::new();
    let mut reader = tar::Archive::new(GzDecoder::new(archive.as_slice()));
    for entry in reader.entries().unwrap() {
      names.push(entry.unwrap().path().unwrap().to_string_lossy().into_owned());
    }
    assert!(names.iter().any(|n| n.ends_with("src/main.go")));
  }

  #[tokio::test]
  async fn run_submits_and_reports_exit_code() {
    let mut server = mockito::Server::new_async().await;

    let submit = server
      .mock("POST", "/builds/b1/commands")
      .match_body(mockito::Matcher::Regex(
        r#""HOME=/root","LANG=C","LC_ALL=C""#.to_string(),
      ))
      .with_header("content-type", "application/json")
      .with_body(r#"{"id":"c1"}"#)
      .create_async()
      .await;
    let stdout = server
      .mock("GET", "/builds/b1/commands/c1/stdout")
      .with_body("hello\n")
      .create_async()
      .await;
    let stderr = server
      .mock("GET", "/builds/b1/commands/c1/stderr")
      .with_body("")
      .create_async()
      .await;
    let status = server
      .mock("GET", "/builds/b1/commands/c1/status")
      .with_header("content-type", "application/json")
      .with_body(r#"{"finished":true,"exit_code":0}"#)
      .create_async()
      .await;

    let biome = RemoteBiome {
      client: reqwest::Client::new(),
      base_url: server.url(),
      build_id: "b1".to_string(),
      dirs: Dirs {
        package: REMOTE_PACKAGE_DIR.to_string(),
        home: REMOTE_HOME_DIR.to_string(),
        tools: REMOTE_TOOLS_DIR.to_string(),
      },
    };

    let cancel = CancellationToken::new();
    let (sink, buffer) = OutputSink::capture();
    let invocation = Invocation::new(vec!["echo".into(), "hello".into()]).with_stdout(sink);
    biome.run(&cancel, invocation).await.unwrap();

    assert_eq!(&*buffer.lock().unwrap(), b"hello\n");
    submit.assert_async().await;
    stdout.assert_async().await;
    stderr.assert_async().await;
    status.assert_async().await;
  }

  #[tokio::test]
  async fn nonzero_exit_is_a_command_failure() {
    let mut server = mockito::Server::new_async().await;

    server
      .mock("POST", "/builds/b1/commands")
      .with_body(r#"{"id":"c1"}"#)
      .create_async()
      .await;
    server
      .mock("GET", "/builds/b1/commands/c1/stdout")
      .with_body("")
      .create_async()
      .await;
    server
      .mock("GET", "/builds/b1/commands/c1/stderr")
      .with_body("boom\n")
      .create_async()
      .await;
    server
      .mock("GET", "/builds/b1/commands/c1/status")
      .with_body(r#"{"finished":true,"exit_code":3}"#)
      .create_async()
      .await;

    let biome = RemoteBiome {
      client: reqwest::Client::new(),
      base_url: server.url(),
      build_id: "b1".to_string(),
      dirs: Dirs {
        package: REMOTE_PACKAGE_DIR.to_string(),
        home: REMOTE_HOME_DIR.to_string(),
        tools: REMOTE_TOOLS_DIR.to_string(),
      },
    };

    let cancel = CancellationToken::new();
    let invocation = Invocation::new(vec!["false".into()])
      .with_stdout(OutputSink::Discard)
      .with_stderr(OutputSink::Discard);
    let err = biome.run(&cancel, invocation).await.unwrap_err();
    assert!(matches!(err, BiomeError::CommandFailed { code: Some(3), .. }));
  }
}
