//! End-to-end tests of the `yb` binary against real manifests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn yb_in(package: &TempDir, cache: &TempDir) -> Command {
  let mut cmd = Command::cargo_bin("yb").unwrap();
  cmd.current_dir(package.path());
  cmd.env("YB_CACHE_DIR", cache.path());
  cmd.env("NO_COLOR", "1");
  cmd
}

fn write_manifest(package: &TempDir, contents: &str) {
  std::fs::write(package.path().join(".yourbase.yml"), contents).unwrap();
}

#[test]
#[cfg(unix)]
fn build_passes_and_prints_timings() {
  let package = TempDir::new().unwrap();
  let cache = TempDir::new().unwrap();
  write_manifest(
    &package,
    "build:\n  commands:\n    - \"echo hello from yb\"\n",
  );

  yb_in(&package, &cache)
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("hello from yb"))
    .stdout(predicate::str::contains("BUILD PASSED"))
    .stdout(predicate::str::contains("TOTAL"));
}

#[test]
#[cfg(unix)]
fn failing_command_exits_one() {
  let package = TempDir::new().unwrap();
  let cache = TempDir::new().unwrap();
  write_manifest(&package, "build:\n  commands:\n    - \"false\"\n");

  yb_in(&package, &cache)
    .arg("build")
    .assert()
    .code(1)
    .stdout(predicate::str::contains("BUILD FAILED"));
}

#[test]
fn missing_manifest_exits_two() {
  let package = TempDir::new().unwrap();
  let cache = TempDir::new().unwrap();

  yb_in(&package, &cache)
    .arg("build")
    .assert()
    .code(2)
    .stderr(predicate::str::contains("error:"));
}

#[test]
#[cfg(unix)]
fn targets_build_in_dependency_order() {
  let package = TempDir::new().unwrap();
  let cache = TempDir::new().unwrap();
  write_manifest(
    &package,
    r#"
build_targets:
  - name: first
    commands:
      - "echo built-first"
  - name: second
    build_after: [first]
    commands:
      - "echo built-second"
"#,
  );

  let assert = yb_in(&package, &cache).args(["build", "second"]).assert().success();
  let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
  let first = stdout.find("built-first").unwrap();
  let second = stdout.find("built-second").unwrap();
  assert!(first < second);
}

#[test]
#[cfg(unix)]
fn run_executes_an_adhoc_command() {
  let package = TempDir::new().unwrap();
  let cache = TempDir::new().unwrap();
  write_manifest(&package, "build:\n  commands:\n    - \"true\"\n");

  yb_in(&package, &cache)
    .args(["run", "--", "echo", "adhoc works"])
    .assert()
    .success()
    .stdout(predicate::str::contains("adhoc works"));
}

#[test]
fn clean_without_cache_succeeds() {
  let package = TempDir::new().unwrap();
  let cache = TempDir::new().unwrap();
  write_manifest(&package, "build:\n  commands:\n    - \"true\"\n");

  yb_in(&package, &cache).arg("clean").assert().success();
}

#[test]
fn unknown_target_is_an_error() {
  let package = TempDir::new().unwrap();
  let cache = TempDir::new().unwrap();
  write_manifest(&package, "build:\n  commands:\n    - \"true\"\n");

  yb_in(&package, &cache)
    .args(["build", "ghost"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("no such build target"));
}
