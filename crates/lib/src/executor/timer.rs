//! Per-command and per-target wallclock accounting.

use std::time::{Duration, Instant};

/// Measures one command; finished by [`CommandTimer::stop`].
pub struct CommandTimer {
  command: String,
  started: Instant,
}

impl CommandTimer {
  pub fn start(command: &str) -> Self {
    Self {
      command: command.to_string(),
      started: Instant::now(),
    }
  }

  pub fn stop(self) -> CommandTiming {
    CommandTiming {
      command: self.command,
      duration: self.started.elapsed(),
    }
  }
}

/// Wallclock spent in one command.
#[derive(Debug, Clone)]
pub struct CommandTiming {
  pub command: String,
  pub duration: Duration,
}

/// The outcome of one target, including a timing per executed command.
#[derive(Debug, Clone, Default)]
pub struct TargetReport {
  pub target: String,
  pub timings: Vec<CommandTiming>,
  pub duration: Duration,
}

impl TargetReport {
  pub fn new(target: &str) -> Self {
    Self {
      target: target.to_string(),
      ..Default::default()
    }
  }
}

/// All targets of one build invocation.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
  pub targets: Vec<TargetReport>,
}

impl BuildReport {
  pub fn total(&self) -> Duration {
    self.targets.iter().map(|t| t.duration).sum()
  }

  /// Flattened command timings across all targets.
  pub fn timings(&self) -> impl Iterator<Item = &CommandTiming> {
    self.targets.iter().flat_map(|t| t.timings.iter())
  }
}
