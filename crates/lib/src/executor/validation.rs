//! Command validation.
//!
//! Commands are lexed POSIX-style, never handed to a shell. The single
//! recognized builtin is `cd`, which mutates the executor's working
//! directory instead of spawning anything. All commands are validated
//! before the first one runs, so a typo at the end of a long sequence
//! fails fast.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("cannot lex command: {0}")]
  Unparseable(String),

  #[error("empty command")]
  Empty,

  #[error("cd requires a relative, non-empty path: {0}")]
  InvalidChdir(String),
}

/// One validated step of a target's command sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStep {
  /// Update the working directory, relative to the current one.
  Chdir(String),
  /// Spawn this argv through the biome.
  Exec(Vec<String>),
}

/// Validate every command before any of them executes.
pub fn validate_commands(commands: &[String]) -> Result<Vec<CommandStep>, ValidationError> {
  commands.iter().map(|c| validate_command(c)).collect()
}

fn validate_command(command: &str) -> Result<CommandStep, ValidationError> {
  let argv = shlex::split(command).ok_or_else(|| ValidationError::Unparseable(command.to_string()))?;

  let Some(program) = argv.first() else {
    return Err(ValidationError::Empty);
  };

  if program == "cd" {
    let path = match argv.as_slice() {
      [_, path] => path,
      _ => return Err(ValidationError::InvalidChdir(command.to_string())),
    };
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
      return Err(ValidationError::InvalidChdir(command.to_string()));
    }
    return Ok(CommandStep::Chdir(path.clone()));
  }

  Ok(CommandStep::Exec(argv))
}
