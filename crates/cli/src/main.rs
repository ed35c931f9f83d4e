//! `yb` - build what the manifest says, the same way everywhere.

mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "yb")]
#[command(author, version, about = "Hermetic, reproducible build orchestrator", long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Package directory (defaults to the current directory)
  #[arg(long, global = true)]
  dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build one or more targets from the manifest
  Build {
    /// Targets to build (default: `default`)
    targets: Vec<String>,

    /// Leave service containers running for the next build
    #[arg(long)]
    reuse_containers: bool,

    /// Run on the host even when the target declares a container
    #[arg(long)]
    no_container: bool,

    /// Which `environment:` block to use
    #[arg(long, default_value = "default")]
    env: String,
  },

  /// Run an ad-hoc command inside a target's build environment
  Run {
    /// Target whose environment to use
    #[arg(long, default_value = "default")]
    target: String,

    /// Command and arguments
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
  },

  /// Run the manifest's exec phase
  Exec {
    #[arg(long)]
    reuse_containers: bool,
  },

  /// Remove cached build HOME directories for this package
  Clean {
    /// Targets to clean (default: everything for this package)
    targets: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .without_time()
    .init();

  let package_dir = match &cli.dir {
    Some(dir) => dir.clone(),
    None => match std::env::current_dir() {
      Ok(dir) => dir,
      Err(err) => {
        output::print_error(&format!("cannot determine working directory: {err}"));
        return ExitCode::from(2);
      }
    },
  };

  // Ctrl-C cancels the build; teardown still runs before exit.
  let cancel = CancellationToken::new();
  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        debug!("interrupt received, cancelling build");
        cancel.cancel();
      }
    });
  }

  let code = match cli.command {
    Commands::Build {
      targets,
      reuse_containers,
      no_container,
      env,
    } => cmd::cmd_build(&cancel, &package_dir, &targets, reuse_containers, no_container, &env).await,
    Commands::Run { target, command } => cmd::cmd_run(&cancel, &package_dir, &target, &command).await,
    Commands::Exec { reuse_containers } => cmd::cmd_exec(&cancel, &package_dir, reuse_containers).await,
    Commands::Clean { targets } => cmd::cmd_clean(&package_dir, &targets),
  };

  ExitCode::from(code)
}
