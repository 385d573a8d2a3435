//! rbuild: build container images on a remote build service.

mod cmd;
mod output;
mod prompts;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{BuildArgs, VersionArgs};
use crate::output::{Status, status};

/// rbuild - remote container image builds
#[derive(Parser)]
#[command(name = "rbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build an image on the remote build service
  #[command(after_help = cmd::BUILD_EXAMPLES)]
  Build(BuildArgs),

  /// Print version information
  Version(VersionArgs),
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  let result = match cli.command {
    Commands::Build(args) => cmd::cmd_build(args),
    Commands::Version(args) => cmd::cmd_version(&args),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      status(Status::Fail, format!("{:#}", err));
      ExitCode::FAILURE
    }
  }
}

fn init_logging(verbose: bool) {
  let filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) if verbose => EnvFilter::new("warn,rbuild_lib=debug,rbuild=debug"),
    Err(_) => EnvFilter::new("warn"),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}
