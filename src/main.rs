//! `recall` admin binary: inspect and administer a file-backed memoization
//! cache from outside the host process.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use recall::cli::{self, Cli};
use recall::setup_tracing;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to set up tracing: {e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = cli::run(&cli) {
        error!(error = %e, "recall command failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
