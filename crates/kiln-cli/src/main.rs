//! kiln - build software from source against a concrete dependency graph

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_cli::{Cli, ops};

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match kiln_cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ops::error::report(&err),
    }
}
