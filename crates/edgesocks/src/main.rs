mod agent;
mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let result = dispatch(cli).await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    match cli.command {
        Command::Run(args) => commands::run::run(args, cwd).await,
        Command::Check(source) => commands::check::check(source, cwd).await,
        Command::Config(args) => commands::config::config(args, cwd).await,
    }
}

/// Env var holding a full `EnvFilter` directive; overrides `-v`.
const LOG_ENV: &str = "EDGESOCKS_LOG";

/// Filter for a `-v` count: the agent's own crates get one level more
/// detail than dependencies.
fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "warn,edgesocks=info,edgesocks_proxy=info",
        2 => "info,edgesocks=debug,edgesocks_proxy=debug",
        _ => "debug,edgesocks=trace,edgesocks_proxy=trace",
    }
}

fn setup_tracing(verbose: u8) {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .init();
}
