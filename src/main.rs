use anyhow::Result;
use clap::Parser;

mod cli;
mod clock;
mod config;
mod daemon;
mod enforcer;
mod fs;
mod ipc;
mod policy;
mod sessions;
mod storage;
mod writers;

use cli::Args;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(daemon::run(args))
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
