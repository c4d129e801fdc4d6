use clap::Parser;
use std::path::PathBuf;

/// Guardian Daemon
///
/// Enforces per-child screen-time quotas and login curfews on a single
/// device: tracks logind sessions, warns before the daily budget runs out,
/// grants a grace window, terminates sessions, and keeps PAM login-time
/// rules and systemd timers in sync with the configuration.
#[derive(Parser, Debug)]
#[command(name = "guardian-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file (overrides GUARDIAN_DAEMON_CONFIG)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
