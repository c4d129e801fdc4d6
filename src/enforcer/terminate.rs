use anyhow::{bail, Context, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::sessions::login_source::LogindManagerProxy;

/// Hard cap on any single external termination mechanism.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_ATTEMPTS: u32 = 3;
const KILL_RETRY_SPACING: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateCommand {
    pub username: String,
    pub uid: Option<u32>,
}

/// The mechanism that actually ends a user's login sessions.
pub trait SessionKiller: Send + Sync {
    fn kill(&self, username: &str, uid: Option<u32>)
        -> impl Future<Output = Result<()>> + Send;
}

/// Ends sessions via logind's `TerminateUser`, falling back to an external
/// `loginctl terminate-user` invocation.
pub struct LogindKiller;

impl LogindKiller {
    async fn terminate_via_bus(&self, uid: u32) -> Result<()> {
        let conn = zbus::Connection::system()
            .await
            .context("failed to connect to system bus")?;
        let manager = LogindManagerProxy::new(&conn)
            .await
            .context("failed to create logind proxy")?;
        manager
            .terminate_user(uid)
            .await
            .context("TerminateUser call failed")?;
        Ok(())
    }

    async fn terminate_via_loginctl(&self, username: &str) -> Result<()> {
        let output = tokio::process::Command::new("loginctl")
            .arg("terminate-user")
            .arg(username)
            .output()
            .await
            .context("failed to spawn loginctl")?;
        if !output.status.success() {
            bail!(
                "loginctl terminate-user {username} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Resolve a username to its uid through the passwd database.
pub fn lookup_uid(username: &str) -> Option<u32> {
    let c_name = std::ffi::CString::new(username).ok()?;
    // getpwnam is not reentrant but the daemon only calls it from the
    // single termination worker.
    let entry = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if entry.is_null() {
        None
    } else {
        Some(unsafe { (*entry).pw_uid })
    }
}

impl SessionKiller for LogindKiller {
    async fn kill(&self, username: &str, uid: Option<u32>) -> Result<()> {
        let uid = uid.or_else(|| lookup_uid(username));

        if let Some(uid) = uid {
            match tokio::time::timeout(KILL_TIMEOUT, self.terminate_via_bus(uid)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    warn!(username = %username, error = %format!("{e:#}"), "TerminateUser failed, falling back to loginctl");
                }
                Err(_) => {
                    warn!(username = %username, "TerminateUser timed out, falling back to loginctl");
                }
            }
        }

        match tokio::time::timeout(KILL_TIMEOUT, self.terminate_via_loginctl(username)).await {
            Ok(result) => result,
            Err(_) => bail!("loginctl terminate-user {username} timed out"),
        }
    }
}

/// Termination worker: consumes commands off the queue so a stuck kill
/// never blocks enforcement. Each command gets a bounded number of
/// attempts; persistent failure is logged and the user stays in
/// Terminating until the day rolls over.
pub async fn run_terminator<K: SessionKiller>(
    killer: K,
    mut commands: mpsc::Receiver<TerminateCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => execute(&killer, &command, KILL_ATTEMPTS).await,
                    None => return,
                }
            }
            _ = shutdown.changed() => {
                // Drain what is already queued with a single attempt each,
                // then stop.
                while let Ok(command) = commands.try_recv() {
                    execute(&killer, &command, 1).await;
                }
                return;
            }
        }
    }
}

async fn execute<K: SessionKiller>(killer: &K, command: &TerminateCommand, attempts: u32) {
    for attempt in 1..=attempts {
        match killer.kill(&command.username, command.uid).await {
            Ok(()) => {
                info!(
                    component = "terminator",
                    username = %command.username,
                    "sessions terminated"
                );
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    component = "terminator",
                    username = %command.username,
                    attempt,
                    error = %format!("{e:#}"),
                    "termination attempt failed, retrying"
                );
                tokio::time::sleep(KILL_RETRY_SPACING).await;
            }
            Err(e) => {
                error!(
                    component = "terminator",
                    username = %command.username,
                    error = %format!("{e:#}"),
                    "termination failed after retries, user remains unterminated"
                );
            }
        }
    }
}
