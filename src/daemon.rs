use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cli::Args;
use crate::clock::{Clock, SystemClock};
use crate::config::ConfigLoader;
use crate::enforcer::terminate::{lookup_uid, run_terminator, LogindKiller};
use crate::enforcer::{AgentNotifier, Enforcer, DEFAULT_ENFORCE_INTERVAL};
use crate::ipc::{self, IpcContext};
use crate::policy::PolicySnapshot;
use crate::sessions::tracker::DEFAULT_TICK_INTERVAL;
use crate::sessions::{LoginSource, SessionTracker, TrackerNotice};
use crate::storage::Storage;
use crate::writers::{PamWriter, Systemctl, SystemdControl, SystemdWriter};

const STORAGE_OPEN_ATTEMPTS: u32 = 3;
const STORAGE_OPEN_BACKOFF: Duration = Duration::from_secs(1);
const COMPONENT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire all components and run until a termination signal arrives.
pub async fn run(args: Args) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        warn!("not running as root, PAM and systemd writes will likely fail");
    }

    let config_path = ConfigLoader::resolve_path(args.config);
    let loader = Arc::new(
        ConfigLoader::load(config_path.clone())
            .with_context(|| format!("cannot start without {}", config_path.display()))?,
    );
    let policy = loader.current();

    // The one startup failure worth dying for: no durable store means no
    // usage accounting at all.
    let storage = Arc::new(open_storage(&policy.db_path).await?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let tracker = Arc::new(SessionTracker::new(
        clock.clone(),
        storage.clone(),
        loader.clone(),
    ));

    let (terminate_tx, terminate_rx) = mpsc::channel(32);
    let enforcer = Arc::new(Enforcer::new(
        clock.clone(),
        tracker.clone(),
        loader.clone(),
        AgentNotifier::new(),
        terminate_tx,
    ));

    let pam = PamWriter::new(policy.pam_time_conf.clone());
    let systemd = Arc::new(SystemdWriter::new(
        policy.systemd_unit_dir.clone(),
        Systemctl,
    ));

    apply_policy_artifacts(&pam, &systemd, &storage, policy.as_ref()).await;
    warn_unknown_host_users(policy.as_ref());

    // Catch up on a reset that fired while the daemon was down.
    let window = tracker.day_window().await;
    match storage.last_reset_wall().await {
        Ok(last) if needs_reset_catchup(last, window.0.timestamp()) => {
            info!("daily reset happened while down, rolling over now");
            enforcer.day_rolled_over().await;
            if let Err(e) = storage.set_last_reset_wall(window.0.timestamp()).await {
                warn!(component = "supervisor", error = %e, "failed to record reset");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(component = "supervisor", error = %e, "could not read last reset"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, mut events_rx) = mpsc::channel(256);

    let (policy_tx, mut policy_rx) = mpsc::unbounded_channel();
    loader.subscribe(move |snapshot| {
        let _ = policy_tx.send(snapshot);
    });

    // The supervisor keeps one sender alive so the event channel can never
    // close underneath the select loop.
    let login_source = LoginSource::new(loader.clone(), events_tx.clone(), shutdown_rx.clone());
    let login_task = tokio::spawn(login_source.run());

    let terminator_task = tokio::spawn(run_terminator(
        LogindKiller,
        terminate_rx,
        shutdown_rx.clone(),
    ));

    // IPC failure degrades to a daemon without an admin surface.
    let socket_path = policy.ipc_socket.clone();
    let ipc_task = match ipc::bind_socket(&socket_path, &policy.ipc_admin_group) {
        Ok((listener, admin_gid)) => {
            let ctx = Arc::new(IpcContext {
                started_at: Instant::now(),
                loader: loader.clone(),
                storage: storage.clone(),
                tracker: tracker.clone(),
                enforcer: enforcer.clone(),
                systemd: systemd.clone(),
            });
            Some(tokio::spawn(ipc::serve(
                ctx,
                listener,
                admin_gid,
                shutdown_rx.clone(),
            )))
        }
        Err(e) => {
            error!(component = "ipc", error = %format!("{e:#}"), "admin socket unavailable");
            None
        }
    };

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    let mut tick = tokio::time::interval(DEFAULT_TICK_INTERVAL);
    let mut enforce = tokio::time::interval(DEFAULT_ENFORCE_INTERVAL);
    let mut reload = tokio::time::interval(policy.reload_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    enforce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    reload.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Intervals fire immediately once; burn those to establish the cadence.
    tick.tick().await;
    enforce.tick().await;
    reload.tick().await;

    info!(version = env!("CARGO_PKG_VERSION"), "guardian-daemon running");

    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => {
                let notices = tracker.handle_event(event).await;
                handle_notices(&notices, &tracker, &enforcer, &storage).await;
                enforcer.evaluate_all().await;
            }
            _ = tick.tick() => {
                let notices = tracker.tick().await;
                handle_notices(&notices, &tracker, &enforcer, &storage).await;
            }
            _ = enforce.tick() => {
                enforcer.evaluate_all().await;
            }
            _ = reload.tick() => {
                if let Err(e) = loader.reload() {
                    warn!(component = "config", error = %e, "periodic reload failed, keeping previous policy");
                }
            }
            Some(snapshot) = policy_rx.recv() => {
                info!("configuration changed, reconciling");
                tracker.prune_unmanaged().await;
                apply_policy_artifacts(&pam, &systemd, &storage, snapshot.as_ref()).await;
                warn_unknown_host_users(snapshot.as_ref());
                enforcer.evaluate_all().await;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
        }
    }

    // Ordered shutdown: stop the event source, drain pending terminations,
    // flush usage to storage, then take down the admin socket.
    let _ = shutdown_tx.send(true);
    drop(events_tx);
    stop_component(login_task, "login-source").await;
    stop_component(terminator_task, "terminator").await;
    tracker.shutdown_flush().await;
    if let Some(task) = ipc_task {
        stop_component(task, "ipc").await;
    }
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!(component = "ipc", error = %e, "failed to remove socket file");
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn open_storage(path: &Path) -> Result<Storage> {
    let mut last_error = None;
    for attempt in 1..=STORAGE_OPEN_ATTEMPTS {
        match Storage::open_or_create(path) {
            Ok(storage) => return Ok(storage),
            Err(e) => {
                warn!(attempt, error = %e, "storage open failed");
                last_error = Some(e);
                if attempt < STORAGE_OPEN_ATTEMPTS {
                    tokio::time::sleep(STORAGE_OPEN_BACKOFF).await;
                }
            }
        }
    }
    Err(last_error.unwrap())
        .with_context(|| format!("failed to open storage at {}", path.display()))
}

/// A reset is due when no reset was ever recorded or the recorded one
/// predates the current window.
fn needs_reset_catchup(last_reset_wall: Option<i64>, window_start_wall: i64) -> bool {
    match last_reset_wall {
        Some(ts) => ts < window_start_wall,
        None => true,
    }
}

async fn handle_notices<N: crate::enforcer::Notifier>(
    notices: &[TrackerNotice],
    tracker: &SessionTracker,
    enforcer: &Enforcer<N>,
    storage: &Storage,
) {
    for notice in notices {
        match notice {
            TrackerNotice::DayRolledOver => {
                enforcer.day_rolled_over().await;
                let window_start = tracker.day_window().await.0.timestamp();
                if let Err(e) = storage.set_last_reset_wall(window_start).await {
                    warn!(component = "supervisor", error = %e, "failed to record reset");
                }
            }
        }
    }
}

/// Rewrite PAM rules, reconcile units, and mirror the accepted config.
/// Failures degrade to the last known good artifact state.
async fn apply_policy_artifacts<C: SystemdControl>(
    pam: &PamWriter,
    systemd: &SystemdWriter<C>,
    storage: &Storage,
    policy: &PolicySnapshot,
) {
    if let Err(e) = pam.apply(policy) {
        error!(component = "pam", error = %format!("{e:#}"), "keeping previous login rules");
    }
    if let Err(e) = systemd.reconcile(policy).await {
        error!(component = "systemd", error = %format!("{e:#}"), "keeping previous units");
    }
    if let Err(e) = storage.sync_config(policy).await {
        warn!(component = "storage", error = %e, "config mirror update failed");
    }
}

/// Configured users must exist on the host; the rest are logged and left
/// untouched by every generator.
fn warn_unknown_host_users(policy: &PolicySnapshot) {
    for username in policy.managed_users() {
        if lookup_uid(username).is_none() {
            warn!(
                component = "supervisor",
                username = %username,
                "configured user does not exist on this host, ignoring"
            );
        }
    }
}

async fn stop_component(task: JoinHandle<()>, name: &str) {
    match tokio::time::timeout(COMPONENT_STOP_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(component = name, error = %e, "stopped with a panic"),
        Err(_) => warn!(component = name, "did not stop in time, abandoning"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_catchup_logic() {
        assert!(needs_reset_catchup(None, 1000));
        assert!(needs_reset_catchup(Some(999), 1000));
        assert!(!needs_reset_catchup(Some(1000), 1000));
        assert!(!needs_reset_catchup(Some(1500), 1000));
    }
}
