use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub mod notify;
pub mod terminate;

pub use notify::AgentNotifier;
pub use terminate::{LogindKiller, SessionKiller, TerminateCommand};

use crate::clock::Clock;
use crate::config::ConfigLoader;
use crate::sessions::SessionTracker;

pub const DEFAULT_ENFORCE_INTERVAL: Duration = Duration::from_secs(30);

/// Delivers a notification to the user's desktop agent. Failures are the
/// caller's to log; they never gate enforcement.
pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        username: &str,
        title: &str,
        body: &str,
        urgency: u8,
    ) -> impl Future<Output = Result<()>> + Send;
}

const URGENCY_NORMAL: u8 = 1;
const URGENCY_CRITICAL: u8 = 2;

/// Per-user, per-day enforcement phase. Transitions are monotonic within a
/// usage day and reset to Normal at the day boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Normal,
    Warning,
    Grace,
    Terminating,
    Terminated,
}

#[derive(Debug)]
struct UserState {
    phase: Phase,
    /// Warn thresholds (minutes) already sent today.
    warned: BTreeSet<u16>,
    grace_started_at: Option<DateTime<Utc>>,
    last_grace_tick: Option<DateTime<Utc>>,
    /// A kill was enqueued for the user's current set of sessions.
    kill_requested: bool,
}

impl UserState {
    fn new() -> Self {
        Self {
            phase: Phase::Normal,
            warned: BTreeSet::new(),
            grace_started_at: None,
            last_grace_tick: None,
            kill_requested: false,
        }
    }
}

/// Drives the warning / grace / termination state machine from the
/// tracker's read-only usage snapshots.
///
/// Termination is asynchronous: commands are enqueued to a worker (see
/// `terminate`) so a slow or stuck kill can never stall evaluation.
pub struct Enforcer<N: Notifier> {
    clock: Arc<dyn Clock>,
    tracker: Arc<SessionTracker>,
    loader: Arc<ConfigLoader>,
    notifier: N,
    terminate_tx: mpsc::Sender<TerminateCommand>,
    states: Mutex<HashMap<String, UserState>>,
}

impl<N: Notifier> Enforcer<N> {
    pub fn new(
        clock: Arc<dyn Clock>,
        tracker: Arc<SessionTracker>,
        loader: Arc<ConfigLoader>,
        notifier: N,
        terminate_tx: mpsc::Sender<TerminateCommand>,
    ) -> Self {
        Self {
            clock,
            tracker,
            loader,
            notifier,
            terminate_tx,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current phase for IPC reporting. Users without history are Normal.
    pub async fn phase_of(&self, username: &str) -> Phase {
        self.states
            .lock()
            .await
            .get(username)
            .map(|s| s.phase)
            .unwrap_or(Phase::Normal)
    }

    /// Reset every user to Normal. Called at the usage-day boundary.
    pub async fn day_rolled_over(&self) {
        let mut states = self.states.lock().await;
        for (username, state) in states.iter_mut() {
            if state.phase != Phase::Normal {
                debug!(component = "enforcer", username = %username, "phase reset at day boundary");
            }
            *state = UserState::new();
        }
    }

    /// Evaluate every user with at least one live session.
    pub async fn evaluate_all(&self) {
        let users = self.tracker.active_managed_users().await;
        for username in users {
            self.evaluate_user(&username).await;
        }
        self.settle_terminating().await;
    }

    /// Move Terminating users whose sessions are all gone to Terminated.
    async fn settle_terminating(&self) {
        let candidates: Vec<String> = {
            let states = self.states.lock().await;
            states
                .iter()
                .filter(|(_, s)| s.phase == Phase::Terminating)
                .map(|(u, _)| u.clone())
                .collect()
        };
        for username in candidates {
            if self.tracker.sessions_of(&username).await.is_empty() {
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(&username) {
                    if state.phase == Phase::Terminating {
                        state.phase = Phase::Terminated;
                        state.kill_requested = false;
                        info!(component = "enforcer", username = %username, "all sessions closed");
                    }
                }
            }
        }
    }

    pub async fn evaluate_user(&self, username: &str) {
        let now = self.clock.now_utc();
        let remaining = self.tracker.remaining_seconds(username).await;
        let live_sessions = self.tracker.sessions_of(username).await;
        let policy = self.loader.current();
        let Some(user_policy) = policy.user(username) else {
            return;
        };
        let grace_cfg = &policy.notifications.grace;
        // The configured grace duration, unless the user carries an
        // explicit grace_minutes override.
        let grace_duration = user_policy.grace.unwrap_or(grace_cfg.duration);

        let mut states = self.states.lock().await;
        let state = states
            .entry(username.to_string())
            .or_insert_with(UserState::new);

        match state.phase {
            Phase::Normal | Phase::Warning => {
                if remaining <= 0.0 {
                    if grace_cfg.enabled && !grace_duration.is_zero() {
                        state.phase = Phase::Grace;
                        state.grace_started_at = Some(now);
                        state.last_grace_tick = Some(now);
                        info!(component = "enforcer", username = %username, "quota exhausted, grace period started");
                        self.send_notification(
                            username,
                            "Screen time is up",
                            &format!(
                                "Your screen time for today is used up. You have {} minutes to save your work.",
                                grace_duration.as_secs() / 60
                            ),
                            URGENCY_CRITICAL,
                        )
                        .await;
                    } else {
                        self.start_termination(username, state).await;
                    }
                } else {
                    // Thresholds are descending; collect everything due and
                    // send only the most urgent, marking the rest as sent so
                    // they cannot fire late.
                    let due: Vec<u16> = policy
                        .notifications
                        .pre_quota_minutes
                        .iter()
                        .copied()
                        .filter(|t| {
                            remaining <= f64::from(*t) * 60.0 && !state.warned.contains(t)
                        })
                        .collect();
                    if let Some(most_urgent) = due.iter().copied().min() {
                        state.warned.extend(due.iter().copied());
                        state.phase = Phase::Warning;
                        info!(
                            component = "enforcer",
                            username = %username,
                            minutes_left = most_urgent,
                            "quota warning"
                        );
                        self.send_notification(
                            username,
                            "Screen time warning",
                            &format!("You have {most_urgent} minutes of screen time left today."),
                            URGENCY_NORMAL,
                        )
                        .await;
                    }
                }
            }
            Phase::Grace => {
                let started = state.grace_started_at.unwrap_or(now);
                if now.signed_duration_since(started).num_seconds()
                    >= grace_duration.as_secs() as i64
                {
                    self.start_termination(username, state).await;
                } else {
                    let last_tick = state.last_grace_tick.unwrap_or(started);
                    if now.signed_duration_since(last_tick).num_seconds()
                        >= grace_cfg.interval.as_secs() as i64
                    {
                        state.last_grace_tick = Some(now);
                        let left = grace_duration.as_secs() as i64
                            - now.signed_duration_since(started).num_seconds();
                        self.send_notification(
                            username,
                            "Screen time is up",
                            &format!("Please finish up, your session ends in about {} minute(s).", (left.max(0) + 59) / 60),
                            URGENCY_CRITICAL,
                        )
                        .await;
                    }
                }
            }
            Phase::Terminating => {
                // Debounced: no re-notification, no falling back to earlier
                // phases even if the tracker transiently reports time left.
            }
            Phase::Terminated => {
                // A user logging back in on the same exhausted day gets the
                // same treatment again, once per session set.
                if remaining <= 0.0 && !state.kill_requested && !live_sessions.is_empty() {
                    warn!(component = "enforcer", username = %username, "session after exhaustion, terminating again");
                    state.phase = Phase::Terminating;
                    self.enqueue_kill(username, state).await;
                }
            }
        }
    }

    async fn start_termination(&self, username: &str, state: &mut UserState) {
        state.phase = Phase::Terminating;
        info!(component = "enforcer", username = %username, "terminating sessions");
        self.enqueue_kill(username, state).await;
    }

    async fn enqueue_kill(&self, username: &str, state: &mut UserState) {
        state.kill_requested = true;
        let command = TerminateCommand {
            username: username.to_string(),
            uid: self.tracker.uid_of(username).await,
        };
        if self.terminate_tx.send(command).await.is_err() {
            error!(
                component = "enforcer",
                username = %username,
                "termination queue closed, user remains in Terminating"
            );
        }
    }

    async fn send_notification(&self, username: &str, title: &str, body: &str, urgency: u8) {
        if let Err(e) = self.notifier.notify(username, title, body, urgency).await {
            warn!(
                component = "enforcer",
                username = %username,
                error = %format!("{e:#}"),
                "notification delivery failed"
            );
        }
    }
}
