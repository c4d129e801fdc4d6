use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::config::ConfigLoader;
use crate::sessions::{ResyncSession, SessionEvent};
use crate::storage::{SessionRecord, Storage};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Unflushed live seconds beyond which a progress write is due.
const FLUSH_THRESHOLD_SECONDS: f64 = 15.0;

/// When a storage-open session is gone from the resync snapshot, it is
/// closed at its last update plus at most this much slack.
const STALE_CLOSE_GRACE_SECONDS: i64 = 60;

/// Out-of-band facts the tracker surfaces to the enforcement layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerNotice {
    DayRolledOver,
}

/// In-memory view of one live session.
///
/// Accumulated usage is carried as a (monotonic anchor, seconds at anchor)
/// pair: while unlocked, live seconds grow with the monotonic clock from
/// the anchor; locking folds the elapsed time into the pair. Restart
/// recovery re-anchors at "now" with the stored total, which keeps usage
/// monotonic even when the wall clock jumped while the daemon was down.
#[derive(Debug, Clone)]
struct SessionRuntime {
    username: String,
    uid: u32,
    start_wall: i64,
    accumulated_at_anchor: f64,
    anchor_monotonic: Duration,
    locked: bool,
    persisted_seconds: f64,
    /// Live seconds already attributed to previous usage days.
    day_floor: f64,
}

impl SessionRuntime {
    fn live_seconds(&self, now_mono: Duration) -> f64 {
        if self.locked {
            self.accumulated_at_anchor
        } else {
            self.accumulated_at_anchor
                + now_mono.saturating_sub(self.anchor_monotonic).as_secs_f64()
        }
    }

    /// Contribution to the current usage day.
    fn today_seconds(&self, now_mono: Duration) -> f64 {
        (self.live_seconds(now_mono) - self.day_floor).max(0.0)
    }
}

struct TrackerState {
    active: HashMap<String, SessionRuntime>,
    /// Cached closed-session contribution to the current day, per user.
    /// Entries are filled lazily from storage and dropped whenever storage
    /// changes underneath (resync, window shift).
    closed_base: HashMap<String, f64>,
    day_window: (DateTime<Utc>, DateTime<Utc>),
}

/// Maintains live sessions and per-user usage for the current day.
///
/// One coarse mutex guards the whole state including the paired storage
/// writes, so event handling, ticking and recovery see read-then-write
/// atomicity per session.
pub struct SessionTracker {
    clock: Arc<dyn Clock>,
    storage: Arc<Storage>,
    loader: Arc<ConfigLoader>,
    state: Mutex<TrackerState>,
}

impl SessionTracker {
    pub fn new(clock: Arc<dyn Clock>, storage: Arc<Storage>, loader: Arc<ConfigLoader>) -> Self {
        let policy = loader.current();
        let day_window = clock::day_window(clock.now_utc(), policy.reset_time, policy.timezone);
        Self {
            clock,
            storage,
            loader,
            state: Mutex::new(TrackerState {
                active: HashMap::new(),
                closed_base: HashMap::new(),
                day_window,
            }),
        }
    }

    /// Current usage-day window `[start, end)`.
    pub async fn day_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        self.state.lock().await.day_window
    }

    /// Apply one session event. Returned notices must reach the enforcer.
    pub async fn handle_event(&self, event: SessionEvent) -> Vec<TrackerNotice> {
        let mut state = self.state.lock().await;
        let notices = self.advance_day(&mut state);
        match event {
            SessionEvent::New {
                id,
                username,
                uid,
                seat,
            } => self.on_new(&mut state, id, username, uid, seat).await,
            SessionEvent::Removed { id } => self.on_removed(&mut state, &id).await,
            SessionEvent::Locked { id } => self.on_lock_change(&mut state, &id, true).await,
            SessionEvent::Unlocked { id } => self.on_lock_change(&mut state, &id, false).await,
            SessionEvent::Resync { sessions } => self.on_resync(&mut state, sessions).await,
        }
        notices
    }

    /// Periodic advance: rollover detection plus threshold-based flushing.
    pub async fn tick(&self) -> Vec<TrackerNotice> {
        let mut state = self.state.lock().await;
        let notices = self.advance_day(&mut state);

        let now_mono = self.clock.monotonic();
        let now_wall = self.clock.now_utc().timestamp();
        for (id, runtime) in state.active.iter_mut() {
            if runtime.locked {
                continue;
            }
            let live = runtime.live_seconds(now_mono);
            if live - runtime.persisted_seconds >= FLUSH_THRESHOLD_SECONDS {
                if let Err(e) = self
                    .storage
                    .update_session_progress(id, live, now_wall)
                    .await
                {
                    warn!(component = "tracker", session_id = %id, error = %e, "progress flush failed");
                } else {
                    runtime.persisted_seconds = live;
                }
            }
        }
        notices
    }

    /// Best-effort finalization on shutdown: every live session is flushed
    /// and closed with its current total.
    pub async fn shutdown_flush(&self) {
        let mut state = self.state.lock().await;
        let now_mono = self.clock.monotonic();
        let now_wall = self.clock.now_utc().timestamp();
        let ids: Vec<String> = state.active.keys().cloned().collect();
        for id in ids {
            if let Some(runtime) = state.active.remove(&id) {
                let live = runtime.live_seconds(now_mono);
                if let Err(e) = self.storage.close_session(&id, now_wall, live).await {
                    warn!(component = "tracker", session_id = %id, error = %e, "shutdown close failed");
                }
            }
        }
        state.closed_base.clear();
    }

    /// Drop sessions whose user is no longer managed: they are finalized
    /// into storage with their current totals and never terminated. The
    /// writers remove the user's PAM/systemd artifacts on their next pass.
    pub async fn prune_unmanaged(&self) {
        let policy = self.loader.current();
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .active
            .iter()
            .filter(|(_, rt)| !policy.is_managed(&rt.username))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            info!(component = "tracker", session_id = %id, "abandoning session of unmanaged user");
            self.on_removed(&mut state, &id).await;
        }
    }

    /// Seconds of usage attributed to `username` in the current day.
    pub async fn used_seconds(&self, username: &str) -> f64 {
        let mut state = self.state.lock().await;
        let window = state.day_window;
        let closed = match state.closed_base.get(username) {
            Some(value) => *value,
            None => {
                let fetched = self
                    .storage
                    .sum_closed_usage(username, window.0.timestamp(), window.1.timestamp())
                    .await
                    .unwrap_or_else(|e| {
                        warn!(component = "tracker", username = %username, error = %e, "usage query failed");
                        0.0
                    });
                state.closed_base.insert(username.to_string(), fetched);
                fetched
            }
        };

        let now_mono = self.clock.monotonic();
        let live: f64 = state
            .active
            .values()
            .filter(|rt| rt.username == username)
            .map(|rt| rt.today_seconds(now_mono))
            .sum();
        closed + live
    }

    /// Seconds left of today's budget (quota plus bonus), clamped at zero.
    /// Unmanaged users have no budget.
    pub async fn remaining_seconds(&self, username: &str) -> f64 {
        let policy = self.loader.current();
        let Some(user_policy) = policy.user(username) else {
            return 0.0;
        };
        let window_start = self.state.lock().await.day_window.0.timestamp();
        let bonus = self
            .storage
            .bonus_seconds(username, window_start)
            .await
            .unwrap_or_else(|e| {
                warn!(component = "tracker", username = %username, error = %e, "bonus query failed");
                0
            });
        let budget = user_policy.daily_quota.as_secs_f64() + bonus as f64;
        let used = self.used_seconds(username).await;
        (budget - used).max(0.0)
    }

    /// Managed users with at least one live session.
    pub async fn active_managed_users(&self) -> BTreeSet<String> {
        let policy = self.loader.current();
        let state = self.state.lock().await;
        state
            .active
            .values()
            .filter(|rt| policy.is_managed(&rt.username))
            .map(|rt| rt.username.clone())
            .collect()
    }

    pub async fn sessions_of(&self, username: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .active
            .iter()
            .filter(|(_, rt)| rt.username == username)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn uid_of(&self, username: &str) -> Option<u32> {
        let state = self.state.lock().await;
        state
            .active
            .values()
            .find(|rt| rt.username == username)
            .map(|rt| rt.uid)
    }

    /// Detect a crossed reset instant or a shifted window definition.
    fn advance_day(&self, state: &mut TrackerState) -> Vec<TrackerNotice> {
        let now = self.clock.now_utc();
        let policy = self.loader.current();
        let expected = clock::day_window(now, policy.reset_time, policy.timezone);

        if now >= state.day_window.1 {
            let now_mono = self.clock.monotonic();
            // Split at the boundary instant, not at this tick: whatever
            // accrued between the reset and its detection belongs to the
            // new day.
            let since_boundary = (now - state.day_window.1).num_seconds().max(0) as f64;
            for runtime in state.active.values_mut() {
                let live = runtime.live_seconds(now_mono);
                runtime.day_floor = if runtime.locked {
                    live
                } else {
                    (live - since_boundary).max(0.0)
                };
            }
            state.closed_base.clear();
            state.day_window = expected;
            info!(component = "tracker", "usage day rolled over");
            return vec![TrackerNotice::DayRolledOver];
        }

        if expected != state.day_window {
            // reset_time or timezone changed at runtime: the window shifts
            // without resetting accumulated usage. Per-session floors are
            // re-derived from the wall-clock share before the new start.
            let now_mono = self.clock.monotonic();
            let now_wall = now.timestamp();
            for runtime in state.active.values_mut() {
                let live = runtime.live_seconds(now_mono);
                let span = (now_wall - runtime.start_wall).max(0);
                let before = (expected.0.timestamp() - runtime.start_wall).clamp(0, span);
                runtime.day_floor = if span > 0 {
                    live * before as f64 / span as f64
                } else {
                    0.0
                };
            }
            state.closed_base.clear();
            state.day_window = expected;
            info!(component = "tracker", "usage day window shifted");
        }
        Vec::new()
    }

    async fn on_new(
        &self,
        state: &mut TrackerState,
        id: String,
        username: String,
        uid: u32,
        seat: Option<String>,
    ) {
        if !self.loader.current().is_managed(&username) {
            debug!(component = "tracker", username = %username, "ignoring session of unmanaged user");
            return;
        }
        if state.active.contains_key(&id) {
            warn!(component = "tracker", session_id = %id, "duplicate NewSession ignored");
            return;
        }

        let now_wall = self.clock.now_utc().timestamp();
        let runtime = SessionRuntime {
            username: username.clone(),
            uid,
            start_wall: now_wall,
            accumulated_at_anchor: 0.0,
            anchor_monotonic: self.clock.monotonic(),
            locked: false,
            persisted_seconds: 0.0,
            day_floor: 0.0,
        };

        let record = SessionRecord {
            id: id.clone(),
            username: username.clone(),
            start_wall: now_wall,
            end_wall: None,
            accumulated_seconds: 0.0,
            last_update_wall: now_wall,
            seat,
        };
        if let Err(e) = self.storage.insert_session(&record).await {
            warn!(component = "tracker", session_id = %id, error = %e, "session insert failed");
        }
        info!(component = "tracker", session_id = %id, username = %username, "session opened");
        state.active.insert(id, runtime);
    }

    async fn on_removed(&self, state: &mut TrackerState, id: &str) {
        let Some(runtime) = state.active.remove(id) else {
            debug!(component = "tracker", session_id = %id, "removal of unknown session ignored");
            return;
        };
        let now_mono = self.clock.monotonic();
        let now_wall = self.clock.now_utc().timestamp();
        let live = runtime.live_seconds(now_mono);

        if let Err(e) = self.storage.close_session(id, now_wall, live).await {
            warn!(component = "tracker", session_id = %id, error = %e, "session close failed");
        }
        if let Some(base) = state.closed_base.get_mut(&runtime.username) {
            *base += (live - runtime.day_floor).max(0.0);
        }
        info!(
            component = "tracker",
            session_id = %id,
            username = %runtime.username,
            accumulated_seconds = live,
            "session closed"
        );
    }

    async fn on_lock_change(&self, state: &mut TrackerState, id: &str, locked: bool) {
        let now_mono = self.clock.monotonic();
        let now_wall = self.clock.now_utc().timestamp();

        let Some(runtime) = state.active.get_mut(id) else {
            warn!(component = "tracker", session_id = %id, "lock event for unknown session");
            return;
        };
        // Resync may re-report a state we already hold; that must be a no-op.
        if runtime.locked == locked {
            warn!(component = "tracker", session_id = %id, locked, "redundant lock event ignored");
            return;
        }

        if locked {
            runtime.accumulated_at_anchor = runtime.live_seconds(now_mono);
            runtime.locked = true;
            debug!(component = "tracker", session_id = %id, "session locked");
        } else {
            runtime.anchor_monotonic = now_mono;
            runtime.locked = false;
            debug!(component = "tracker", session_id = %id, "session unlocked");
        }

        let live = runtime.live_seconds(now_mono);
        if let Err(e) = self.storage.update_session_progress(id, live, now_wall).await {
            warn!(component = "tracker", session_id = %id, error = %e, "progress flush failed");
        } else {
            runtime.persisted_seconds = live;
        }
    }

    /// Reconcile against a ground-truth snapshot: close what it lacks,
    /// adopt what storage remembers, open what is new.
    async fn on_resync(&self, state: &mut TrackerState, sessions: Vec<ResyncSession>) {
        let policy = self.loader.current();
        let now_mono = self.clock.monotonic();
        let now_wall = self.clock.now_utc().timestamp();
        let window_start = state.day_window.0.timestamp();

        let reported: HashMap<String, &ResyncSession> =
            sessions.iter().map(|s| (s.id.clone(), s)).collect();

        // Live sessions the snapshot no longer reports are gone.
        let vanished: Vec<String> = state
            .active
            .keys()
            .filter(|id| !reported.contains_key(*id))
            .cloned()
            .collect();
        for id in vanished {
            self.on_removed(&mut *state, &id).await;
        }

        let stored: HashMap<String, SessionRecord> = match self.storage.list_open_sessions().await {
            Ok(records) => records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            Err(e) => {
                warn!(component = "tracker", error = %e, "open-session query failed during resync");
                HashMap::new()
            }
        };

        for session in &sessions {
            if !policy.is_managed(&session.username) {
                continue;
            }

            if state.active.contains_key(&session.id) {
                // Already tracked; reconcile only the lock state.
                let currently_locked = state.active[&session.id].locked;
                if currently_locked != session.locked {
                    self.on_lock_change(&mut *state, &session.id, session.locked)
                        .await;
                }
                continue;
            }

            match stored.get(&session.id) {
                Some(record) if record.username == session.username => {
                    // Adopt: anchor on the stored total so usage never
                    // regresses, whatever the wall clock did meanwhile.
                    let accumulated = record.accumulated_seconds;
                    let span = (record.last_update_wall - record.start_wall).max(0);
                    let before = (window_start - record.start_wall).clamp(0, span);
                    let day_floor = if span > 0 {
                        accumulated * before as f64 / span as f64
                    } else {
                        0.0
                    };
                    info!(
                        component = "tracker",
                        session_id = %session.id,
                        username = %session.username,
                        accumulated_seconds = accumulated,
                        "adopted session from storage"
                    );
                    state.active.insert(
                        session.id.clone(),
                        SessionRuntime {
                            username: session.username.clone(),
                            uid: session.uid,
                            start_wall: record.start_wall,
                            accumulated_at_anchor: accumulated,
                            anchor_monotonic: now_mono,
                            locked: session.locked,
                            persisted_seconds: accumulated,
                            day_floor,
                        },
                    );
                }
                _ => {
                    self.on_new(
                        &mut *state,
                        session.id.clone(),
                        session.username.clone(),
                        session.uid,
                        session.seat.clone(),
                    )
                    .await;
                    if session.locked {
                        self.on_lock_change(&mut *state, &session.id, true).await;
                    }
                }
            }
        }

        // Storage-open sessions nobody reports ended while we were away:
        // close them near their last update, never adding more than the
        // configured slack.
        for (id, record) in stored {
            if reported.contains_key(&id) || state.active.contains_key(&id) {
                continue;
            }
            let end = (record.last_update_wall + STALE_CLOSE_GRACE_SECONDS).min(now_wall);
            info!(
                component = "tracker",
                session_id = %id,
                username = %record.username,
                "closing stale session from previous run"
            );
            if let Err(e) = self
                .storage
                .close_session(&id, end, record.accumulated_seconds)
                .await
            {
                warn!(component = "tracker", session_id = %id, error = %e, "stale close failed");
            }
        }

        // Closed-set changed under the cache; refetch lazily.
        state.closed_base.clear();
    }
}
