use anyhow::{Context, Result};
use futures_util::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::zvariant::OwnedObjectPath;

use crate::config::ConfigLoader;
use crate::sessions::{ResyncSession, SessionEvent};

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1",
    gen_blocking = false
)]
pub trait LogindManager {
    /// Array of (session_id, uid, username, seat, object_path).
    fn list_sessions(&self) -> zbus::Result<Vec<(String, u32, String, String, OwnedObjectPath)>>;

    fn terminate_user(&self, uid: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn session_new(&self, session_id: String, object_path: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal)]
    fn session_removed(&self, session_id: String, object_path: OwnedObjectPath)
        -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.login1.Session",
    default_service = "org.freedesktop.login1",
    gen_blocking = false
)]
pub trait LogindSession {
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn user(&self) -> zbus::Result<(u32, OwnedObjectPath)>;

    #[zbus(property)]
    fn seat(&self) -> zbus::Result<(String, OwnedObjectPath)>;

    #[zbus(property)]
    fn locked_hint(&self) -> zbus::Result<bool>;
}

/// Reconnect schedule: 2 s initial, doubling to a 60 s cap, ±20% jitter.
pub struct ReconnectBackoff {
    current: Duration,
}

const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }

    /// The next delay to sleep, with jitter applied; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(BACKOFF_CAP);
        jitter(base)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

/// Watches systemd-logind on the system bus and forwards session lifecycle
/// events for managed users. Reconnects with backoff on bus loss and emits
/// a `Resync` ground-truth snapshot after every successful (re)connect.
pub struct LoginSource {
    loader: Arc<ConfigLoader>,
    events: mpsc::Sender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl LoginSource {
    pub fn new(
        loader: Arc<ConfigLoader>,
        events: mpsc::Sender<SessionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            loader,
            events,
            shutdown,
        }
    }

    /// Run until shutdown. Never returns early on bus errors; those only
    /// feed the reconnect schedule.
    pub async fn run(mut self) {
        let mut backoff = ReconnectBackoff::new();
        loop {
            if *self.shutdown.borrow() {
                return;
            }

            match zbus::Connection::system().await {
                Ok(conn) => {
                    info!("connected to system bus");
                    backoff.reset();
                    if let Err(e) = self.run_connected(&conn).await {
                        warn!(error = %format!("{e:#}"), "session bus watch ended");
                    }
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to connect to system bus");
                }
            }

            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting to system bus");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => return,
            }
        }
    }

    async fn run_connected(&self, conn: &zbus::Connection) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let manager = LogindManagerProxy::new(conn)
            .await
            .context("failed to create logind manager proxy")?;

        // Subscribe before snapshotting so no event falls in the gap.
        let mut new_stream = manager
            .receive_session_new()
            .await
            .context("failed to subscribe to SessionNew")?;
        let mut removed_stream = manager
            .receive_session_removed()
            .await
            .context("failed to subscribe to SessionRemoved")?;

        let mut watchers: HashMap<String, JoinHandle<()>> = HashMap::new();

        let snapshot = self.resync_snapshot(conn, &manager).await?;
        for session in &snapshot {
            watchers.insert(
                session.id.clone(),
                self.spawn_lock_watcher(conn, &session.id, &session.path),
            );
        }
        let sessions = snapshot.into_iter().map(|s| s.session).collect();
        self.send(SessionEvent::Resync { sessions }).await;

        let result = loop {
            tokio::select! {
                signal = new_stream.next() => {
                    let Some(signal) = signal else {
                        break Err(anyhow::anyhow!("SessionNew stream closed (bus disconnect)"));
                    };
                    let args = match signal.args() {
                        Ok(args) => args,
                        Err(e) => {
                            warn!(error = %e, "malformed SessionNew signal");
                            continue;
                        }
                    };
                    let session_id = args.session_id.clone();
                    let path = args.object_path.clone();
                    if let Some((event, watcher)) =
                        self.on_session_new(conn, &session_id, &path).await
                    {
                        watchers.insert(session_id, watcher);
                        self.send(event).await;
                    }
                }
                signal = removed_stream.next() => {
                    let Some(signal) = signal else {
                        break Err(anyhow::anyhow!("SessionRemoved stream closed (bus disconnect)"));
                    };
                    let args = match signal.args() {
                        Ok(args) => args,
                        Err(e) => {
                            warn!(error = %e, "malformed SessionRemoved signal");
                            continue;
                        }
                    };
                    let session_id = args.session_id.clone();
                    // Only sessions we announced are forwarded.
                    if let Some(watcher) = watchers.remove(&session_id) {
                        watcher.abort();
                        self.send(SessionEvent::Removed { id: session_id }).await;
                    } else {
                        debug!(session_id = %session_id, "removal of unmanaged session ignored");
                    }
                }
                _ = shutdown.changed() => break Ok(()),
            }
        };

        for (_, watcher) in watchers {
            watcher.abort();
        }
        result
    }

    /// Ground truth for all current managed sessions.
    async fn resync_snapshot(
        &self,
        conn: &zbus::Connection,
        manager: &LogindManagerProxy<'_>,
    ) -> Result<Vec<SnapshotEntry>> {
        let listed = manager
            .list_sessions()
            .await
            .context("failed to list sessions")?;

        let policy = self.loader.current();
        let mut entries = Vec::new();
        for (id, uid, username, seat, path) in listed {
            if !policy.is_managed(&username) {
                debug!(session_id = %id, username = %username, "ignoring unmanaged session");
                continue;
            }
            let locked = match self.session_proxy(conn, &path).await {
                Ok(proxy) => proxy.locked_hint().await.unwrap_or(false),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "could not query lock state, assuming unlocked");
                    false
                }
            };
            entries.push(SnapshotEntry {
                id: id.clone(),
                path,
                session: ResyncSession {
                    id,
                    username,
                    uid,
                    seat: if seat.is_empty() { None } else { Some(seat) },
                    locked,
                },
            });
        }
        Ok(entries)
    }

    async fn on_session_new(
        &self,
        conn: &zbus::Connection,
        session_id: &str,
        path: &OwnedObjectPath,
    ) -> Option<(SessionEvent, JoinHandle<()>)> {
        let proxy = match self.session_proxy(conn, path).await {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to inspect new session");
                return None;
            }
        };
        let username = match proxy.name().await {
            Ok(name) => name,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to read session user");
                return None;
            }
        };
        if !self.loader.current().is_managed(&username) {
            debug!(session_id = %session_id, username = %username, "ignoring unmanaged session");
            return None;
        }

        let uid = proxy.user().await.map(|(uid, _)| uid).unwrap_or(0);
        let seat = proxy
            .seat()
            .await
            .ok()
            .map(|(seat, _)| seat)
            .filter(|s| !s.is_empty());

        info!(session_id = %session_id, username = %username, "managed session started");
        let watcher = self.spawn_lock_watcher(conn, session_id, path);
        Some((
            SessionEvent::New {
                id: session_id.to_string(),
                username,
                uid,
                seat,
            },
            watcher,
        ))
    }

    async fn session_proxy(
        &self,
        conn: &zbus::Connection,
        path: &OwnedObjectPath,
    ) -> zbus::Result<LogindSessionProxy<'static>> {
        LogindSessionProxy::builder(conn)
            .path(path.clone())?
            .build()
            .await
    }

    /// Forward LockedHint transitions for one session as Locked/Unlocked
    /// events until the session goes away.
    fn spawn_lock_watcher(
        &self,
        conn: &zbus::Connection,
        session_id: &str,
        path: &OwnedObjectPath,
    ) -> JoinHandle<()> {
        let conn = conn.clone();
        let path = path.clone();
        let session_id = session_id.to_string();
        let events = self.events.clone();

        tokio::spawn(async move {
            let builder = match LogindSessionProxy::builder(&conn).path(path) {
                Ok(builder) => builder,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "lock watcher failed to start");
                    return;
                }
            };
            let proxy = match builder.build().await {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "lock watcher failed to start");
                    return;
                }
            };

            let mut last = proxy.locked_hint().await.unwrap_or(false);
            let mut changes = proxy.receive_locked_hint_changed().await;
            while let Some(change) = changes.next().await {
                let locked = match change.get().await {
                    Ok(locked) => locked,
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "lock state read failed");
                        continue;
                    }
                };
                if locked == last {
                    continue;
                }
                last = locked;
                let event = if locked {
                    SessionEvent::Locked {
                        id: session_id.clone(),
                    }
                } else {
                    SessionEvent::Unlocked {
                        id: session_id.clone(),
                    }
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        })
    }

    async fn send(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event channel closed, dropping session event");
        }
    }
}

struct SnapshotEntry {
    id: String,
    path: OwnedObjectPath,
    session: ResyncSession,
}
