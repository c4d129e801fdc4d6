use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ConfigLoader;
use crate::enforcer::{Enforcer, Notifier, Phase};
use crate::sessions::SessionTracker;
use crate::storage::Storage;
use crate::writers::{SystemdControl, SystemdWriter};

/// Frames are a 4-byte big-endian length followed by a JSON body.
pub const MAX_FRAME_BYTES: u32 = 1024 * 1024;

const BONUS_MIN_MINUTES: i64 = 1;
const BONUS_MAX_MINUTES: i64 = 240;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
enum Request {
    Status,
    ListKids,
    GetQuota { user: String },
    GetCurfew { user: String },
    GrantBonus { user: String, minutes: i64 },
    Reload,
    ListTimers,
}

const KNOWN_COMMANDS: &[&str] = &[
    "status",
    "list-kids",
    "get-quota",
    "get-curfew",
    "grant-bonus",
    "reload",
    "list-timers",
];

/// Everything a command handler may touch.
pub struct IpcContext<N: Notifier, C: SystemdControl> {
    pub started_at: Instant,
    pub loader: Arc<ConfigLoader>,
    pub storage: Arc<Storage>,
    pub tracker: Arc<SessionTracker>,
    pub enforcer: Arc<Enforcer<N>>,
    pub systemd: Arc<SystemdWriter<C>>,
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Normal => "normal",
        Phase::Warning => "warning",
        Phase::Grace => "grace",
        Phase::Terminating => "terminating",
        Phase::Terminated => "terminated",
    }
}

fn unknown_command() -> Value {
    json!({ "error": "unknown_command" })
}

fn invalid_argument(detail: impl Into<String>) -> Value {
    json!({ "error": "invalid_argument", "detail": detail.into() })
}

/// Parse a raw frame body and run it. Unknown commands and malformed
/// bodies produce error replies, never a dropped connection.
pub async fn dispatch<N: Notifier, C: SystemdControl>(
    ctx: &IpcContext<N, C>,
    body: &[u8],
) -> Value {
    let raw: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => return invalid_argument(format!("body is not valid JSON: {e}")),
    };
    match raw.get("command").and_then(Value::as_str) {
        Some(command) if KNOWN_COMMANDS.contains(&command) => {}
        Some(_) | None => return unknown_command(),
    }
    let request: Request = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => return invalid_argument(e.to_string()),
    };
    handle_request(ctx, request).await
}

async fn handle_request<N: Notifier, C: SystemdControl>(
    ctx: &IpcContext<N, C>,
    request: Request,
) -> Value {
    match request {
        Request::Status => {
            let active = ctx.tracker.active_managed_users().await;
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": ctx.started_at.elapsed().as_secs(),
                "active_users": active.len(),
            })
        }
        Request::ListKids => {
            let kids: Vec<String> = ctx
                .loader
                .current()
                .managed_users()
                .map(str::to_string)
                .collect();
            json!({ "kids": kids })
        }
        Request::GetQuota { user } => {
            let policy = ctx.loader.current();
            let Some(user_policy) = policy.user(&user) else {
                return invalid_argument(format!("unknown user '{user}'"));
            };
            let used = ctx.tracker.used_seconds(&user).await;
            let remaining = ctx.tracker.remaining_seconds(&user).await;
            let phase = ctx.enforcer.phase_of(&user).await;
            json!({
                "user": user,
                "quota": minutes(user_policy.daily_quota.as_secs_f64()),
                "used": minutes(used),
                "remaining": minutes(remaining),
                "phase": phase_name(phase),
            })
        }
        Request::GetCurfew { user } => {
            let policy = ctx.loader.current();
            let Some(user_policy) = policy.user(&user) else {
                return invalid_argument(format!("unknown user '{user}'"));
            };
            let curfew: serde_json::Map<String, Value> = user_policy
                .curfew
                .iter()
                .map(|(day, window)| {
                    (
                        format!("{day:?}").to_lowercase(),
                        Value::String(format!(
                            "{}-{}",
                            window.start.format("%H:%M"),
                            window.end.format("%H:%M")
                        )),
                    )
                })
                .collect();
            json!({ "user": user, "curfew": curfew })
        }
        Request::GrantBonus { user, minutes: m } => {
            if !(BONUS_MIN_MINUTES..=BONUS_MAX_MINUTES).contains(&m) {
                return invalid_argument(format!(
                    "minutes must be between {BONUS_MIN_MINUTES} and {BONUS_MAX_MINUTES}"
                ));
            }
            if ctx.loader.current().user(&user).is_none() {
                return invalid_argument(format!("unknown user '{user}'"));
            }
            let window_start = ctx.tracker.day_window().await.0.timestamp();
            match ctx.storage.add_bonus(&user, window_start, m * 60).await {
                Ok(()) => {
                    info!(component = "ipc", username = %user, minutes = m, "bonus granted");
                    let remaining = ctx.tracker.remaining_seconds(&user).await;
                    json!({
                        "user": user,
                        "granted_minutes": m,
                        "remaining": minutes(remaining),
                    })
                }
                Err(e) => invalid_argument(format!("failed to persist bonus: {e}")),
            }
        }
        Request::Reload => match ctx.loader.reload() {
            Ok(true) => json!({ "status": "reloaded" }),
            Ok(false) => json!({ "status": "unchanged" }),
            Err(e) => invalid_argument(e.to_string()),
        },
        Request::ListTimers => match ctx.systemd.list_timers().await {
            Ok(timers) => {
                let entries: Vec<Value> = timers
                    .into_iter()
                    .map(|t| json!({ "unit": t.unit, "state": t.state }))
                    .collect();
                json!({ "timers": entries })
            }
            Err(e) => invalid_argument(e.to_string()),
        },
    }
}

fn minutes(seconds: f64) -> f64 {
    (seconds / 60.0 * 10.0).round() / 10.0
}

async fn write_frame(stream: &mut UnixStream, payload: &Value) -> std::io::Result<()> {
    let body = payload.to_string().into_bytes();
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}

/// Serve one connection: sequential frames, one response per request.
/// Oversized frames are drained and answered with an error so the
/// connection survives.
pub async fn handle_connection<N: Notifier, C: SystemdControl>(
    ctx: Arc<IpcContext<N, C>>,
    mut stream: UnixStream,
) {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(_) => return,
        }
        let len = u32::from_be_bytes(len_buf);

        if len > MAX_FRAME_BYTES {
            // Drain the oversized body so framing stays aligned.
            let mut remaining = len as u64;
            let mut sink = [0u8; 8192];
            while remaining > 0 {
                let chunk = remaining.min(sink.len() as u64) as usize;
                match stream.read_exact(&mut sink[..chunk]).await {
                    Ok(_) => remaining -= chunk as u64,
                    Err(_) => return,
                }
            }
            let reply = invalid_argument(format!("frame exceeds {MAX_FRAME_BYTES} bytes"));
            if write_frame(&mut stream, &reply).await.is_err() {
                return;
            }
            continue;
        }

        let mut body = vec![0u8; len as usize];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let reply = dispatch(&ctx, &body).await;
        if write_frame(&mut stream, &reply).await.is_err() {
            return;
        }
    }
}

/// Resolve a group name to its gid.
pub fn resolve_group_gid(name: &str) -> Option<u32> {
    let c_name = std::ffi::CString::new(name).ok()?;
    let entry = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if entry.is_null() {
        None
    } else {
        Some(unsafe { (*entry).gr_gid })
    }
}

/// Bind the admin socket: root-owned, admin-group readable, mode 0660
/// (0600 when the group does not exist).
pub fn bind_socket(path: &Path, admin_group: &str) -> Result<(UnixListener, Option<u32>)> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        crate::fs::ensure_directory(parent)?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;

    use std::os::unix::fs::PermissionsExt;
    let admin_gid = resolve_group_gid(admin_group);
    match admin_gid {
        Some(gid) => {
            std::os::unix::fs::chown(path, None, Some(gid))
                .with_context(|| format!("failed to chown {}", path.display()))?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
        }
        None => {
            warn!(
                component = "ipc",
                group = %admin_group,
                "admin group not found, socket restricted to root"
            );
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    info!(component = "ipc", path = %path.display(), "admin socket listening");
    Ok((listener, admin_gid))
}

/// Accept loop. Peers must be root or members of the admin group.
pub async fn serve<N: Notifier + 'static, C: SystemdControl + 'static>(
    ctx: Arc<IpcContext<N, C>>,
    listener: UnixListener,
    admin_gid: Option<u32>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(component = "ipc", error = %e, "accept failed");
                        continue;
                    }
                };
                if !peer_allowed(&stream, admin_gid) {
                    warn!(component = "ipc", "rejecting connection from unauthorized peer");
                    continue;
                }
                let ctx = ctx.clone();
                tokio::spawn(handle_connection(ctx, stream));
            }
            _ = shutdown.changed() => {
                debug!(component = "ipc", "admin socket shutting down");
                return;
            }
        }
    }
}

fn peer_allowed(stream: &UnixStream, admin_gid: Option<u32>) -> bool {
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == 0 || admin_gid.is_some_and(|gid| cred.gid() == gid),
        Err(e) => {
            warn!(component = "ipc", error = %e, "could not read peer credentials");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::enforcer::TerminateCommand;
    use crate::writers::SystemdWriter;
    use chrono::TimeZone;
    use chrono::Utc;
    use tokio::sync::mpsc;

    struct NullNotifier;
    impl Notifier for NullNotifier {
        async fn notify(&self, _: &str, _: &str, _: &str, _: u8) -> Result<()> {
            Ok(())
        }
    }

    struct NullControl;
    impl SystemdControl for NullControl {
        async fn daemon_reload(&self) -> Result<()> {
            Ok(())
        }
        async fn enable_now(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn disable_now(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn stop(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn unit_state(&self, _: &str) -> Result<String> {
            Ok("enabled".to_string())
        }
    }

    struct Fixture {
        ctx: Arc<IpcContext<NullNotifier, NullControl>>,
        clock: Arc<TestClock>,
        _terminations: mpsc::Receiver<TerminateCommand>,
        config_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    const CONFIG: &str = r#"
timezone: "Europe/Berlin"
reset_time: "03:00"
users:
  kid1:
    daily_quota_minutes: 60
    curfew: { weekdays: "07:30-19:30" }
  kid2: {}
"#;

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, CONFIG).unwrap();

        let clock = Arc::new(TestClock::new(
            Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap(),
        ));
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let loader = Arc::new(ConfigLoader::load(config_path.clone()).unwrap());
        let tracker = Arc::new(SessionTracker::new(
            clock.clone(),
            storage.clone(),
            loader.clone(),
        ));
        let (tx, rx) = mpsc::channel(8);
        let enforcer = Arc::new(Enforcer::new(
            clock.clone(),
            tracker.clone(),
            loader.clone(),
            NullNotifier,
            tx,
        ));
        let systemd = Arc::new(SystemdWriter::new(
            dir.path().join("units"),
            NullControl,
        ));

        Fixture {
            ctx: Arc::new(IpcContext {
                started_at: Instant::now(),
                loader,
                storage,
                tracker,
                enforcer,
                systemd,
            }),
            clock,
            _terminations: rx,
            config_path,
            _dir: dir,
        }
    }

    async fn call(fx: &Fixture, body: Value) -> Value {
        dispatch(&fx.ctx, body.to_string().as_bytes()).await
    }

    #[tokio::test]
    async fn status_reports_version_and_active_count() {
        let fx = fixture();
        let reply = call(&fx, json!({ "command": "status" })).await;
        assert_eq!(reply["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(reply["active_users"], 0);
        assert!(reply["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn list_kids_returns_managed_users() {
        let fx = fixture();
        let reply = call(&fx, json!({ "command": "list-kids" })).await;
        assert_eq!(reply["kids"], json!(["kid1", "kid2"]));
    }

    #[tokio::test]
    async fn get_quota_reports_usage_and_phase() {
        let fx = fixture();
        fx.ctx
            .tracker
            .handle_event(crate::sessions::SessionEvent::New {
                id: "s1".into(),
                username: "kid1".into(),
                uid: 1001,
                seat: None,
            })
            .await;
        fx.clock.advance(std::time::Duration::from_secs(600));

        let reply = call(&fx, json!({ "command": "get-quota", "user": "kid1" })).await;
        assert_eq!(reply["quota"], 60.0);
        assert_eq!(reply["used"], 10.0);
        assert_eq!(reply["remaining"], 50.0);
        assert_eq!(reply["phase"], "normal");
    }

    #[tokio::test]
    async fn get_quota_for_unknown_user_is_invalid() {
        let fx = fixture();
        let reply = call(&fx, json!({ "command": "get-quota", "user": "stranger" })).await;
        assert_eq!(reply["error"], "invalid_argument");
    }

    #[tokio::test]
    async fn get_curfew_resolves_windows() {
        let fx = fixture();
        let reply = call(&fx, json!({ "command": "get-curfew", "user": "kid1" })).await;
        assert_eq!(reply["curfew"]["weekdays"], "07:30-19:30");
    }

    #[tokio::test]
    async fn grant_bonus_applies_immediately_and_persists() {
        let fx = fixture();
        let reply = call(
            &fx,
            json!({ "command": "grant-bonus", "user": "kid1", "minutes": 30 }),
        )
        .await;
        assert_eq!(reply["granted_minutes"], 30);
        assert_eq!(reply["remaining"], 90.0);

        let window_start = fx.ctx.tracker.day_window().await.0.timestamp();
        assert_eq!(
            fx.ctx
                .storage
                .bonus_seconds("kid1", window_start)
                .await
                .unwrap(),
            1800
        );
    }

    #[tokio::test]
    async fn grant_bonus_validates_range_and_user() {
        let fx = fixture();
        for minutes in [0, -5, 241] {
            let reply = call(
                &fx,
                json!({ "command": "grant-bonus", "user": "kid1", "minutes": minutes }),
            )
            .await;
            assert_eq!(reply["error"], "invalid_argument", "minutes = {minutes}");
        }
        let reply = call(
            &fx,
            json!({ "command": "grant-bonus", "user": "nobody", "minutes": 30 }),
        )
        .await;
        assert_eq!(reply["error"], "invalid_argument");
    }

    #[tokio::test]
    async fn unknown_command_is_reported_as_such() {
        let fx = fixture();
        let reply = call(&fx, json!({ "command": "self-destruct" })).await;
        assert_eq!(reply, json!({ "error": "unknown_command" }));
        let reply = call(&fx, json!({ "no_command": true })).await;
        assert_eq!(reply, json!({ "error": "unknown_command" }));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_argument() {
        let fx = fixture();
        let reply = dispatch(&fx.ctx, b"{not json").await;
        assert_eq!(reply["error"], "invalid_argument");

        // Known command with wrong arguments
        let reply = call(&fx, json!({ "command": "get-quota" })).await;
        assert_eq!(reply["error"], "invalid_argument");
    }

    #[tokio::test]
    async fn invalid_reload_keeps_previous_policy() {
        let fx = fixture();
        std::fs::write(&fx.config_path, "users: [broken").unwrap();

        let reply = call(&fx, json!({ "command": "reload" })).await;
        assert_eq!(reply["error"], "invalid_argument");

        // The previous policy is still in force.
        let reply = call(&fx, json!({ "command": "get-quota", "user": "kid1" })).await;
        assert_eq!(reply["quota"], 60.0);
    }

    #[tokio::test]
    async fn reload_reports_changes() {
        let fx = fixture();
        let reply = call(&fx, json!({ "command": "reload" })).await;
        assert_eq!(reply["status"], "unchanged");

        std::fs::write(&fx.config_path, "users:\n  kid3: {}\n").unwrap();
        let reply = call(&fx, json!({ "command": "reload" })).await;
        assert_eq!(reply["status"], "reloaded");
        let reply = call(&fx, json!({ "command": "list-kids" })).await;
        assert_eq!(reply["kids"], json!(["kid3"]));
    }

    async fn send_frame(stream: &mut UnixStream, body: &[u8]) {
        stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(body).await.unwrap();
    }

    async fn read_reply(stream: &mut UnixStream) -> Value {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn connection_survives_oversized_and_malformed_frames() {
        let fx = fixture();
        let (mut client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(handle_connection(fx.ctx.clone(), server));

        // Oversized frame: drained, answered, connection stays up.
        let oversized = vec![b'x'; MAX_FRAME_BYTES as usize + 1];
        send_frame(&mut client, &oversized).await;
        let reply = read_reply(&mut client).await;
        assert_eq!(reply["error"], "invalid_argument");

        // Malformed frame: same story.
        send_frame(&mut client, b"!!!").await;
        let reply = read_reply(&mut client).await;
        assert_eq!(reply["error"], "invalid_argument");

        // And a well-formed request still succeeds afterwards.
        send_frame(&mut client, json!({ "command": "status" }).to_string().as_bytes()).await;
        let reply = read_reply(&mut client).await;
        assert_eq!(reply["version"], env!("CARGO_PKG_VERSION"));

        drop(client);
        task.await.unwrap();
    }
}
