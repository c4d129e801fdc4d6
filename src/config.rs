use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::policy::{
    parse_hhmm, DayKey, GracePolicy, NotificationPolicy, PolicySnapshot, TimeWindow, UserPolicy,
};

/// System-wide configuration location; `GUARDIAN_DAEMON_CONFIG` or an
/// explicit `--config` flag take precedence.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/guardian/daemon/config.yaml";

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Raw on-disk representation. Everything is optional with defaults so a
/// minimal file stays valid; validation happens after deserialization.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_timezone")]
    timezone: String,

    #[serde(default = "default_reset_time")]
    reset_time: String,

    #[serde(default = "default_db_path")]
    db_path: PathBuf,

    #[serde(default = "default_ipc_socket")]
    ipc_socket: PathBuf,

    #[serde(default = "default_ipc_admin_group")]
    ipc_admin_group: String,

    #[serde(default = "default_managed_group")]
    managed_group: String,

    #[serde(default = "default_pam_time_conf")]
    pam_time_conf: PathBuf,

    #[serde(default = "default_systemd_unit_dir")]
    systemd_unit_dir: PathBuf,

    #[serde(default = "default_reload_interval")]
    reload_interval_seconds: u64,

    #[serde(default)]
    notifications: RawNotifications,

    #[serde(default)]
    defaults: RawUserPolicy,

    #[serde(default)]
    users: BTreeMap<String, RawUserPolicy>,

    /// Unknown top-level keys are collected and warned about, never fatal.
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_reset_time() -> String {
    "03:00".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/guardian/guardian.sqlite")
}

fn default_ipc_socket() -> PathBuf {
    PathBuf::from("/run/guardian-daemon.sock")
}

fn default_ipc_admin_group() -> String {
    "guardian-admin".to_string()
}

fn default_managed_group() -> String {
    "guardian-kids".to_string()
}

fn default_pam_time_conf() -> PathBuf {
    PathBuf::from("/etc/security/time.conf")
}

fn default_systemd_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_reload_interval() -> u64 {
    DEFAULT_RELOAD_INTERVAL.as_secs()
}

#[derive(Debug, Default, Deserialize)]
struct RawUserPolicy {
    daily_quota_minutes: Option<u32>,
    curfew: Option<BTreeMap<String, String>>,
    grace_minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawNotifications {
    #[serde(default = "default_pre_quota_minutes")]
    pre_quota_minutes: Vec<u16>,

    #[serde(default)]
    grace_period: RawGracePeriod,
}

impl Default for RawNotifications {
    fn default() -> Self {
        Self {
            pre_quota_minutes: default_pre_quota_minutes(),
            grace_period: RawGracePeriod::default(),
        }
    }
}

fn default_pre_quota_minutes() -> Vec<u16> {
    vec![15, 10, 5]
}

#[derive(Debug, Deserialize)]
struct RawGracePeriod {
    #[serde(default = "default_true")]
    enabled: bool,

    /// Minutes of grace after the quota is exhausted.
    #[serde(default = "default_grace_duration")]
    duration: u32,

    /// Minutes between reminders during grace.
    #[serde(default = "default_grace_interval")]
    interval: u32,
}

impl Default for RawGracePeriod {
    fn default() -> Self {
        Self {
            enabled: true,
            duration: default_grace_duration(),
            interval: default_grace_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_grace_duration() -> u32 {
    5
}

fn default_grace_interval() -> u32 {
    1
}

const FALLBACK_QUOTA_MINUTES: u32 = 90;

/// Usernames must be safe to embed in PAM rules, unit names and shell
/// arguments: `^[a-z_][a-z0-9_-]{0,31}$`.
pub fn valid_username(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 32 {
        return false;
    }
    let first_ok = bytes[0].is_ascii_lowercase() || bytes[0] == b'_';
    first_ok
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_' || *b == b'-')
}

fn parse_curfew(
    raw: &BTreeMap<String, String>,
    owner: &str,
) -> Result<BTreeMap<DayKey, TimeWindow>, ConfigError> {
    let mut curfew = BTreeMap::new();
    for (key, value) in raw {
        let day = DayKey::parse(key).ok_or_else(|| {
            ConfigError::Validation(format!("{owner}: unknown curfew day key '{key}'"))
        })?;
        let window = TimeWindow::parse(value)
            .map_err(|e| ConfigError::Validation(format!("{owner}: curfew '{key}': {e}")))?;
        curfew.insert(day, window);
    }
    Ok(curfew)
}

fn resolve_user(
    raw: &RawUserPolicy,
    defaults: &UserPolicy,
    owner: &str,
) -> Result<UserPolicy, ConfigError> {
    let daily_quota = match raw.daily_quota_minutes {
        Some(minutes) => Duration::from_secs(u64::from(minutes) * 60),
        None => defaults.daily_quota,
    };
    // Grace stays optional through resolution: a user (or the defaults
    // section) may override it, otherwise the notifications grace duration
    // applies at enforcement time.
    let grace = raw
        .grace_minutes
        .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
        .or(defaults.grace);
    let curfew = match &raw.curfew {
        Some(map) => parse_curfew(map, owner)?,
        None => defaults.curfew.clone(),
    };
    Ok(UserPolicy {
        daily_quota,
        curfew,
        grace,
    })
}

/// Parse and validate raw file content into a snapshot. The returned
/// snapshot is complete and internally consistent or this fails.
pub fn build_snapshot(content: &str) -> Result<PolicySnapshot, ConfigError> {
    let raw: RawConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

    for key in raw.unknown.keys() {
        warn!(key = %key, "ignoring unknown configuration key");
    }

    let timezone: chrono_tz::Tz = raw
        .timezone
        .parse()
        .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", raw.timezone)))?;

    let reset_time = parse_hhmm(&raw.reset_time)
        .map_err(|e| ConfigError::Validation(format!("reset_time: {e}")))?;

    let mut pre_quota_minutes = raw.notifications.pre_quota_minutes.clone();
    pre_quota_minutes.sort_unstable_by(|a, b| b.cmp(a));
    pre_quota_minutes.dedup();

    let grace_period = &raw.notifications.grace_period;
    let notifications = NotificationPolicy {
        pre_quota_minutes,
        grace: GracePolicy {
            enabled: grace_period.enabled,
            duration: Duration::from_secs(u64::from(grace_period.duration) * 60),
            interval: Duration::from_secs(u64::from(grace_period.interval) * 60)
                .max(Duration::from_secs(1)),
        },
    };

    let fallback = UserPolicy {
        daily_quota: Duration::from_secs(u64::from(FALLBACK_QUOTA_MINUTES) * 60),
        curfew: BTreeMap::new(),
        grace: None,
    };
    let defaults = resolve_user(&raw.defaults, &fallback, "defaults")?;

    let mut users = BTreeMap::new();
    for (username, raw_user) in &raw.users {
        if !valid_username(username) {
            return Err(ConfigError::Validation(format!(
                "invalid username '{username}' (must match ^[a-z_][a-z0-9_-]{{0,31}}$)"
            )));
        }
        let resolved = resolve_user(raw_user, &defaults, username)?;
        users.insert(username.clone(), resolved);
    }

    Ok(PolicySnapshot {
        timezone,
        reset_time,
        db_path: raw.db_path,
        ipc_socket: raw.ipc_socket,
        ipc_admin_group: raw.ipc_admin_group,
        managed_group: raw.managed_group,
        pam_time_conf: raw.pam_time_conf,
        systemd_unit_dir: raw.systemd_unit_dir,
        reload_interval: Duration::from_secs(raw.reload_interval_seconds.max(1)),
        notifications,
        defaults,
        users,
        content_hash: content_hash(content),
    })
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

type Subscriber = Box<dyn Fn(Arc<PolicySnapshot>) + Send + Sync>;

/// Loads the configuration file and republishes snapshots on change.
///
/// The accepted snapshot is swapped atomically; a failed reload never
/// replaces it. Subscribers run in registration order after each publish.
pub struct ConfigLoader {
    path: PathBuf,
    current: RwLock<Arc<PolicySnapshot>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ConfigLoader {
    /// Resolve the configuration path: explicit flag, then environment,
    /// then the system-wide default.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        if let Some(path) = explicit {
            return path;
        }
        if let Ok(env_path) = std::env::var("GUARDIAN_DAEMON_CONFIG") {
            if !env_path.is_empty() {
                return PathBuf::from(env_path);
            }
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load the initial snapshot. Startup fails on an unreadable or
    /// invalid file; once running, failures keep the prior snapshot.
    pub fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let snapshot = build_snapshot(&content)?;
        info!(path = %path.display(), users = snapshot.users.len(), "configuration loaded");
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(snapshot)),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.current.read().expect("config lock poisoned").clone()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Arc<PolicySnapshot>) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(Box::new(callback));
    }

    /// Re-read the file. Returns Ok(true) if a new snapshot was published,
    /// Ok(false) if the content was unchanged. On error the previously
    /// accepted snapshot remains in force.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        if content_hash(&content) == self.current().content_hash {
            return Ok(false);
        }

        let snapshot = Arc::new(build_snapshot(&content)?);
        {
            let mut current = self.current.write().expect("config lock poisoned");
            *current = snapshot.clone();
        }
        info!(users = snapshot.users.len(), "configuration reloaded");

        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for subscriber in subscribers.iter() {
            subscriber(snapshot.clone());
        }
        Ok(true)
    }
}
