use anyhow::{bail, Result};
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Day selector for a curfew window, in the order rules are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DayKey {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
    Weekdays,
    Weekend,
}

impl DayKey {
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "monday" => Some(Self::Monday),
            "tuesday" => Some(Self::Tuesday),
            "wednesday" => Some(Self::Wednesday),
            "thursday" => Some(Self::Thursday),
            "friday" => Some(Self::Friday),
            "saturday" => Some(Self::Saturday),
            "sunday" => Some(Self::Sunday),
            "weekdays" => Some(Self::Weekdays),
            "weekend" => Some(Self::Weekend),
            _ => None,
        }
    }

    /// Day code used in PAM time.conf rules.
    pub fn pam_code(&self) -> &'static str {
        match self {
            Self::Monday => "Mo",
            Self::Tuesday => "Tu",
            Self::Wednesday => "We",
            Self::Thursday => "Th",
            Self::Friday => "Fr",
            Self::Saturday => "Sa",
            Self::Sunday => "Su",
            Self::Weekdays => "Wk",
            Self::Weekend => "Wd",
        }
    }

    /// Day selector used in systemd OnCalendar expressions.
    pub fn calendar_spec(&self) -> &'static str {
        match self {
            Self::Monday => "Mon",
            Self::Tuesday => "Tue",
            Self::Wednesday => "Wed",
            Self::Thursday => "Thu",
            Self::Friday => "Fri",
            Self::Saturday => "Sat",
            Self::Sunday => "Sun",
            Self::Weekdays => "Mon..Fri",
            Self::Weekend => "Sat,Sun",
        }
    }

    /// Whether this key covers the given weekday. Specific day keys take
    /// precedence over the weekdays/weekend groups at resolution time.
    pub fn covers(&self, day: Weekday) -> bool {
        match self {
            Self::Monday => day == Weekday::Mon,
            Self::Tuesday => day == Weekday::Tue,
            Self::Wednesday => day == Weekday::Wed,
            Self::Thursday => day == Weekday::Thu,
            Self::Friday => day == Weekday::Fri,
            Self::Saturday => day == Weekday::Sat,
            Self::Sunday => day == Weekday::Sun,
            Self::Weekdays => !matches!(day, Weekday::Sat | Weekday::Sun),
            Self::Weekend => matches!(day, Weekday::Sat | Weekday::Sun),
        }
    }

    fn is_group(&self) -> bool {
        matches!(self, Self::Weekdays | Self::Weekend)
    }
}

/// A wall-clock window within one day, `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Parse `HH:MM-HH:MM`; the start must precede the end.
    pub fn parse(s: &str) -> Result<Self> {
        let (start_s, end_s) = match s.split_once('-') {
            Some(parts) => parts,
            None => bail!("time window '{s}' is not of the form HH:MM-HH:MM"),
        };
        let start = parse_hhmm(start_s)?;
        let end = parse_hhmm(end_s)?;
        if start >= end {
            bail!("time window '{s}' must have start < end");
        }
        Ok(Self { start, end })
    }

    /// PAM time.conf range encoding, e.g. `0800-2000`.
    pub fn pam_range(&self) -> String {
        format!(
            "{}-{}",
            self.start.format("%H%M"),
            self.end.format("%H%M")
        )
    }
}

/// Parse a bare `HH:MM` time of day.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    match NaiveTime::parse_from_str(s.trim(), "%H:%M") {
        Ok(t) => Ok(t),
        Err(_) => bail!("'{s}' is not a valid HH:MM time"),
    }
}

/// Fully resolved per-user policy; overrides already merged over defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPolicy {
    pub daily_quota: Duration,
    pub curfew: BTreeMap<DayKey, TimeWindow>,
    /// Per-user grace override; `notifications.grace_period.duration`
    /// applies when unset.
    pub grace: Option<Duration>,
}

impl UserPolicy {
    /// The curfew window covering `day`, if any. A specific day key wins
    /// over the weekdays/weekend groups.
    pub fn curfew_for(&self, day: Weekday) -> Option<TimeWindow> {
        self.curfew
            .iter()
            .filter(|(k, _)| k.covers(day))
            .min_by_key(|(k, _)| k.is_group())
            .map(|(_, w)| *w)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GracePolicy {
    pub enabled: bool,
    pub duration: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPolicy {
    /// Warn thresholds in minutes remaining, strictly descending.
    pub pre_quota_minutes: Vec<u16>,
    pub grace: GracePolicy,
}

/// Immutable view over one accepted configuration. Published as a whole via
/// pointer swap; consumers hold the `Arc` for the duration of one operation.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub timezone: Tz,
    pub reset_time: NaiveTime,
    pub db_path: PathBuf,
    pub ipc_socket: PathBuf,
    pub ipc_admin_group: String,
    pub managed_group: String,
    pub pam_time_conf: PathBuf,
    pub systemd_unit_dir: PathBuf,
    pub reload_interval: Duration,
    pub notifications: NotificationPolicy,
    pub defaults: UserPolicy,
    pub users: BTreeMap<String, UserPolicy>,
    /// sha256 over the raw file content this snapshot was built from.
    pub content_hash: String,
}

impl PolicySnapshot {
    pub fn user(&self, username: &str) -> Option<&UserPolicy> {
        self.users.get(username)
    }

    pub fn is_managed(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn managed_users(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }
}
