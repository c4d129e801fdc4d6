/// Session observation and usage accounting.
///
/// `login_source` turns systemd-logind signals into a stream of
/// `SessionEvent`s; `tracker` folds that stream into per-user usage for the
/// current day and keeps storage in sync.
pub mod login_source;
pub mod tracker;

pub use login_source::LoginSource;
pub use tracker::{SessionTracker, TrackerNotice};

/// One session as reported by a ground-truth resync snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncSession {
    pub id: String,
    pub username: String,
    pub uid: u32,
    pub seat: Option<String>,
    pub locked: bool,
}

/// Events emitted by the login source, already filtered to managed users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    New {
        id: String,
        username: String,
        uid: u32,
        seat: Option<String>,
    },
    Removed {
        id: String,
    },
    Locked {
        id: String,
    },
    Unlocked {
        id: String,
    },
    /// Ground-truth snapshot of all current sessions, emitted after every
    /// successful (re)connect. Consumers reconcile their view against it:
    /// close what it lacks, adopt what it adds.
    Resync {
        sessions: Vec<ResyncSession>,
    },
}
