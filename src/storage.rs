use rusqlite::{params, Connection, Transaction};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::policy::PolicySnapshot;

/// How long a caller waits for the serialized connection before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// In-place retry policy for transient SQLite busy/locked errors.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage is busy")]
    Busy,
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable form of a session row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub username: String,
    pub start_wall: i64,
    pub end_wall: Option<i64>,
    pub accumulated_seconds: f64,
    pub last_update_wall: i64,
    pub seat: Option<String>,
}

#[derive(Debug, Clone)]
struct Migration {
    version: u32,
    name: &'static str,
    up: fn(&Transaction) -> rusqlite::Result<()>,
}

fn migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        name: "initial_schema",
        up: |tx| {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT NOT NULL,
                    username TEXT NOT NULL,
                    start_wall INTEGER NOT NULL,
                    end_wall INTEGER,
                    accumulated_seconds REAL NOT NULL DEFAULT 0,
                    last_update_wall INTEGER NOT NULL,
                    seat TEXT,
                    PRIMARY KEY (id, start_wall)
                )",
                [],
            )?;
            tx.execute(
                "CREATE INDEX IF NOT EXISTS idx_sessions_username_start
                 ON sessions (username, start_wall)",
                [],
            )?;
            tx.execute(
                "CREATE TABLE IF NOT EXISTS bonuses (
                    username TEXT NOT NULL,
                    day_start_wall INTEGER NOT NULL,
                    seconds INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (username, day_start_wall)
                )",
                [],
            )?;
            tx.execute(
                "CREATE TABLE IF NOT EXISTS config_mirror (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                [],
            )?;
            tx.execute(
                "CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        },
    }]
}

fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let current = schema_version(conn)?;
    let pending: Vec<Migration> = migrations()
        .into_iter()
        .filter(|m| m.version > current)
        .collect();
    if pending.is_empty() {
        debug!("database schema is up to date");
        return Ok(());
    }

    // All pending migrations apply in one transaction: the schema either
    // reaches the target version or stays where it was.
    let tx = conn.transaction()?;
    let mut latest = current;
    for migration in &pending {
        info!(version = migration.version, name = migration.name, "applying schema migration");
        (migration.up)(&tx)?;
        latest = migration.version;
    }
    tx.execute(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![latest.to_string()],
    )?;
    tx.commit()
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// SQLite-backed store for sessions, bonuses, the mirrored configuration
/// view and daemon metadata.
///
/// One connection, serialized behind a mutex; callers that cannot acquire
/// it within the timeout see `StorageError::Busy` instead of hanging.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open the database, creating the file and schema as needed and
    /// applying any pending migrations.
    pub fn open_or_create(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&mut conn)?;
        info!(path = %path.display(), "storage opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection (bounded wait) and run `op`, retrying in
    /// place on transient busy errors.
    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let conn = tokio::time::timeout(LOCK_TIMEOUT, self.conn.lock())
            .await
            .map_err(|_| StorageError::Busy)?;

        let mut attempt = 0;
        loop {
            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, "storage busy, retrying");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) if is_busy(&e) => return Err(StorageError::Busy),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Insert a session row. Idempotent: a row with the same id and
    /// start_wall is left untouched.
    pub async fn insert_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sessions
                    (id, username, start_wall, end_wall, accumulated_seconds, last_update_wall, seat)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (id, start_wall) DO NOTHING",
                params![
                    record.id,
                    record.username,
                    record.start_wall,
                    record.end_wall,
                    record.accumulated_seconds,
                    record.last_update_wall,
                    record.seat,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Update the accumulated time of the open session with this id.
    /// Accumulated time never decreases, even if a confused caller hands
    /// in a smaller value after a clock anomaly.
    pub async fn update_session_progress(
        &self,
        session_id: &str,
        accumulated_seconds: f64,
        last_update_wall: i64,
    ) -> Result<(), StorageError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions
                 SET accumulated_seconds = CASE
                        WHEN ?2 > accumulated_seconds THEN ?2
                        ELSE accumulated_seconds
                     END,
                     last_update_wall = ?3
                 WHERE id = ?1 AND end_wall IS NULL",
                params![session_id, accumulated_seconds, last_update_wall],
            )?;
            if updated == 0 {
                warn!(session_id = %session_id, "progress update for unknown or closed session");
            }
            Ok(())
        })
        .await
    }

    /// Close the open session with this id.
    pub async fn close_session(
        &self,
        session_id: &str,
        end_wall: i64,
        accumulated_seconds: f64,
    ) -> Result<(), StorageError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET end_wall = ?2,
                     last_update_wall = ?2,
                     accumulated_seconds = CASE
                        WHEN ?3 > accumulated_seconds THEN ?3
                        ELSE accumulated_seconds
                     END
                 WHERE id = ?1 AND end_wall IS NULL",
                params![session_id, end_wall, accumulated_seconds],
            )?;
            Ok(())
        })
        .await
    }

    /// Sessions without an end time, for restart recovery.
    pub async fn list_open_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, start_wall, end_wall, accumulated_seconds,
                        last_update_wall, seat
                 FROM sessions WHERE end_wall IS NULL
                 ORDER BY start_wall",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect()
        })
        .await
    }

    /// Total usage seconds attributed to `[since_wall, until_wall)`.
    ///
    /// A session overlapping the window boundary contributes its
    /// accumulated time proportionally to the wall-clock overlap, so a
    /// session spanning a day reset splits across both days. Open sessions
    /// count up to their last recorded update.
    pub async fn sum_usage(
        &self,
        username: &str,
        since_wall: i64,
        until_wall: i64,
    ) -> Result<f64, StorageError> {
        let username = username.to_string();
        self.run(move |conn| {
            sum_usage_filtered(conn, &username, since_wall, until_wall, false)
        })
        .await
    }

    /// Like `sum_usage` but restricted to closed sessions. The tracker adds
    /// its own live view of open sessions on top of this.
    pub async fn sum_closed_usage(
        &self,
        username: &str,
        since_wall: i64,
        until_wall: i64,
    ) -> Result<f64, StorageError> {
        let username = username.to_string();
        self.run(move |conn| {
            sum_usage_filtered(conn, &username, since_wall, until_wall, true)
        })
        .await
    }

    /// Add bonus seconds to a user's budget for the day starting at
    /// `day_start_wall`. Bonuses accumulate within a day and do not carry
    /// over: the next day is keyed differently and starts at zero.
    pub async fn add_bonus(
        &self,
        username: &str,
        day_start_wall: i64,
        seconds: i64,
    ) -> Result<(), StorageError> {
        let username = username.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO bonuses (username, day_start_wall, seconds)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (username, day_start_wall)
                 DO UPDATE SET seconds = seconds + excluded.seconds",
                params![username, day_start_wall, seconds],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn bonus_seconds(
        &self,
        username: &str,
        day_start_wall: i64,
    ) -> Result<i64, StorageError> {
        let username = username.to_string();
        self.run(move |conn| {
            let seconds: Option<i64> = conn
                .query_row(
                    "SELECT seconds FROM bonuses WHERE username = ?1 AND day_start_wall = ?2",
                    params![username, day_start_wall],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            Ok(seconds.unwrap_or(0))
        })
        .await
    }

    /// Mirror the accepted configuration into the database in a single
    /// transaction so administrators can audit what the daemon last
    /// accepted. Replaces the previous mirror entirely.
    pub async fn sync_config(&self, snapshot: &PolicySnapshot) -> Result<(), StorageError> {
        let entries = mirror_entries(snapshot);
        self.run(move |conn| {
            // One implicit transaction over the whole replacement.
            conn.execute_batch("BEGIN")?;
            let result = (|| -> rusqlite::Result<()> {
                conn.execute("DELETE FROM config_mirror", [])?;
                let mut stmt =
                    conn.prepare("INSERT INTO config_mirror (key, value) VALUES (?1, ?2)")?;
                for (key, value) in &entries {
                    stmt.execute(params![key, value])?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn config_mirror_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT value FROM config_mirror WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
        .await
    }

    /// Wall timestamp of the last completed daily reset, if any.
    pub async fn last_reset_wall(&self) -> Result<Option<i64>, StorageError> {
        self.run(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'last_reset_wall'",
                    [],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            Ok(value.and_then(|v| v.parse().ok()))
        })
        .await
    }

    pub async fn set_last_reset_wall(&self, wall: i64) -> Result<(), StorageError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('last_reset_wall', ?1)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![wall.to_string()],
            )?;
            Ok(())
        })
        .await
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        start_wall: row.get(2)?,
        end_wall: row.get(3)?,
        accumulated_seconds: row.get(4)?,
        last_update_wall: row.get(5)?,
        seat: row.get(6)?,
    })
}

fn sum_usage_filtered(
    conn: &Connection,
    username: &str,
    since_wall: i64,
    until_wall: i64,
    closed_only: bool,
) -> rusqlite::Result<f64> {
    let mut stmt = conn.prepare(
        "SELECT start_wall, end_wall, accumulated_seconds, last_update_wall
         FROM sessions
         WHERE username = ?1 AND start_wall < ?3
           AND (end_wall IS NULL OR end_wall > ?2)",
    )?;
    let rows = stmt.query_map(params![username, since_wall, until_wall], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<i64>>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut total = 0.0;
    for row in rows {
        let (start, end, accumulated, last_update) = row?;
        if closed_only && end.is_none() {
            continue;
        }
        let effective_end = end.unwrap_or(last_update);
        total += attribute_overlap(start, effective_end, accumulated, since_wall, until_wall);
    }
    Ok(total)
}

/// Share of `accumulated` seconds falling inside `[since, until)`,
/// proportional to the wall-clock overlap of the session span.
fn attribute_overlap(start: i64, end: i64, accumulated: f64, since: i64, until: i64) -> f64 {
    let overlap = (end.min(until) - start.max(since)).max(0);
    if overlap == 0 {
        return 0.0;
    }
    let span = end - start;
    if span <= 0 {
        // Degenerate span but a recorded overlap means the session lived
        // inside the window; attribute everything.
        return accumulated;
    }
    accumulated * overlap as f64 / span as f64
}

fn mirror_entries(snapshot: &PolicySnapshot) -> Vec<(String, String)> {
    let mut entries = vec![
        ("timezone".to_string(), snapshot.timezone.to_string()),
        (
            "reset_time".to_string(),
            snapshot.reset_time.format("%H:%M").to_string(),
        ),
        ("content_hash".to_string(), snapshot.content_hash.clone()),
        (
            "defaults".to_string(),
            user_policy_json(&snapshot.defaults),
        ),
    ];
    for (username, policy) in &snapshot.users {
        entries.push((format!("user.{username}"), user_policy_json(policy)));
    }
    entries
}

fn user_policy_json(policy: &crate::policy::UserPolicy) -> String {
    let curfew: serde_json::Map<String, serde_json::Value> = policy
        .curfew
        .iter()
        .map(|(day, window)| {
            (
                format!("{day:?}").to_lowercase(),
                serde_json::Value::String(format!(
                    "{}-{}",
                    window.start.format("%H:%M"),
                    window.end.format("%H:%M")
                )),
            )
        })
        .collect();
    serde_json::json!({
        "daily_quota_minutes": policy.daily_quota.as_secs() / 60,
        "grace_minutes": policy.grace.map(|g| g.as_secs() / 60),
        "curfew": curfew,
    })
    .to_string()
}
