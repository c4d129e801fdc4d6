use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::fs;
use crate::policy::PolicySnapshot;

const UNIT_PREFIX: &str = "guardian-";
const DAILY_RESET: &str = "guardian-daily-reset";
const CURFEW_TEMPLATE: &str = "guardian-curfew@.service";

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin seam over systemctl so reconciliation is testable without an init
/// system.
pub trait SystemdControl: Send + Sync {
    fn daemon_reload(&self) -> impl Future<Output = Result<()>> + Send;
    fn enable_now(&self, unit: &str) -> impl Future<Output = Result<()>> + Send;
    fn disable_now(&self, unit: &str) -> impl Future<Output = Result<()>> + Send;
    fn stop(&self, unit: &str) -> impl Future<Output = Result<()>> + Send;
    fn unit_state(&self, unit: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Real control plane: shells out to systemctl with a hard timeout per
/// invocation so a wedged init manager cannot stall the daemon.
pub struct Systemctl;

impl Systemctl {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let invocation = async {
            tokio::process::Command::new("systemctl")
                .args(args)
                .output()
                .await
        };
        let output = tokio::time::timeout(SYSTEMCTL_TIMEOUT, invocation)
            .await
            .map_err(|_| anyhow::anyhow!("systemctl {args:?} timed out"))?
            .with_context(|| format!("failed to spawn systemctl {args:?}"))?;
        if !output.status.success() {
            bail!(
                "systemctl {args:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl SystemdControl for Systemctl {
    async fn daemon_reload(&self) -> Result<()> {
        self.run(&["daemon-reload"]).await.map(|_| ())
    }

    async fn enable_now(&self, unit: &str) -> Result<()> {
        self.run(&["enable", "--now", unit]).await.map(|_| ())
    }

    async fn disable_now(&self, unit: &str) -> Result<()> {
        self.run(&["disable", "--now", unit]).await.map(|_| ())
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.run(&["stop", unit]).await.map(|_| ())
    }

    async fn unit_state(&self, unit: &str) -> Result<String> {
        // is-enabled exits nonzero for disabled units; the state name is
        // still on stdout, so degrade gracefully.
        match self.run(&["is-enabled", unit]).await {
            Ok(state) => Ok(state),
            Err(_) => Ok("disabled".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerStatus {
    pub unit: String,
    pub state: String,
}

/// Reconciles the on-disk guardian units with the desired set derived from
/// policy: the daily reset timer plus one curfew-end timer per managed
/// user with a curfew.
pub struct SystemdWriter<C: SystemdControl> {
    unit_dir: PathBuf,
    control: C,
}

impl<C: SystemdControl> SystemdWriter<C> {
    pub fn new(unit_dir: PathBuf, control: C) -> Self {
        Self { unit_dir, control }
    }

    /// Bring the unit directory in line with `policy`. Individual unit
    /// failures are logged and skipped; one broken user never blocks the
    /// rest.
    pub async fn reconcile(&self, policy: &PolicySnapshot) -> Result<()> {
        fs::ensure_directory(&self.unit_dir)?;
        let desired = desired_units(policy);

        let mut changed: Vec<String> = Vec::new();
        for (name, content) in &desired {
            let path = self.unit_dir.join(name);
            let current = std::fs::read_to_string(&path).unwrap_or_default();
            if &current == content {
                continue;
            }
            match fs::atomic_write(&path, content.as_bytes()) {
                Ok(()) => changed.push(name.clone()),
                Err(e) => {
                    warn!(
                        component = "systemd",
                        unit = %name,
                        error = %format!("{e:#}"),
                        "unit write failed, skipping"
                    );
                }
            }
        }

        let stale: Vec<String> = self
            .present_units()?
            .into_iter()
            .filter(|name| !desired.contains_key(name))
            .collect();

        for name in &stale {
            if let Err(e) = self.control.stop(name).await {
                warn!(component = "systemd", unit = %name, error = %format!("{e:#}"), "stop failed");
            }
            if let Err(e) = self.control.disable_now(name).await {
                warn!(component = "systemd", unit = %name, error = %format!("{e:#}"), "disable failed");
            }
            if let Err(e) = std::fs::remove_file(self.unit_dir.join(name)) {
                warn!(component = "systemd", unit = %name, error = %e, "unit removal failed");
                continue;
            }
            info!(component = "systemd", unit = %name, "stale unit removed");
        }

        if changed.is_empty() && stale.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.control.daemon_reload().await {
            warn!(component = "systemd", error = %format!("{e:#}"), "daemon-reload failed");
        }
        for name in &changed {
            if !name.ends_with(".timer") {
                continue;
            }
            match self.control.enable_now(name).await {
                Ok(()) => info!(component = "systemd", unit = %name, "timer enabled"),
                Err(e) => {
                    warn!(
                        component = "systemd",
                        unit = %name,
                        error = %format!("{e:#}"),
                        "enable failed, skipping unit"
                    );
                }
            }
        }
        Ok(())
    }

    /// Guardian-owned unit files currently on disk.
    fn present_units(&self) -> Result<Vec<String>> {
        let mut units = Vec::new();
        let entries = std::fs::read_dir(&self.unit_dir)
            .with_context(|| format!("failed to read {}", self.unit_dir.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(UNIT_PREFIX)
                && (name.ends_with(".service") || name.ends_with(".timer"))
            {
                units.push(name);
            }
        }
        units.sort();
        Ok(units)
    }

    /// Managed timers with their enablement state, for the admin IPC.
    pub async fn list_timers(&self) -> Result<Vec<TimerStatus>> {
        let mut timers = Vec::new();
        for unit in self.present_units()? {
            if !unit.ends_with(".timer") {
                continue;
            }
            let state = self
                .control
                .unit_state(&unit)
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            timers.push(TimerStatus { unit, state });
        }
        Ok(timers)
    }
}

/// The desired unit set for a policy snapshot.
fn desired_units(policy: &PolicySnapshot) -> BTreeMap<String, String> {
    let mut units = BTreeMap::new();

    let reset = policy.reset_time.format("%H:%M").to_string();
    units.insert(
        format!("{DAILY_RESET}.service"),
        "[Unit]\n\
         Description=Guardian daily quota reset\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart=/usr/bin/guardianctl reload\n"
            .to_string(),
    );
    units.insert(
        format!("{DAILY_RESET}.timer"),
        format!(
            "[Unit]\n\
             Description=Guardian daily quota reset timer\n\
             \n\
             [Timer]\n\
             OnCalendar=*-*-* {reset}:00\n\
             Persistent=true\n\
             \n\
             [Install]\n\
             WantedBy=timers.target\n"
        ),
    );

    let mut any_curfew = false;
    for (username, user_policy) in &policy.users {
        if user_policy.curfew.is_empty() {
            continue;
        }
        any_curfew = true;

        let mut calendars = String::new();
        for (day, window) in &user_policy.curfew {
            calendars.push_str(&format!(
                "OnCalendar={} {}:00\n",
                day.calendar_spec(),
                window.end.format("%H:%M")
            ));
        }
        units.insert(
            format!("guardian-curfew@{username}.timer"),
            format!(
                "[Unit]\n\
                 Description=Guardian curfew cutoff for {username}\n\
                 \n\
                 [Timer]\n\
                 {calendars}\
                 \n\
                 [Install]\n\
                 WantedBy=timers.target\n"
            ),
        );
    }

    if any_curfew {
        units.insert(
            CURFEW_TEMPLATE.to_string(),
            "[Unit]\n\
             Description=Guardian curfew cutoff for %i\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             ExecStart=/usr/bin/loginctl terminate-user %i\n"
                .to_string(),
        );
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build_snapshot;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<String>>,
        fail_enable_for: Option<String>,
    }

    impl RecordingControl {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl SystemdControl for &RecordingControl {
        async fn daemon_reload(&self) -> Result<()> {
            self.record("daemon-reload".to_string());
            Ok(())
        }

        async fn enable_now(&self, unit: &str) -> Result<()> {
            self.record(format!("enable {unit}"));
            if self.fail_enable_for.as_deref() == Some(unit) {
                bail!("simulated enable failure");
            }
            Ok(())
        }

        async fn disable_now(&self, unit: &str) -> Result<()> {
            self.record(format!("disable {unit}"));
            Ok(())
        }

        async fn stop(&self, unit: &str) -> Result<()> {
            self.record(format!("stop {unit}"));
            Ok(())
        }

        async fn unit_state(&self, _unit: &str) -> Result<String> {
            Ok("enabled".to_string())
        }
    }

    const CONFIG: &str = r#"
reset_time: "03:00"
defaults:
  curfew: { weekdays: "08:00-20:00", sunday: "09:00-20:00" }
users:
  kid1:
    curfew: { weekdays: "07:30-19:30" }
  kid2: {}
"#;

    #[test]
    fn desired_set_covers_reset_and_curfews() {
        let units = desired_units(&build_snapshot(CONFIG).unwrap());
        assert!(units.contains_key("guardian-daily-reset.service"));
        assert!(units.contains_key("guardian-daily-reset.timer"));
        assert!(units.contains_key("guardian-curfew@.service"));
        assert!(units.contains_key("guardian-curfew@kid1.timer"));
        assert!(units.contains_key("guardian-curfew@kid2.timer"));
    }

    #[test]
    fn reset_timer_is_persistent_and_fires_at_reset_time() {
        let units = desired_units(&build_snapshot(CONFIG).unwrap());
        let timer = &units["guardian-daily-reset.timer"];
        assert!(timer.contains("OnCalendar=*-*-* 03:00:00"));
        assert!(timer.contains("Persistent=true"));
    }

    #[test]
    fn curfew_timer_fires_at_window_end_per_day() {
        let units = desired_units(&build_snapshot(CONFIG).unwrap());
        let kid1 = &units["guardian-curfew@kid1.timer"];
        assert!(kid1.contains("OnCalendar=Mon..Fri 19:30:00"));

        let kid2 = &units["guardian-curfew@kid2.timer"];
        assert!(kid2.contains("OnCalendar=Mon..Fri 20:00:00"));
        assert!(kid2.contains("OnCalendar=Sun 20:00:00"));
    }

    #[test]
    fn users_without_curfew_get_no_timer() {
        let units = desired_units(&build_snapshot("users:\n  kid3: {}\n").unwrap());
        assert!(!units.keys().any(|k| k.contains("kid3")));
        // No curfews at all: the template is not emitted either.
        assert!(!units.contains_key("guardian-curfew@.service"));
    }

    #[test]
    fn no_unit_references_unmanaged_users() {
        let units = desired_units(&build_snapshot(CONFIG).unwrap());
        for name in units.keys() {
            if let Some(instance) = name
                .strip_prefix("guardian-curfew@")
                .and_then(|n| n.strip_suffix(".timer"))
            {
                assert!(instance == "kid1" || instance == "kid2");
            }
        }
    }

    #[tokio::test]
    async fn reconcile_writes_units_and_enables_timers() {
        let dir = tempfile::tempdir().unwrap();
        let control = RecordingControl::default();
        let writer = SystemdWriter::new(dir.path().to_path_buf(), &control);

        writer
            .reconcile(&build_snapshot(CONFIG).unwrap())
            .await
            .unwrap();

        assert!(dir.path().join("guardian-daily-reset.timer").exists());
        assert!(dir.path().join("guardian-curfew@kid1.timer").exists());
        let calls = control.calls();
        assert!(calls.contains(&"daemon-reload".to_string()));
        assert!(calls.contains(&"enable guardian-daily-reset.timer".to_string()));
        assert!(calls.contains(&"enable guardian-curfew@kid1.timer".to_string()));
        // Service units are written but not enabled directly.
        assert!(!calls.iter().any(|c| c.contains("enable guardian-daily-reset.service")));
    }

    #[tokio::test]
    async fn reconcile_twice_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let control = RecordingControl::default();
        let writer = SystemdWriter::new(dir.path().to_path_buf(), &control);
        let policy = build_snapshot(CONFIG).unwrap();

        writer.reconcile(&policy).await.unwrap();
        let first_calls = control.calls().len();

        writer.reconcile(&policy).await.unwrap();
        assert_eq!(control.calls().len(), first_calls);
    }

    #[tokio::test]
    async fn removed_user_units_are_stopped_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let control = RecordingControl::default();
        let writer = SystemdWriter::new(dir.path().to_path_buf(), &control);

        writer
            .reconcile(&build_snapshot(CONFIG).unwrap())
            .await
            .unwrap();
        assert!(dir.path().join("guardian-curfew@kid2.timer").exists());

        let reduced = build_snapshot(
            "users:\n  kid1:\n    curfew: { weekdays: \"07:30-19:30\" }\n",
        )
        .unwrap();
        writer.reconcile(&reduced).await.unwrap();

        assert!(!dir.path().join("guardian-curfew@kid2.timer").exists());
        let calls = control.calls();
        assert!(calls.contains(&"stop guardian-curfew@kid2.timer".to_string()));
        assert!(calls.contains(&"disable guardian-curfew@kid2.timer".to_string()));
        assert!(dir.path().join("guardian-curfew@kid1.timer").exists());
    }

    #[tokio::test]
    async fn foreign_unit_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sshd.service"), "[Unit]\n").unwrap();
        let control = RecordingControl::default();
        let writer = SystemdWriter::new(dir.path().to_path_buf(), &control);

        writer
            .reconcile(&build_snapshot("users: {}\n").unwrap())
            .await
            .unwrap();
        assert!(dir.path().join("sshd.service").exists());
    }

    #[tokio::test]
    async fn one_failing_unit_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let control = RecordingControl {
            fail_enable_for: Some("guardian-curfew@kid1.timer".to_string()),
            ..Default::default()
        };
        let writer = SystemdWriter::new(dir.path().to_path_buf(), &control);

        writer
            .reconcile(&build_snapshot(CONFIG).unwrap())
            .await
            .unwrap();

        // kid1's enable failed but kid2's timer still went through.
        let calls = control.calls();
        assert!(calls.contains(&"enable guardian-curfew@kid2.timer".to_string()));
        assert!(dir.path().join("guardian-curfew@kid2.timer").exists());
    }

    #[tokio::test]
    async fn list_timers_reports_guardian_timers_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foreign.timer"), "[Timer]\n").unwrap();
        let control = RecordingControl::default();
        let writer = SystemdWriter::new(dir.path().to_path_buf(), &control);
        writer
            .reconcile(&build_snapshot(CONFIG).unwrap())
            .await
            .unwrap();

        let timers = writer.list_timers().await.unwrap();
        let names: Vec<&str> = timers.iter().map(|t| t.unit.as_str()).collect();
        assert!(names.contains(&"guardian-daily-reset.timer"));
        assert!(names.contains(&"guardian-curfew@kid1.timer"));
        assert!(!names.contains(&"foreign.timer"));
        assert!(timers.iter().all(|t| t.state == "enabled"));
    }
}
