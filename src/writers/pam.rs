use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::fs;
use crate::policy::PolicySnapshot;

/// Delimiters of the daemon-owned region. Everything between them belongs
/// to the daemon; everything outside is preserved byte-for-byte.
pub const BLOCK_BEGIN: &str = "# >>> guardian managed — do not edit >>>";
pub const BLOCK_END: &str = "# <<< guardian managed <<<";

const BACKUP_RETAIN: usize = 5;

/// Maintains the guardian-owned block in the PAM time-configuration file.
///
/// The block always opens with a rule permitting every account outside the
/// managed group at all times, so no configuration state can lock
/// unmanaged users (or the administrator) out of the machine.
pub struct PamWriter {
    path: PathBuf,
}

impl PamWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Regenerate the managed block for `policy` and commit it atomically.
    /// On any failure the previously committed file stays in place.
    pub fn apply(&self, policy: &PolicySnapshot) -> Result<()> {
        let rules = generate_rules(policy);
        for rule in &rules {
            if !valid_rule(rule) {
                bail!("generated PAM rule fails grammar check: {rule}");
            }
        }

        let (existing, had_file) = match std::fs::read_to_string(&self.path) {
            Ok(content) => (content, true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (String::new(), false),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        let updated = splice_block(&existing, &rules);
        if updated == existing {
            return Ok(());
        }

        // Stage, then rename, then record the backup. Until the rename
        // lands, neither the live file nor the backup set changes; a crash
        // anywhere in that window leaves only a stale temp file behind.
        let staged = fs::stage(&self.path, updated.as_bytes())
            .with_context(|| format!("failed to stage {}", self.path.display()))?;

        if let Err(commit_err) = staged.commit() {
            error!(
                component = "pam",
                path = %self.path.display(),
                error = %format!("{commit_err:#}"),
                "commit failed, previous rules remain in place"
            );
            return Err(commit_err);
        }

        if had_file {
            if let Err(e) = fs::record_backup(&self.path, existing.as_bytes(), BACKUP_RETAIN) {
                warn!(
                    component = "pam",
                    error = %format!("{e:#}"),
                    "failed to record backup of replaced rules"
                );
            }
        }

        info!(
            component = "pam",
            path = %self.path.display(),
            rules = rules.len(),
            "login-time rules committed"
        );
        Ok(())
    }
}

/// The rules inside the managed block, default permit first.
fn generate_rules(policy: &PolicySnapshot) -> Vec<String> {
    let mut rules = Vec::with_capacity(policy.users.len() + 1);
    // Accounts outside the managed group are never restricted.
    rules.push(format!("*;*;!@{};Al0000-2400", policy.managed_group));

    for (username, user_policy) in &policy.users {
        let windows = if user_policy.curfew.is_empty() {
            "Al0000-2400".to_string()
        } else {
            user_policy
                .curfew
                .iter()
                .map(|(day, window)| format!("{}{}", day.pam_code(), window.pam_range()))
                .collect::<Vec<_>>()
                .join(" & ")
        };
        rules.push(format!("*;*;{username};{windows}"));
    }
    rules
}

/// Grammar check for one emitted rule: three or four semicolon-separated
/// fields, the last being day-coded HHMM-HHMM ranges combined with
/// `&`, `|` and `!`.
fn valid_rule(rule: &str) -> bool {
    let fields: Vec<&str> = rule.split(';').collect();
    if fields.len() != 3 && fields.len() != 4 {
        return false;
    }
    if fields.iter().any(|f| f.is_empty()) {
        return false;
    }
    let times = fields.last().unwrap();
    times
        .split(['&', '|'])
        .map(str::trim)
        .all(|term| valid_time_term(term.trim_start_matches('!')))
}

fn valid_time_term(term: &str) -> bool {
    // One or more two-letter day codes followed by HHMM-HHMM.
    let bytes = term.as_bytes();
    let mut idx = 0;
    while idx + 1 < bytes.len() && bytes[idx].is_ascii_alphabetic() {
        if !bytes[idx + 1].is_ascii_alphabetic() {
            return false;
        }
        idx += 2;
        if idx >= bytes.len() || bytes[idx].is_ascii_digit() {
            break;
        }
    }
    if idx == 0 {
        return false;
    }
    let range = &term[idx..];
    let Some((start, end)) = range.split_once('-') else {
        return false;
    };
    valid_hhmm(start) && valid_hhmm(end)
}

fn valid_hhmm(s: &str) -> bool {
    if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let hours: u32 = s[..2].parse().unwrap_or(99);
    let minutes: u32 = s[2..].parse().unwrap_or(99);
    (hours < 24 || (hours == 24 && minutes == 0)) && minutes < 60
}

/// Replace (or append) the managed block, leaving all other lines intact.
fn splice_block(existing: &str, rules: &[String]) -> String {
    let mut head: Vec<&str> = Vec::new();
    let mut tail: Vec<&str> = Vec::new();
    let mut inside = false;
    let mut seen_block = false;

    for line in existing.lines() {
        if line == BLOCK_BEGIN {
            inside = true;
            seen_block = true;
            continue;
        }
        if line == BLOCK_END {
            inside = false;
            continue;
        }
        if inside {
            continue;
        }
        if seen_block {
            tail.push(line);
        } else {
            head.push(line);
        }
    }

    let mut out = String::new();
    for line in &head {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(BLOCK_BEGIN);
    out.push('\n');
    for rule in rules {
        out.push_str(rule);
        out.push('\n');
    }
    out.push_str(BLOCK_END);
    out.push('\n');
    for line in &tail {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build_snapshot;

    const CONFIG: &str = r#"
managed_group: "guardian-kids"
defaults:
  curfew: { weekdays: "08:00-20:00", saturday: "08:00-22:00", sunday: "09:00-20:00" }
users:
  kid1:
    curfew: { weekdays: "07:30-19:30" }
  kid2: {}
"#;

    fn snapshot() -> PolicySnapshot {
        build_snapshot(CONFIG).unwrap()
    }

    #[test]
    fn rules_start_with_default_permit() {
        let rules = generate_rules(&snapshot());
        assert_eq!(rules[0], "*;*;!@guardian-kids;Al0000-2400");
    }

    #[test]
    fn per_user_rules_encode_curfew_windows() {
        let rules = generate_rules(&snapshot());
        assert!(rules.contains(&"*;*;kid1;Wk0730-1930".to_string()));
        assert!(rules
            .contains(&"*;*;kid2;Sa0800-2200 & Su0900-2000 & Wk0800-2000".to_string()));
    }

    #[test]
    fn user_without_curfew_is_permitted_all_day() {
        let snapshot = build_snapshot("users:\n  kid3: {}\n").unwrap();
        let rules = generate_rules(&snapshot);
        assert!(rules.contains(&"*;*;kid3;Al0000-2400".to_string()));
    }

    #[test]
    fn no_rule_references_unmanaged_users() {
        let rules = generate_rules(&snapshot());
        for rule in &rules[1..] {
            let user = rule.split(';').nth(2).unwrap();
            assert!(user == "kid1" || user == "kid2", "unexpected rule: {rule}");
        }
    }

    #[test]
    fn generated_rules_pass_grammar_check() {
        for rule in generate_rules(&snapshot()) {
            assert!(valid_rule(&rule), "rule failed grammar: {rule}");
        }
    }

    #[test]
    fn grammar_rejects_malformed_rules() {
        assert!(!valid_rule("*;*;kid1"));
        assert!(!valid_rule("*;*;kid1;0800-2000"));
        assert!(!valid_rule("*;*;kid1;Wk2500-2600"));
        assert!(!valid_rule("*;*;kid1;Wk0800_2000"));
        assert!(!valid_rule(";;;"));
        assert!(valid_rule("*;*;!@guardian-kids;Al0000-2400"));
        assert!(valid_rule("login;*;kid1;Wk0800-2000 | Sa0900-2100"));
    }

    #[test]
    fn apply_preserves_foreign_lines_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.conf");
        let foreign = "# existing admin rules\nlogin;tty1;operator;Al0000-2400\n";
        std::fs::write(&path, foreign).unwrap();

        let writer = PamWriter::new(path.clone());
        writer.apply(&snapshot()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(foreign));
        assert_eq!(content.matches(BLOCK_BEGIN).count(), 1);
        assert_eq!(content.matches(BLOCK_END).count(), 1);
    }

    #[test]
    fn apply_is_idempotent_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.conf");
        std::fs::write(&path, "# keep me\n").unwrap();

        let writer = PamWriter::new(path.clone());
        writer.apply(&snapshot()).unwrap();
        let first = std::fs::read(&path).unwrap();
        let backups_after_first = fs::list_backups(&path).unwrap();

        writer.apply(&snapshot()).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);

        // The no-op rewrite did not create another backup.
        assert_eq!(fs::list_backups(&path).unwrap(), backups_after_first);
    }

    #[test]
    fn reapply_replaces_block_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.conf");
        std::fs::write(&path, "# head\n").unwrap();

        let writer = PamWriter::new(path.clone());
        writer.apply(&snapshot()).unwrap();

        // Lines after the block must survive a rewrite in place.
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("# appended by admin later\n");
        std::fs::write(&path, &content).unwrap();

        let reduced = build_snapshot("users:\n  kid1: {}\n").unwrap();
        writer.apply(&reduced).unwrap();

        let after = std::fs::read_to_string(&path).unwrap();
        assert!(after.starts_with("# head\n"));
        assert!(after.ends_with("# appended by admin later\n"));
        assert_eq!(after.matches(BLOCK_BEGIN).count(), 1);
        assert!(!after.contains("kid2"));
    }

    #[test]
    fn rewrite_keeps_backups_of_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.conf");
        std::fs::write(&path, "# original\n").unwrap();

        let writer = PamWriter::new(path.clone());
        writer.apply(&snapshot()).unwrap();
        let backups = fs::list_backups(&path).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&backups[0]).unwrap(),
            "# original\n"
        );
    }

    #[test]
    fn first_write_of_a_missing_file_records_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.conf");

        let writer = PamWriter::new(path.clone());
        writer.apply(&snapshot()).unwrap();

        assert!(path.exists());
        assert!(fs::list_backups(&path).unwrap().is_empty());
    }

    #[test]
    fn crash_between_stage_and_rename_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.conf");
        std::fs::write(&path, "# pristine\n").unwrap();
        let writer = PamWriter::new(path.clone());
        writer.apply(&snapshot()).unwrap();
        let committed = std::fs::read(&path).unwrap();
        let backups_before = fs::list_backups(&path).unwrap();

        // Simulate the daemon dying after the temp file is written but
        // before the rename: the staged write never commits and its
        // cleanup never runs.
        let staged = fs::stage(&path, b"# half-written rules\n").unwrap();
        std::mem::forget(staged);

        assert_eq!(std::fs::read(&path).unwrap(), committed);
        assert_eq!(fs::list_backups(&path).unwrap(), backups_before);

        // The next run replaces the stale temp file and commits normally.
        let reduced = build_snapshot("users:\n  kid1: {}\n").unwrap();
        writer.apply(&reduced).unwrap();
        let after = std::fs::read_to_string(&path).unwrap();
        assert!(after.contains("kid1"));
        assert!(!after.contains("half-written"));
    }

    #[test]
    fn failed_staging_leaves_file_and_backups_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.conf");
        std::fs::write(&path, "# pristine\n").unwrap();
        let writer = PamWriter::new(path.clone());
        writer.apply(&snapshot()).unwrap();
        let committed = std::fs::read(&path).unwrap();
        let backups_before = fs::list_backups(&path).unwrap();

        // Block the staging path: a directory squatting on the temp name
        // makes the temp-file write fail before any rename can happen.
        std::fs::create_dir(dir.path().join("time.conf.tmp")).unwrap();
        let reduced = build_snapshot("users:\n  kid9: {}\n").unwrap();
        let result = writer.apply(&reduced);

        assert!(result.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), committed);
        assert_eq!(fs::list_backups(&path).unwrap(), backups_before);
    }
}
