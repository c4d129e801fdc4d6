use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// A fully written temporary sibling, one rename away from being live.
/// Dropping it uncommitted removes the temporary file.
pub struct StagedWrite {
    temp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    /// Atomically move the staged content over the target.
    pub fn commit(mut self) -> Result<()> {
        std::fs::rename(&self.temp_path, &self.target).with_context(|| {
            format!(
                "failed to rename {} to {}",
                self.temp_path.display(),
                self.target.display()
            )
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Write `content` to a temporary sibling of `path` in the same directory,
/// carrying over the mode and ownership of the existing file (if any) and
/// syncing to disk. The target is untouched until the result is committed.
pub fn stage(path: &Path, content: &[u8]) -> Result<StagedWrite> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let temp_path = sibling_temp_path(path);
    let existing = std::fs::metadata(path).ok();

    {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("failed to create temporary file {}", temp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;

        if let Some(meta) = &existing {
            file.set_permissions(std::fs::Permissions::from_mode(meta.mode() & 0o7777))
                .with_context(|| format!("failed to set mode on {}", temp_path.display()))?;
        }

        file.sync_all()
            .with_context(|| format!("failed to sync {}", temp_path.display()))?;
    }

    if let Some(meta) = &existing {
        chown(&temp_path, meta.uid(), meta.gid())
            .with_context(|| format!("failed to set ownership on {}", temp_path.display()))?;
    }

    Ok(StagedWrite {
        temp_path,
        target: path.to_path_buf(),
        committed: false,
    })
}

/// Atomically replace `path` with `content`. Readers only ever observe the
/// previous or the new content.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    stage(path, content)?.commit()
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| ".guardian".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn chown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory {}", path.display()))?;
    }
    Ok(())
}

/// Record `previous` as a timestamped `.bak` sibling of `path` and prune
/// old backups so at most `retain` remain. Callers hand in the replaced
/// content themselves, so nothing is written until the replacement is
/// already live.
pub fn record_backup(path: &Path, previous: &[u8], retain: usize) -> Result<PathBuf> {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();
    let backup = path.with_file_name(format!("{file_name}.guardian-{stamp}.bak"));
    std::fs::write(&backup, previous)
        .with_context(|| format!("failed to write backup {}", backup.display()))?;
    if let Ok(meta) = std::fs::metadata(path) {
        let _ = std::fs::set_permissions(
            &backup,
            std::fs::Permissions::from_mode(meta.mode() & 0o7777),
        );
    }

    prune_backups(path, retain)?;
    Ok(backup)
}

/// The backups of `path`, oldest first.
pub fn list_backups(path: &Path) -> Result<Vec<PathBuf>> {
    let dir = match path.parent() {
        Some(d) if d.as_os_str().is_empty() => Path::new("."),
        Some(d) => d,
        None => Path::new("."),
    };
    let prefix = format!(
        "{}.guardian-",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file")
    );

    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".bak"))
                .unwrap_or(false)
        })
        .collect();
    backups.sort();
    Ok(backups)
}

fn prune_backups(path: &Path, retain: usize) -> Result<()> {
    let backups = list_backups(path)?;
    if backups.len() > retain {
        for stale in &backups[..backups.len() - retain] {
            std::fs::remove_file(stale)
                .with_context(|| format!("failed to remove stale backup {}", stale.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn read(path: &Path) -> Vec<u8> {
        let mut buf = Vec::new();
        File::open(path).unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn atomic_write_creates_and_replaces() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rules.conf");

        atomic_write(&target, b"first").unwrap();
        assert_eq!(read(&target), b"first");

        atomic_write(&target, b"second").unwrap();
        assert_eq!(read(&target), b"second");
    }

    #[test]
    fn atomic_write_preserves_mode() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rules.conf");
        atomic_write(&target, b"x").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o640)).unwrap();

        atomic_write(&target, b"y").unwrap();
        let mode = std::fs::metadata(&target).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rules.conf");
        atomic_write(&target, b"x").unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn uncommitted_stage_leaves_target_and_cleans_up() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rules.conf");
        atomic_write(&target, b"live").unwrap();

        let staged = stage(&target, b"next").unwrap();
        drop(staged);

        assert_eq!(read(&target), b"live");
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn backup_records_previous_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rules.conf");
        atomic_write(&target, b"new").unwrap();

        let backup = record_backup(&target, b"old", 5).unwrap();
        assert_eq!(read(&backup), b"old");
        assert_eq!(read(&target), b"new");
        assert_eq!(list_backups(&target).unwrap(), vec![backup]);
    }

    #[test]
    fn backup_rotation_retains_newest() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rules.conf");
        atomic_write(&target, b"live").unwrap();

        for i in 0..4 {
            // Names within the same wall-clock second coalesce, which only
            // reduces the count further.
            record_backup(&target, format!("v{i}").as_bytes(), 2).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1100));
        }

        let backups = list_backups(&target).unwrap();
        assert!(backups.len() <= 2, "expected at most 2 backups, got {backups:?}");
    }
}
