use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use backup_meta_core::{BackupRecord, Catalog, ObservedBackup, Snapshot};
use tracing::{debug, info, warn};

mod log_dates;
mod size;

pub use log_dates::{extract_dates, LogDates, LogParseError};
pub use size::backup_size;

pub const DEFAULT_LOG_FILE_NAME: &str = "raspiBackup.log";
pub const DEFAULT_FLAG_FILE_NAME: &str = "raspiBackup.log";

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Directory holding one folder per device.
    pub root: PathBuf,
    /// Log inside each backup folder that carries the start and end dates.
    pub log_file_name: String,
    /// File whose presence marks a folder as a finished backup.
    pub flag_file_name: String,
    /// Trust records that are already valid instead of re-reading their logs.
    pub reuse_valid: bool,
}

impl ScanConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            log_file_name: DEFAULT_LOG_FILE_NAME.to_owned(),
            flag_file_name: DEFAULT_FLAG_FILE_NAME.to_owned(),
            reuse_valid: false,
        }
    }
}

/// Walks `root/<device>/<backup>` and builds a snapshot of what is on disk.
#[derive(Debug, Clone)]
pub struct Scanner {
    config: ScanConfig,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scans every device under the root. `existing` is only consulted when
    /// `reuse_valid` is set.
    ///
    /// Only an unreadable root fails the scan. Devices and backups that
    /// cannot be read are logged and left out, so the merge marks their
    /// records invalid.
    pub fn scan(&self, existing: &Catalog) -> Result<Snapshot> {
        let root = std::path::absolute(&self.config.root)
            .with_context(|| format!("resolve backup root {}", self.config.root.display()))?;
        let devices = sorted_subdirs(&root)
            .with_context(|| format!("list backup root {}", root.display()))?;

        let mut snapshot = Snapshot::new();
        for (device, path) in devices {
            match self.scan_device(&device, &path, existing.get(&device)) {
                Ok(backups) if backups.is_empty() => {}
                Ok(backups) => {
                    info!(device = %device, backups = backups.len(), "scanned device");
                    snapshot.insert(device, backups);
                }
                Err(e) => warn!(device = %device, error = %e, "cannot list device directory, skipping"),
            }
        }
        Ok(snapshot)
    }

    fn scan_device(
        &self,
        device: &str,
        path: &Path,
        known: Option<&Vec<BackupRecord>>,
    ) -> io::Result<BTreeMap<String, ObservedBackup>> {
        let candidates: Vec<(String, PathBuf)> = sorted_subdirs(path)?
            .into_iter()
            .filter(|(_, dir)| dir.join(&self.config.flag_file_name).exists())
            .collect();

        let mut backups = BTreeMap::new();
        if candidates.is_empty() {
            info!(device, path = %path.display(), "no backup folders found, skipping device");
            return Ok(backups);
        }

        for (name, dir) in candidates {
            let known = known.and_then(|records| records.iter().find(|r| r.name() == name));
            if let Some(backup) = self.observe(device, &name, &dir, known) {
                backups.insert(name, backup);
            }
        }
        Ok(backups)
    }

    fn observe(
        &self,
        device: &str,
        name: &str,
        dir: &Path,
        known: Option<&BackupRecord>,
    ) -> Option<ObservedBackup> {
        if self.config.reuse_valid {
            if let Some(record) = known.filter(|r| r.valid) {
                debug!(device, backup = name, "reusing valid record without reading its log");
                return Some(ObservedBackup::from_record(record));
            }
        }

        let log_file = dir.join(&self.config.log_file_name);
        if !log_file.is_file() {
            info!(device, backup = name, "skipping backup: no log file found");
            return None;
        }

        let dates = match extract_dates(&log_file) {
            Ok(dates) => dates,
            Err(e) => {
                warn!(device, backup = name, error = %e, "skipping backup: could not extract dates from log");
                return None;
            }
        };

        Some(ObservedBackup::new(
            name,
            dates.start,
            dates.end,
            backup_size(dir),
            log_file.display().to_string(),
        ))
    }
}

/// Immediate subdirectories of `dir` as `(name, path)`, ordered by name.
fn sorted_subdirs(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_meta_core::merge;

    fn backup(root: &Path, device: &str, name: &str, log: Option<String>) -> PathBuf {
        let dir = root.join(device).join(name);
        fs::create_dir_all(&dir).expect("mkdir");
        if let Some(contents) = log {
            fs::write(dir.join(DEFAULT_LOG_FILE_NAME), contents).expect("write log");
        }
        dir
    }

    fn log(start: &str, end: &str) -> String {
        format!("started at {start}\nworking\nstopped at {end}\n")
    }

    #[test]
    fn builds_snapshot_for_flagged_folders() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = backup(
            tmp.path(),
            "pi1",
            "pi1-backup-20250101-010000",
            Some(log("20250101-010000", "20250101-020000")),
        );
        fs::write(dir.join("root.img"), vec![0u8; 64]).expect("write image");
        fs::create_dir_all(tmp.path().join("pi1").join("lost+found")).expect("mkdir");
        fs::write(tmp.path().join("README"), "not a device").expect("write");

        let snapshot = Scanner::new(ScanConfig::new(tmp.path()))
            .scan(&Catalog::new())
            .expect("scan");

        let backups = &snapshot["pi1"];
        assert_eq!(backups.len(), 1);
        let observed = &backups["pi1-backup-20250101-010000"];
        assert_eq!(observed.duration, "1:00:00");
        let log_len = fs::metadata(dir.join(DEFAULT_LOG_FILE_NAME)).expect("meta").len();
        assert_eq!(observed.size, 64 + log_len);
        assert!(Path::new(&observed.log_file).is_absolute());
        assert!(observed.log_file.ends_with(DEFAULT_LOG_FILE_NAME));
    }

    #[test]
    fn devices_without_backups_are_left_out() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("empty-device/not-a-backup")).expect("mkdir");

        let snapshot = Scanner::new(ScanConfig::new(tmp.path()))
            .scan(&Catalog::new())
            .expect("scan");
        assert!(snapshot.is_empty());
    }

    #[test]
    fn separate_flag_file_requires_log_as_well() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = ScanConfig::new(tmp.path());
        config.flag_file_name = "backup.done".to_owned();

        let flagged_without_log = backup(tmp.path(), "pi1", "a", None);
        fs::write(flagged_without_log.join("backup.done"), "").expect("flag");
        let complete = backup(tmp.path(), "pi1", "b", Some(log("20250101-010000", "20250101-010500")));
        fs::write(complete.join("backup.done"), "").expect("flag");
        backup(tmp.path(), "pi1", "c", Some(log("20250101-010000", "20250101-010500")));

        let snapshot = Scanner::new(config).scan(&Catalog::new()).expect("scan");
        let names: Vec<&String> = snapshot["pi1"].keys().collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn unparseable_logs_are_skipped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        backup(tmp.path(), "pi1", "broken", Some("no dates in here\n".to_owned()));
        backup(tmp.path(), "pi1", "good", Some(log("20250101-010000", "20250101-010001")));

        let snapshot = Scanner::new(ScanConfig::new(tmp.path()))
            .scan(&Catalog::new())
            .expect("scan");
        assert!(snapshot["pi1"].contains_key("good"));
        assert!(!snapshot["pi1"].contains_key("broken"));
    }

    #[cfg(unix)]
    #[test]
    fn broken_entries_do_not_stop_the_scan() {
        let tmp = tempfile::tempdir().expect("tempdir");
        backup(tmp.path(), "pi1", "a", Some(log("20250101-010000", "20250101-010001")));
        std::os::unix::fs::symlink(tmp.path().join("gone"), tmp.path().join("dangling")).expect("symlink");
        std::os::unix::fs::symlink(tmp.path().join("pi1").join("gone"), tmp.path().join("pi1").join("b"))
            .expect("symlink");

        let snapshot = Scanner::new(ScanConfig::new(tmp.path()))
            .scan(&Catalog::new())
            .expect("scan");
        let devices: Vec<&String> = snapshot.keys().collect();
        assert_eq!(devices, vec!["pi1"]);
        assert_eq!(snapshot["pi1"].keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let scanner = Scanner::new(ScanConfig::new(tmp.path().join("absent")));
        assert!(scanner.scan(&Catalog::new()).is_err());
    }

    #[test]
    fn reuse_valid_skips_reading_known_logs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = backup(tmp.path(), "pi1", "a", Some(log("20250101-010000", "20250101-020000")));

        let mut config = ScanConfig::new(tmp.path());
        config.reuse_valid = true;
        let scanner = Scanner::new(config);
        let existing = merge(Catalog::new(), scanner.scan(&Catalog::new()).expect("scan"));

        // A rewritten log is not re-read while the record stays valid.
        fs::write(dir.join(DEFAULT_LOG_FILE_NAME), "garbage\n").expect("rewrite");
        let snapshot = scanner.scan(&existing).expect("rescan");
        assert_eq!(snapshot["pi1"]["a"].end_date.to_string(), "20250101-020000");

        // Without reuse the same log is a parse failure.
        let strict = Scanner::new(ScanConfig::new(tmp.path()));
        assert!(strict.scan(&existing).expect("rescan").is_empty());
    }
}
