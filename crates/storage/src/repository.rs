use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use backup_meta_core::{merge_with_stats, plan_tables, Catalog, MergeStats};
use backup_meta_scan::Scanner;
use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};

use crate::document_store::DocumentStore;
use crate::sqlite_store::SqliteStore;
use crate::store::MetadataSink;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub document_path: PathBuf,
    pub database_path: PathBuf,
    pub table_prefix: String,
}

/// What one batch cycle produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub devices: usize,
    pub records: usize,
    pub valid: usize,
    pub merge: MergeStats,
}

/// Owns both sinks and keeps them describing the same catalog.
///
/// The document is the source of truth. Every persist is bracketed by a
/// `<document>.pending` marker; a marker left behind by a crashed run makes
/// the next run rebuild the relational tables from the document first.
#[derive(Debug, Clone)]
pub struct MetadataRepository {
    document: DocumentStore,
    relational: SqliteStore,
    table_prefix: String,
}

impl MetadataRepository {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            document: DocumentStore::new(config.document_path),
            relational: SqliteStore::new(config.database_path, config.table_prefix.clone()),
            table_prefix: config.table_prefix,
        }
    }

    pub fn document(&self) -> &DocumentStore {
        &self.document
    }

    pub fn relational(&self) -> &SqliteStore {
        &self.relational
    }

    /// One full cycle: repair, load, scan, merge, persist.
    pub fn run(&self, scanner: &Scanner) -> Result<RunSummary> {
        self.recover()?;

        let existing = self.document.load_or_empty();
        let fresh = scanner.scan(&existing)?;
        let (merged, stats) = merge_with_stats(existing, fresh);
        info!(
            new = stats.new,
            refreshed = stats.refreshed,
            invalidated = stats.invalidated,
            total = stats.total,
            "merged scan into catalog"
        );

        self.persist(&merged)?;

        Ok(RunSummary {
            devices: merged.len(),
            records: stats.total,
            valid: merged.values().flatten().filter(|r| r.valid).count(),
            merge: stats,
        })
    }

    /// Writes `catalog` to the document and then to the relational tables.
    /// Nothing is written if two devices would share a table.
    pub fn persist(&self, catalog: &Catalog) -> Result<()> {
        plan_tables(&self.table_prefix, catalog.keys())?;

        let marker = self.marker_path();
        if let Some(parent) = marker.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&marker, Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
            .with_context(|| format!("write pending marker: {}", marker.display()))?;

        let sinks: [&dyn MetadataSink; 2] = [&self.document, &self.relational];
        for sink in sinks {
            sink.write(catalog)
                .with_context(|| format!("write {} sink", sink.name()))?;
            info!(sink = sink.name(), "metadata saved");
        }

        fs::remove_file(&marker)
            .with_context(|| format!("remove pending marker: {}", marker.display()))?;
        Ok(())
    }

    /// Repairs the relational tables after an interrupted persist. Returns
    /// whether a repair was needed.
    pub fn recover(&self) -> Result<bool> {
        let marker = self.marker_path();
        if !marker.exists() {
            return Ok(false);
        }

        warn!(marker = %marker.display(), "previous run did not finish writing metadata, repairing");
        match self.document.load() {
            Ok(catalog) => {
                self.relational
                    .write(&catalog)
                    .context("rebuild relational metadata from document")?;
                info!(devices = catalog.len(), "relational metadata rebuilt from document");
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "no readable document to repair from");
            }
        }

        fs::remove_file(&marker)
            .with_context(|| format!("remove pending marker: {}", marker.display()))?;
        Ok(true)
    }

    fn marker_path(&self) -> PathBuf {
        let mut raw = OsString::from(self.document.path().as_os_str());
        raw.push(".pending");
        PathBuf::from(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_meta_core::{merge, LogTimestamp, ObservedBackup, Snapshot};

    fn repo(dir: &std::path::Path) -> MetadataRepository {
        MetadataRepository::new(StoreConfig {
            document_path: dir.join("backup_metadata.json"),
            database_path: dir.join("backup_metadata.db"),
            table_prefix: String::new(),
        })
    }

    fn catalog(device: &str, names: &[&str]) -> Catalog {
        let mut snapshot = Snapshot::new();
        let backups = snapshot.entry(device.to_owned()).or_default();
        for name in names {
            let observed = ObservedBackup::new(
                *name,
                LogTimestamp::parse("20250101-010000").expect("start"),
                LogTimestamp::parse("20250101-011500").expect("end"),
                10,
                format!("/backups/{device}/{name}/raspiBackup.log"),
            );
            backups.insert((*name).to_owned(), observed);
        }
        merge(Catalog::new(), snapshot)
    }

    #[test]
    fn persist_writes_both_sinks_and_clears_marker() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = repo(tmp.path());
        let catalog = catalog("pi1", &["a", "b"]);

        repo.persist(&catalog).expect("persist");

        assert_eq!(repo.document().load().expect("load"), catalog);
        assert_eq!(repo.relational().read_device("pi1").expect("read"), catalog["pi1"]);
        assert!(!repo.marker_path().exists());
    }

    #[test]
    fn collision_leaves_previous_state_untouched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = repo(tmp.path());
        let first = catalog("pi1", &["a"]);
        repo.persist(&first).expect("persist");

        let mut clashing = catalog("pi-1", &["x"]);
        clashing.extend(catalog("pi!1", &["y"]));
        let err = repo.persist(&clashing).unwrap_err();

        assert!(err.to_string().contains("pi_1"));
        assert_eq!(repo.document().load().expect("load"), first);
        assert!(!repo.marker_path().exists());
    }

    #[test]
    fn recover_rebuilds_relational_sink_from_document() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = repo(tmp.path());
        let catalog = catalog("pi1", &["a", "b"]);

        // Simulate a crash between the two sink writes.
        repo.document().write(&catalog).expect("document");
        fs::write(repo.marker_path(), "crashed").expect("marker");
        assert!(repo.relational().read_device("pi1").expect("read").is_empty());

        assert!(repo.recover().expect("recover"));
        assert_eq!(repo.relational().read_device("pi1").expect("read"), catalog["pi1"]);
        assert!(!repo.marker_path().exists());
        assert!(!repo.recover().expect("second recover"));
    }
}
