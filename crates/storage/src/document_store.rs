use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use backup_meta_core::Catalog;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::store::MetadataSink;

/// The whole catalog as one JSON document. It is the state the next run
/// merges against and the read model for the dashboard.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    path: PathBuf,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Catalog> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read metadata document: {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse metadata document: {}", self.path.display()))
    }

    /// Like [`load`](Self::load), but a missing or corrupt document starts
    /// from an empty catalog.
    pub fn load_or_empty(&self) -> Catalog {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no metadata document yet, starting cold");
            return Catalog::new();
        }
        match self.load() {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "metadata document unusable, starting cold");
                Catalog::new()
            }
        }
    }
}

impl MetadataSink for DocumentStore {
    fn name(&self) -> &'static str {
        "document"
    }

    fn write(&self, catalog: &Catalog) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;

        // Written next to the target and renamed over it, so readers only
        // ever see the previous or the new document.
        let mut tmp = temp_document(dir)?;
        if let Ok(current) = fs::metadata(&self.path) {
            tmp.as_file()
                .set_permissions(current.permissions())
                .with_context(|| format!("copy permissions of {}", self.path.display()))?;
        }
        serde_json::to_writer_pretty(&mut tmp, catalog).context("serialize metadata document")?;
        tmp.write_all(b"\n").context("write metadata document")?;
        tmp.as_file().sync_all().context("sync metadata document")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("replace metadata document: {}", self.path.display()))?;
        Ok(())
    }
}

/// Temporary file for a new document. It gets the mode a plain create would
/// get (0666 less the umask), not the owner-only default of temp files.
fn temp_document(dir: &Path) -> Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    builder
        .tempfile_in(dir)
        .with_context(|| format!("create temporary document in {}", dir.display()))
}
