use std::path::PathBuf;

use backup_meta_core::Catalog;
use thiserror::Error;

/// Why a backup's log cannot be handed out to a reader of the document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogAccessError {
    #[error("device {0:?} not found")]
    DeviceNotFound(String),
    #[error("backup {backup:?} not found on device {device:?}")]
    BackupNotFound { device: String, backup: String },
    #[error("backup {backup:?} on device {device:?} is not valid; log unavailable")]
    NotValid { device: String, backup: String },
    #[error("log file {0} not found")]
    LogMissing(PathBuf),
}

/// Resolves the log of a backup. Only valid backups expose their log.
pub fn find_log(catalog: &Catalog, device: &str, backup: &str) -> Result<PathBuf, LogAccessError> {
    let records = catalog
        .get(device)
        .ok_or_else(|| LogAccessError::DeviceNotFound(device.to_owned()))?;
    let record = records
        .iter()
        .find(|r| r.name() == backup)
        .ok_or_else(|| LogAccessError::BackupNotFound {
            device: device.to_owned(),
            backup: backup.to_owned(),
        })?;
    if !record.valid {
        return Err(LogAccessError::NotValid {
            device: device.to_owned(),
            backup: backup.to_owned(),
        });
    }

    let path = PathBuf::from(&record.log_file);
    if record.log_file.is_empty() || !path.is_file() {
        return Err(LogAccessError::LogMissing(path));
    }
    Ok(path)
}
