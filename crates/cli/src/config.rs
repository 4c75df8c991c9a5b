use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use backup_meta_scan::ScanConfig;
use backup_meta_storage::StoreConfig;
use serde::Deserialize;

pub const DEFAULT_ROOT: &str = "/media/Data/Backups";
pub const DOCUMENT_FILE_NAME: &str = "backup_metadata.json";
pub const DATABASE_FILE_NAME: &str = "backup_metadata.db";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scan: ScanSection,
    pub storage: StorageSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ScanSection {
    pub root: Option<String>,
    pub log_file_name: Option<String>,
    pub flag_file_name: Option<String>,
    pub reuse_valid: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StorageSection {
    pub document_path: Option<String>,
    pub database_path: Option<String>,
    pub table_prefix: Option<String>,
}

/// Everything the engine needs, after file values and env overrides are applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub scan: ScanConfig,
    pub store: StoreConfig,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

/// Applies `BACKUP_META_*` overrides from `env` on top of the file config.
pub fn resolve(cfg: &Config, env: impl Fn(&str) -> Option<String>) -> Result<Settings> {
    let root = PathBuf::from(
        env("BACKUP_META_ROOT")
            .or_else(|| cfg.scan.root.clone())
            .unwrap_or_else(|| DEFAULT_ROOT.to_owned()),
    );

    let mut scan = ScanConfig::new(&root);
    if let Some(name) = &cfg.scan.log_file_name {
        scan.log_file_name = name.clone();
    }
    if let Some(name) = &cfg.scan.flag_file_name {
        scan.flag_file_name = name.clone();
    }
    scan.reuse_valid = match env("BACKUP_META_REUSE_VALID") {
        Some(raw) => parse_flag(&raw).context("BACKUP_META_REUSE_VALID")?,
        None => cfg.scan.reuse_valid.unwrap_or(false),
    };

    let document_path = env("BACKUP_META_DOCUMENT")
        .or_else(|| cfg.storage.document_path.clone())
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join(DOCUMENT_FILE_NAME));
    let database_path = env("BACKUP_META_DATABASE")
        .or_else(|| cfg.storage.database_path.clone())
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join(DATABASE_FILE_NAME));
    let table_prefix = env("BACKUP_META_TABLE_PREFIX")
        .or_else(|| cfg.storage.table_prefix.clone())
        .unwrap_or_default();

    Ok(Settings {
        scan,
        store: StoreConfig {
            document_path,
            database_path,
            table_prefix,
        },
    })
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}
