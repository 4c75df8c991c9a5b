use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use backup_meta_core::{plan_tables, sanitize_table_name, BackupRecord, Catalog, LogTimestamp, ObservedBackup};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::debug;

use crate::store::MetadataSink;

/// SQLite-backed catalog, one table per device. Each call opens a fresh
/// connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    table_prefix: String,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>, table_prefix: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            table_prefix: table_prefix.into(),
        }
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("open metadata db: {}", self.db_path.display()))
    }

    /// Rows of a device's table ordered by id; empty if the table does not exist.
    pub fn read_device(&self, device: &str) -> Result<Vec<BackupRecord>> {
        let conn = self.connect()?;
        let table = sanitize_table_name(&self.table_prefix, device);
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [&table],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, start_date, end_date, duration, size, log_file, valid
             FROM {} ORDER BY id",
            quote_ident(&table)
        ))?;
        let rows = stmt.query_map([], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }
}

impl MetadataSink for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn write(&self, catalog: &Catalog) -> Result<()> {
        let plan = plan_tables(&self.table_prefix, catalog.keys())?;
        let mut conn = self.connect()?;
        let tx = conn.transaction().context("begin metadata transaction")?;
        for (device, records) in catalog {
            let table = &plan[device];
            write_device(&tx, table, records)
                .with_context(|| format!("write device {device:?} to table {table:?}"))?;
        }
        tx.commit().context("commit metadata transaction")?;
        Ok(())
    }
}

fn write_device(tx: &Transaction<'_>, table: &str, records: &[BackupRecord]) -> Result<()> {
    let table = quote_ident(table);
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            start_date TEXT,
            end_date TEXT,
            duration TEXT,
            size INTEGER,
            log_file TEXT,
            valid INTEGER
        )"
    ))?;

    let stored_max: i64 =
        tx.query_row(&format!("SELECT COALESCE(MAX(id), 0) FROM {table}"), [], |row| row.get(0))?;
    let merged_max = records.iter().map(BackupRecord::id).max().unwrap_or(0);
    let mut ceiling = stored_max.max(i64::try_from(merged_max)?);

    let mut holder = tx.prepare(&format!("SELECT name FROM {table} WHERE id = ?1"))?;
    let mut relocate = tx.prepare(&format!("UPDATE {table} SET id = ?1 WHERE id = ?2"))?;
    let mut upsert = tx.prepare(&format!(
        "INSERT INTO {table} (id, name, start_date, end_date, duration, size, log_file, valid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(name) DO UPDATE SET
            id = excluded.id,
            start_date = excluded.start_date,
            end_date = excluded.end_date,
            duration = excluded.duration,
            size = excluded.size,
            log_file = excluded.log_file,
            valid = excluded.valid"
    ))?;

    for record in records {
        let id = i64::try_from(record.id())?;
        // Rows the document no longer knows (e.g. after a cold start) may sit
        // on an id the merge handed to another backup; move them out of the way.
        let current: Option<String> = holder.query_row([id], |row| row.get(0)).optional()?;
        if let Some(other) = current.filter(|name| name != record.name()) {
            ceiling += 1;
            debug!(table = %table, backup = %other, from = id, to = ceiling, "relocating row to free id");
            relocate.execute(params![ceiling, id])?;
        }

        upsert.execute(params![
            id,
            record.name(),
            record.start_date.to_string(),
            record.end_date.to_string(),
            record.duration,
            i64::try_from(record.size)?,
            record.log_file,
            record.valid,
        ])?;
    }

    // Runs after every upsert so a backup seen in this run is never swept.
    let valid: HashSet<&str> = records.iter().filter(|r| r.valid).map(BackupRecord::name).collect();
    let mut still_valid = tx.prepare(&format!("SELECT name FROM {table} WHERE valid = 1"))?;
    let stale = still_valid
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|name| !valid.contains(name.as_str()));
    let mut invalidate = tx.prepare(&format!("UPDATE {table} SET valid = 0 WHERE name = ?1"))?;
    for name in stale {
        debug!(table = %table, backup = %name, "marking absent row invalid");
        invalidate.execute([name])?;
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<BackupRecord> {
    let id: i64 = row.get(0)?;
    let size: i64 = row.get(5)?;
    let observed = ObservedBackup {
        name: row.get(1)?,
        start_date: parse_ts(row.get(2)?)?,
        end_date: parse_ts(row.get(3)?)?,
        duration: row.get(4)?,
        size: u64::try_from(size).map_err(|e| to_sql_err(5, e))?,
        log_file: row.get(6)?,
    };
    let id = u64::try_from(id).map_err(|e| to_sql_err(0, e))?;
    BackupRecord::with_id(id, observed, row.get(7)?).map_err(|e| to_sql_err(0, e))
}

fn parse_ts(raw: String) -> rusqlite::Result<LogTimestamp> {
    LogTimestamp::parse(&raw).map_err(|e| to_sql_err(2, e))
}

fn to_sql_err<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}
