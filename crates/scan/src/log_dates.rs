use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use backup_meta_core::LogTimestamp;
use regex::Regex;
use thiserror::Error;

/// Start and end of a backup run as recorded in its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogDates {
    pub start: LogTimestamp,
    pub end: LogTimestamp,
}

#[derive(Debug, Error)]
pub enum LogParseError {
    #[error("cannot read log {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("log is empty")]
    Empty,
    #[error("no timestamp on the first line")]
    MissingStart,
    #[error("no timestamp on the last line")]
    MissingEnd,
    #[error("timestamp {raw:?} is not a real date: {source}")]
    InvalidTimestamp {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },
}

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[0-9]{8}-[0-9]{6}").expect("static pattern"))
}

/// Reads the first and last non-empty lines of a backup log and takes the
/// first `YYYYMMDD-HHMMSS` match on each.
pub fn extract_dates(path: &Path) -> Result<LogDates, LogParseError> {
    let raw = fs::read(path).map_err(|source| LogParseError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&raw);

    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let first = lines.next().ok_or(LogParseError::Empty)?;
    let last = lines.next_back().unwrap_or(first);

    let start = find_timestamp(first).ok_or(LogParseError::MissingStart)??;
    let end = find_timestamp(last).ok_or(LogParseError::MissingEnd)??;
    Ok(LogDates { start, end })
}

fn find_timestamp(line: &str) -> Option<Result<LogTimestamp, LogParseError>> {
    let found = timestamp_pattern().find(line)?;
    Some(
        LogTimestamp::parse(found.as_str()).map_err(|source| LogParseError::InvalidTimestamp {
            raw: found.as_str().to_owned(),
            source,
        }),
    )
}
