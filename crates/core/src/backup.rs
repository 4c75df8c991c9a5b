use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, TimeDelta};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Format of the timestamps written by the backup tool into its log.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Fresh observations, keyed by device and then by backup folder name.
pub type Snapshot = BTreeMap<String, BTreeMap<String, ObservedBackup>>;

/// Persisted state: every record ever observed, grouped by device.
pub type Catalog = BTreeMap<String, Vec<BackupRecord>>;

/// A `YYYYMMDD-HHMMSS` instant taken from log content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogTimestamp(NaiveDateTime);

impl LogTimestamp {
    pub fn parse(raw: &str) -> Result<Self, chrono::ParseError> {
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map(Self)
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for LogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for LogTimestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for LogTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        LogTimestamp::parse(&raw).map_err(de::Error::custom)
    }
}

/// Renders a span as `H:MM:SS`, prefixed with `N day(s), ` once it reaches a
/// full day. Negative spans floor to whole days, so minus one hour reads
/// `-1 day, 23:00:00`.
pub fn format_duration(delta: TimeDelta) -> String {
    let total = delta.num_seconds();
    let days = total.div_euclid(86_400);
    let rest = total.rem_euclid(86_400);
    let clock = format!("{}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60);
    match days {
        0 => clock,
        1 | -1 => format!("{days} day, {clock}"),
        _ => format!("{days} days, {clock}"),
    }
}

/// A backup seen on disk during the current scan. It has no id yet; ids are
/// handed out by the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedBackup {
    pub name: String,
    pub start_date: LogTimestamp,
    pub end_date: LogTimestamp,
    pub duration: String,
    pub size: u64,
    pub log_file: String,
}

impl ObservedBackup {
    pub fn new(
        name: impl Into<String>,
        start_date: LogTimestamp,
        end_date: LogTimestamp,
        size: u64,
        log_file: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            start_date,
            end_date,
            duration: format_duration(end_date.as_naive() - start_date.as_naive()),
            size,
            log_file: log_file.into(),
        }
    }

    /// Rebuilds an observation from persisted fields, used when a valid record
    /// is trusted instead of re-reading its log.
    pub fn from_record(record: &BackupRecord) -> Self {
        Self {
            name: record.name.clone(),
            start_date: record.start_date,
            end_date: record.end_date,
            duration: record.duration.clone(),
            size: record.size,
            log_file: record.log_file.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("backup record id must be at least 1, got {0}")]
pub struct InvalidRecordId(pub u64);

/// The persisted unit of state. `id` and `name` form its identity and cannot
/// be changed once the record exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    #[serde(deserialize_with = "deserialize_id")]
    id: u64,
    name: String,
    pub start_date: LogTimestamp,
    pub end_date: LogTimestamp,
    pub duration: String,
    pub size: u64,
    pub log_file: String,
    pub valid: bool,
}

impl BackupRecord {
    pub fn with_id(id: u64, observed: ObservedBackup, valid: bool) -> Result<Self, InvalidRecordId> {
        if id == 0 {
            return Err(InvalidRecordId(id));
        }
        Ok(Self::assemble(id, observed, valid))
    }

    pub(crate) fn assemble(id: u64, observed: ObservedBackup, valid: bool) -> Self {
        Self {
            id,
            name: observed.name,
            start_date: observed.start_date,
            end_date: observed.end_date,
            duration: observed.duration,
            size: observed.size,
            log_file: observed.log_file,
            valid,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Moves a record whose id another record already holds. Only the merge
    /// does this, and only above every id the device has used.
    pub(crate) fn reassign_id(&mut self, id: u64) {
        debug_assert!(id > self.id);
        self.id = id;
    }

    /// Overwrites every observed field and marks the record valid. The name
    /// must match; identity never changes through a refresh.
    pub(crate) fn refresh(&mut self, observed: ObservedBackup) {
        debug_assert_eq!(self.name, observed.name);
        self.start_date = observed.start_date;
        self.end_date = observed.end_date;
        self.duration = observed.duration;
        self.size = observed.size;
        self.log_file = observed.log_file;
        self.valid = true;
    }
}

fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let id = u64::deserialize(deserializer)?;
    if id == 0 {
        return Err(de::Error::custom(InvalidRecordId(id)));
    }
    Ok(id)
}
