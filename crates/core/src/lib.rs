pub mod backup;
pub mod reconcile;
pub mod table;

pub use backup::{
    format_duration, BackupRecord, Catalog, InvalidRecordId, LogTimestamp, ObservedBackup,
    Snapshot, TIMESTAMP_FORMAT,
};
pub use reconcile::{merge, merge_with_stats, MergeStats};
pub use table::{plan_tables, sanitize_table_name, TableNameCollision};
