pub mod document_store;
mod log_access;
mod repository;
pub mod sqlite_store;
pub mod store;

pub use document_store::DocumentStore;
pub use log_access::{find_log, LogAccessError};
pub use repository::{MetadataRepository, RunSummary, StoreConfig};
pub use sqlite_store::SqliteStore;
pub use store::MetadataSink;
