use anyhow::Result;
use backup_meta_core::Catalog;

/// A persistent representation of the catalog, implemented by the JSON
/// document and the SQLite tables.
pub trait MetadataSink {
    /// Short label used in logs and error context.
    fn name(&self) -> &'static str;

    /// Make the sink describe exactly `catalog`. Records are never deleted.
    fn write(&self, catalog: &Catalog) -> Result<()>;
}
