use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::backup::{BackupRecord, Catalog, ObservedBackup, Snapshot};

/// Counters describing what a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records created for backups never seen before.
    pub new: usize,
    /// Existing records overwritten with a fresh observation.
    pub refreshed: usize,
    /// Records that were valid before the merge and are not anymore.
    pub invalidated: usize,
    /// Records in the merged catalog.
    pub total: usize,
}

/// Merges a fresh scan into previously persisted state.
///
/// Every existing record survives. Records without a fresh observation are
/// marked invalid, records with one are refreshed in place and keep their
/// id. Backups seen for the first time get ids above the highest id the
/// device has ever used, handed out in name order.
pub fn merge(existing: Catalog, fresh: Snapshot) -> Catalog {
    merge_with_stats(existing, fresh).0
}

pub fn merge_with_stats(mut existing: Catalog, mut fresh: Snapshot) -> (Catalog, MergeStats) {
    let devices: BTreeSet<String> = existing.keys().chain(fresh.keys()).cloned().collect();
    let mut stats = MergeStats::default();
    let mut merged = Catalog::new();

    for device in devices {
        let records = existing.remove(&device).unwrap_or_default();
        let observed = fresh.remove(&device).unwrap_or_default();
        let list = merge_device(&device, records, observed, &mut stats);
        stats.total += list.len();
        merged.insert(device, list);
    }

    (merged, stats)
}

fn merge_device(
    device: &str,
    mut records: Vec<BackupRecord>,
    observed: BTreeMap<String, ObservedBackup>,
    stats: &mut MergeStats,
) -> Vec<BackupRecord> {
    // Ids of dropped duplicates still count, they must never be handed out again.
    let mut max_id = records.iter().map(BackupRecord::id).max().unwrap_or(0);

    records.sort_by_key(BackupRecord::id);
    let mut previously_valid = BTreeSet::new();
    let mut taken_ids = BTreeSet::new();
    let mut by_name: BTreeMap<String, BackupRecord> = BTreeMap::new();
    for mut record in records {
        if by_name.contains_key(record.name()) {
            warn!(
                device,
                backup = record.name(),
                id = record.id(),
                "dropping duplicate record for backup"
            );
            continue;
        }
        if !taken_ids.insert(record.id()) {
            max_id += 1;
            warn!(
                device,
                backup = record.name(),
                id = record.id(),
                new_id = max_id,
                "id already held by another backup, moving record"
            );
            record.reassign_id(max_id);
            taken_ids.insert(max_id);
        }
        if record.valid {
            previously_valid.insert(record.name().to_owned());
        }
        record.valid = false;
        by_name.insert(record.name().to_owned(), record);
    }

    let mut unseen = Vec::new();
    for (name, backup) in observed {
        match by_name.get_mut(&name) {
            Some(record) => {
                record.refresh(backup);
                stats.refreshed += 1;
            }
            None => unseen.push(backup),
        }
    }

    for backup in unseen {
        max_id += 1;
        debug!(device, backup = %backup.name, id = max_id, "assigning id to new backup");
        by_name.insert(backup.name.clone(), BackupRecord::assemble(max_id, backup, true));
        stats.new += 1;
    }

    stats.invalidated += by_name
        .values()
        .filter(|r| !r.valid && previously_valid.contains(r.name()))
        .count();

    let mut list: Vec<BackupRecord> = by_name.into_values().collect();
    list.sort_by_key(BackupRecord::id);
    list
}
