use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("devices {first:?} and {second:?} both map to table {table:?}")]
pub struct TableNameCollision {
    pub table: String,
    pub first: String,
    pub second: String,
}

fn non_word() -> &'static Regex {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    NON_WORD.get_or_init(|| Regex::new(r"\W+").expect("static pattern"))
}

/// SQLite refuses to create tables whose names start with this, in any case.
const RESERVED_PREFIX: &str = "sqlite_";

/// Relational table name for a device: each run of non-word characters
/// becomes a single `_`, behind an optional prefix. Names SQLite keeps for
/// itself get a leading `_`.
pub fn sanitize_table_name(prefix: &str, device: &str) -> String {
    let table = format!("{prefix}{}", non_word().replace_all(device, "_"));
    let reserved = table
        .get(..RESERVED_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(RESERVED_PREFIX));
    if reserved {
        format!("_{table}")
    } else {
        table
    }
}

/// Maps every device to its table, refusing to let two devices share one.
pub fn plan_tables<'a, I>(prefix: &str, devices: I) -> Result<BTreeMap<String, String>, TableNameCollision>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut owners: BTreeMap<String, &String> = BTreeMap::new();
    let mut plan = BTreeMap::new();
    for device in devices {
        let table = sanitize_table_name(prefix, device);
        if let Some(first) = owners.get(&table) {
            if *first != device {
                return Err(TableNameCollision {
                    table,
                    first: (*first).clone(),
                    second: device.clone(),
                });
            }
        }
        owners.insert(table.clone(), device);
        plan.insert(device.clone(), table);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_runs_of_non_word_characters() {
        assert_eq!(sanitize_table_name("", "pi-1"), "pi_1");
        assert_eq!(sanitize_table_name("", "pi!1"), "pi_1");
        assert_eq!(sanitize_table_name("", "living room -- pi"), "living_room_pi");
        assert_eq!(sanitize_table_name("dev_", "nas.local"), "dev_nas_local");
        assert_eq!(sanitize_table_name("", "plain_name9"), "plain_name9");
    }

    #[test]
    fn reserved_sqlite_names_get_their_own_namespace() {
        assert_eq!(sanitize_table_name("", "sqlite-box"), "_sqlite_box");
        assert_eq!(sanitize_table_name("", "SQLite_Master"), "_SQLite_Master");
        assert_eq!(sanitize_table_name("sqlite", "_nas"), "_sqlite_nas");
        assert_eq!(sanitize_table_name("", "sqlite"), "sqlite");
        assert_eq!(sanitize_table_name("", "my-sqlite-box"), "my_sqlite_box");
    }

    #[test]
    fn escaped_reserved_name_still_collides_with_its_twin() {
        let devices = vec!["_sqlite-box".to_owned(), "sqlite-box".to_owned()];
        let err = plan_tables("", &devices).unwrap_err();
        assert_eq!(err.table, "_sqlite_box");
    }

    #[test]
    fn plans_distinct_devices() {
        let devices = vec!["pi1".to_owned(), "pi-2".to_owned()];
        let plan = plan_tables("", &devices).expect("plan");
        assert_eq!(plan["pi1"], "pi1");
        assert_eq!(plan["pi-2"], "pi_2");
    }

    #[test]
    fn rejects_devices_sharing_a_table() {
        let devices = vec!["pi!1".to_owned(), "pi-1".to_owned()];
        let err = plan_tables("", &devices).unwrap_err();
        assert_eq!(
            err,
            TableNameCollision {
                table: "pi_1".to_owned(),
                first: "pi!1".to_owned(),
                second: "pi-1".to_owned(),
            }
        );
    }
}
