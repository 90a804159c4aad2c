//! Option names written by earlier releases and the merge rules used to fold
//! them into the canonical stores.

use serde_json::Value;

use crate::types::{log_lines_from_value, Mappings};

pub const MAPPINGS_OPTION: &str = "b2b_auto_group_mappings_simple";
pub const LOGS_OPTION: &str = "b2b_auto_group_logs_simple";
pub const MIGRATION_DONE_OPTION: &str = "b2b_auto_group_migration_done_simple";

/// Mapping options from previous releases, in merge order.
pub const LEGACY_MAPPING_OPTIONS: [&str; 9] = [
    "b2b_auto_group_mappings",
    "b2b_auto_group_mappings_final",
    "b2b_auto_group_mappings_optimized",
    "b2b_auto_group_mappings_complete",
    "b2b_auto_group_mappings_debug",
    "b2b_auto_group_mappings_final_correct",
    "wcb2b_auto_group_mappings",
    "wcb2b_domain_group_mappings",
    "b2b_domain_group_mappings",
];

/// Log options from previous releases, in merge order.
pub const LEGACY_LOG_OPTIONS: [&str; 9] = [
    "b2b_auto_group_logs",
    "b2b_auto_group_logs_final",
    "b2b_auto_group_logs_optimized",
    "b2b_auto_group_logs_complete",
    "b2b_auto_group_logs_debug",
    "b2b_auto_group_logs_final_correct",
    "wcb2b_auto_group_logs",
    "wcb2b_assignment_logs",
    "b2b_assignment_logs",
];

/// Merged view of the legacy sources that held data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Merged<T> {
    pub value: T,
    pub sources: Vec<String>,
}

/// Unions every non-empty mapping source; later sources win on key clashes.
pub fn merge_mapping_sources<'a, I>(sources: I) -> Merged<Mappings>
where
    I: IntoIterator<Item = (&'a str, Option<Value>)>,
{
    let mut merged = Merged::<Mappings>::default();
    for (name, value) in sources {
        let Some(value) = value else { continue };
        let mappings = Mappings::from_value(&value);
        if mappings.is_empty() {
            continue;
        }
        merged.value.merge(mappings);
        merged.sources.push(name.to_string());
    }
    merged
}

/// Concatenates every non-empty log source in order, without dedup or cap.
pub fn merge_log_sources<'a, I>(sources: I) -> Merged<Vec<String>>
where
    I: IntoIterator<Item = (&'a str, Option<Value>)>,
{
    let mut merged = Merged::<Vec<String>>::default();
    for (name, value) in sources {
        let Some(value) = value else { continue };
        let lines = log_lines_from_value(&value);
        if lines.is_empty() {
            continue;
        }
        merged.value.extend(lines);
        merged.sources.push(name.to_string());
    }
    merged
}
