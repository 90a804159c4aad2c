use std::collections::BTreeSet;

/// Meta keys older B2B plugins used for the customer group.
pub const ALTERNATE_GROUP_FIELDS: [&str; 5] = [
    "wcb2b_customer_group",
    "_wcb2b_customer_group",
    "customer_group",
    "_customer_group",
    "_wcb2b_group",
];

/// Tables that may hold group definitions on installations that used them.
pub const LEGACY_GROUP_TABLES: [&str; 4] = [
    "wcb2b_groups",
    "wcb2b_customer_groups",
    "b2b_groups",
    "b2b_customer_groups",
];

/// Always offered, even on a fresh install.
pub const FALLBACK_GROUPS: [&str; 13] = [
    "1", "2", "3", "7868", "Default", "Standard", "Premium", "Gold", "Silver", "Bronze", "Ospite",
    "PCUsato", "Eni",
];

const ID_COLUMNS: [&str; 2] = ["id", "group_id"];
const NAME_COLUMNS: [&str; 3] = ["name", "group_name", "title"];

/// Columns worth reading from a discovered group table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupColumns {
    pub id: Option<String>,
    pub name: Option<String>,
}

impl GroupColumns {
    /// Picks the first id-like and name-like column present in `columns`.
    pub fn sniff<S: AsRef<str>>(columns: &[S]) -> Self {
        let pick = |candidates: &[&str]| {
            candidates
                .iter()
                .find(|candidate| columns.iter().any(|c| c.as_ref() == **candidate))
                .map(|c| c.to_string())
        };
        Self {
            id: pick(&ID_COLUMNS),
            name: pick(&NAME_COLUMNS),
        }
    }

    pub fn selected(&self) -> Vec<&str> {
        self.id.iter().chain(self.name.iter()).map(String::as_str).collect()
    }
}

/// Accumulates advisory group names from any number of sources.
#[derive(Debug, Default, Clone)]
pub struct GroupSuggestions {
    groups: BTreeSet<String>,
}

impl GroupSuggestions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for value in values {
            let value = value.as_ref().trim();
            if is_meaningful(value) {
                self.groups.insert(value.to_string());
            }
        }
    }

    pub fn with_fallbacks(mut self) -> Self {
        self.extend(FALLBACK_GROUPS);
        self
    }

    /// Sorted, deduplicated list.
    pub fn into_sorted(self) -> Vec<String> {
        self.groups.into_iter().collect()
    }
}

// "0" counts as empty, as it did for the original admin listing.
fn is_meaningful(value: &str) -> bool {
    !value.is_empty() && value != "0"
}
