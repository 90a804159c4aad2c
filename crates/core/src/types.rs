use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Format used for timestamps written to user meta and log lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Domain → group dictionary. Keys are case-sensitive and carry no leading `@`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mappings(BTreeMap<String, String>);

impl Mappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a stored option value.
    ///
    /// Anything other than a JSON object yields an empty mapping. Scalar
    /// group values are kept in their string form; `null`, arrays and objects
    /// are skipped.
    pub fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        let entries = object
            .iter()
            .filter_map(|(domain, group)| scalar_to_string(group).map(|g| (domain.clone(), g)))
            .collect();
        Self(entries)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(domain, group)| (domain.clone(), Value::String(group.clone())))
                .collect(),
        )
    }

    pub fn get(&self, domain: &str) -> Option<&str> {
        self.0.get(domain).map(String::as_str)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.0.contains_key(domain)
    }

    /// Inserts or replaces the group for `domain`.
    pub fn insert(&mut self, domain: impl Into<String>, group: impl Into<String>) {
        self.0.insert(domain.into(), group.into());
    }

    pub fn remove(&mut self, domain: &str) -> Option<String> {
        self.0.remove(domain)
    }

    /// Shallow union where entries from `other` replace existing ones.
    pub fn merge(&mut self, other: Mappings) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(d, g)| (d.as_str(), g.as_str()))
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }
}

impl<D: Into<String>, G: Into<String>> FromIterator<(D, G)> for Mappings {
    fn from_iter<I: IntoIterator<Item = (D, G)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(d, g)| (d.into(), g.into()))
                .collect(),
        )
    }
}

/// Decodes a stored log option into its lines.
///
/// Non-array values decode as an empty log and non-string items are
/// stringified.
pub fn log_lines_from_value(value: &Value) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(line) => Some(line.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1".to_string() } else { String::new() }),
        _ => None,
    }
}

/// Immutable record of one successful assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentLogEntry {
    pub email: String,
    pub domain: String,
    pub group: String,
    pub field: String,
    pub assigned_at: DateTime<Utc>,
}

impl fmt::Display for AssignmentLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Email: {}, Domain: {}, Group assigned: {}, Field: {}, Date: {}",
            self.email,
            self.domain,
            self.group,
            self.field,
            format_timestamp(self.assigned_at)
        )
    }
}

/// Per-user bookkeeping written next to the host's group field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAssignmentState {
    pub group: Option<String>,
    pub assigned_at: Option<String>,
    pub domain: Option<String>,
}

impl UserAssignmentState {
    /// Parsed form of `assigned_at`, if it holds a recognizable timestamp.
    pub fn assigned_at_parsed(&self) -> Option<DateTime<Utc>> {
        self.assigned_at.as_deref().and_then(parse_timestamp)
    }
}

/// Result of running the assignment engine for a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    NotFound,
    NoMapping { domain: String },
    Assigned { domain: String, group: String },
}

impl AssignmentOutcome {
    pub fn is_assigned(&self) -> bool {
        matches!(self, Self::Assigned { .. })
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NoMapping { .. } => "no_mapping",
            Self::Assigned { .. } => "assigned",
        }
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses timestamps written by this service or by earlier versions (which
/// stored the same `YYYY-MM-DD HH:MM:SS` layout), also accepting RFC 3339.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
