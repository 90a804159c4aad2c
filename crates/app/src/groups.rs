use tracing::warn;

use b2b_group_core::suggestions::{
    GroupColumns, GroupSuggestions, ALTERNATE_GROUP_FIELDS, LEGACY_GROUP_TABLES,
};
use b2b_group_storage::{Database, SchemaError};

/// Collects group names worth offering in the admin UI.
///
/// Every source is best effort; a failing source is logged and skipped.
pub async fn discover_groups(database: &Database, group_field: &str) -> Vec<String> {
    let mut suggestions = GroupSuggestions::new();
    let users = database.users();

    let fields = std::iter::once(group_field).chain(
        ALTERNATE_GROUP_FIELDS
            .iter()
            .copied()
            .filter(|field| *field != group_field),
    );
    for field in fields {
        match users.distinct_field_values(field).await {
            Ok(values) => suggestions.extend(values),
            Err(err) => {
                warn!(stage = "admin", field, error = %err, "failed to read group field values")
            }
        }
    }

    for table in LEGACY_GROUP_TABLES {
        match table_groups(database, table).await {
            Ok(values) => suggestions.extend(values),
            Err(err) => warn!(stage = "admin", table, error = %err, "failed to read group table"),
        }
    }

    match database.mappings().get_all().await {
        Ok(mappings) => suggestions.extend(mappings.groups()),
        Err(err) => warn!(stage = "admin", error = %err, "failed to read mappings for suggestions"),
    }

    suggestions.with_fallbacks().into_sorted()
}

async fn table_groups(database: &Database, table: &str) -> Result<Vec<String>, SchemaError> {
    let schema = database.schema();
    if !schema.table_exists(table).await? {
        return Ok(Vec::new());
    }
    let names = schema.table_columns(table).await?;
    let columns = GroupColumns::sniff(names.as_slice());
    schema.column_values(table, &columns.selected()).await
}
