use sqlx::{Row, SqlitePool};
use thiserror::Error;

/// Read-only introspection used to discover group tables left behind by
/// other B2B plugins. Results are advisory.
#[derive(Clone)]
pub struct SchemaInspector {
    pool: SqlitePool,
}

impl SchemaInspector {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, SchemaError> {
        let found = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn table_columns(&self, table: &str) -> Result<Vec<String>, SchemaError> {
        let columns =
            sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;
        Ok(columns)
    }

    /// Returns every non-null value of `columns` in `table`, as text.
    ///
    /// Column names must come from [`Self::table_columns`]; anything else is
    /// rejected rather than spliced into SQL.
    pub async fn column_values(
        &self,
        table: &str,
        columns: &[&str],
    ) -> Result<Vec<String>, SchemaError> {
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let known = self.table_columns(table).await?;
        if known.is_empty() {
            return Err(SchemaError::UnknownTable(table.to_string()));
        }
        if let Some(unknown) = columns.iter().find(|c| !known.iter().any(|k| k == *c)) {
            return Err(SchemaError::UnknownColumn {
                table: table.to_string(),
                column: unknown.to_string(),
            });
        }

        let select = columns
            .iter()
            .map(|column| format!("CAST({} AS TEXT)", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select} FROM {}", quote_ident(table));

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut values = Vec::with_capacity(rows.len() * columns.len());
        for row in rows {
            for index in 0..columns.len() {
                if let Some(value) = row.try_get::<Option<String>, _>(index)? {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
