use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use b2b_group_core::legacy::{
    merge_log_sources, merge_mapping_sources, LEGACY_LOG_OPTIONS, LEGACY_MAPPING_OPTIONS,
    MIGRATION_DONE_OPTION,
};
use b2b_group_storage::{Database, OptionError, OptionRepository};
use serde_json::Value;

/// One-shot import of mappings and logs written by earlier releases.
#[derive(Clone)]
pub struct LegacyMigrator {
    database: Database,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationReport {
    AlreadyDone,
    /// The canonical mapping already had entries; nothing was imported.
    SkippedExisting,
    Migrated {
        mappings: usize,
        logs: usize,
        sources: Vec<String>,
        logs_kept_existing: bool,
    },
}

impl MigrationReport {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::AlreadyDone => "already_done",
            Self::SkippedExisting => "skipped_existing",
            Self::Migrated { .. } => "migrated",
        }
    }
}

impl LegacyMigrator {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Checks the completion flag and migrates when it is unset.
    ///
    /// The flag is set after every attempt that reaches the end, whether or
    /// not any legacy data was found.
    pub async fn run_if_needed(&self) -> Result<MigrationReport, MigratorError> {
        let options = self.database.options();
        if options.get_flag(MIGRATION_DONE_OPTION).await? {
            return Ok(MigrationReport::AlreadyDone);
        }

        let report = self.migrate(&options).await?;
        options.set_flag(MIGRATION_DONE_OPTION, true).await?;

        counter!("legacy_migration_total", "result" => report.metric_label()).increment(1);
        match &report {
            MigrationReport::Migrated {
                mappings,
                logs,
                sources,
                logs_kept_existing,
            } => info!(
                stage = "migration",
                mappings,
                logs,
                sources = %sources.join(","),
                logs_kept_existing,
                "legacy data migrated"
            ),
            other => info!(stage = "migration", result = other.metric_label(), "legacy migration skipped"),
        }
        Ok(report)
    }

    async fn migrate(&self, options: &OptionRepository) -> Result<MigrationReport, MigratorError> {
        let mapping_store = self.database.mappings();
        if !mapping_store.get_all().await?.is_empty() {
            return Ok(MigrationReport::SkippedExisting);
        }

        let mapping_sources = read_sources(options, &LEGACY_MAPPING_OPTIONS).await?;
        let merged_mappings = merge_mapping_sources(mapping_sources);

        let log_store = self.database.assignment_logs();
        let logs_kept_existing = !log_store.get_all().await?.is_empty();
        let merged_logs = if logs_kept_existing {
            warn!(stage = "migration", "canonical log store not empty; legacy logs left in place");
            None
        } else {
            let log_sources = read_sources(options, &LEGACY_LOG_OPTIONS).await?;
            Some(merge_log_sources(log_sources))
        };

        // The canonical mapping gates re-runs and must be written last.
        let mut sources = merged_mappings.sources;
        let mut log_count = 0;
        if let Some(merged_logs) = merged_logs {
            log_store.replace(&merged_logs.value).await?;
            log_count = merged_logs.value.len();
            sources.extend(merged_logs.sources);
        }
        mapping_store.replace(&merged_mappings.value).await?;

        Ok(MigrationReport::Migrated {
            mappings: merged_mappings.value.len(),
            logs: log_count,
            sources,
            logs_kept_existing,
        })
    }
}

// Undecodable legacy rows are treated as empty so one corrupt option cannot
// block the import of the others.
async fn read_sources<'a>(
    options: &OptionRepository,
    names: &[&'a str],
) -> Result<Vec<(&'a str, Option<Value>)>, MigratorError> {
    let mut sources = Vec::with_capacity(names.len());
    for name in names {
        let value = match options.get(name).await {
            Ok(value) => value,
            Err(OptionError::Decode { name, source }) => {
                warn!(stage = "migration", option = %name, error = %source, "skipping undecodable legacy option");
                None
            }
            Err(err) => return Err(err.into()),
        };
        sources.push((*name, value));
    }
    Ok(sources)
}

#[derive(Debug, Error)]
pub enum MigratorError {
    #[error("option store failure: {0}")]
    Options(#[from] OptionError),
}
