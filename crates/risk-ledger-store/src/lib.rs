use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use risk_ledger_core::{
    migrate_ledger_value, MigrationReport, ProjectId, ProjectLedger, CURRENT_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};

mod file;
mod sqlite;
mod transfer;

pub use file::JsonFileStore;
pub use sqlite::SqliteStore;
pub use transfer::{export_ledgers, import_ledgers, ExportFileDigest, ExportManifest, ImportSummary};

/// Storage layout and ledger document versions of one record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub backend: String,
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub ledger_schema_version: u32,
    pub stale_ledgers: Vec<ProjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigratedLedger {
    pub project_id: ProjectId,
    pub report: MigrationReport,
}

/// Durable per-project ledger storage.
///
/// Implementations persist whole ledger documents. Loading always runs the
/// schema migrator, so callers only ever see current-shape ledgers.
pub trait LedgerStore {
    fn backend_name(&self) -> &'static str;

    /// Raw persisted document for `project_id`, or `None` if nothing is stored.
    ///
    /// # Errors
    /// Returns an error when the backing storage cannot be read or parsed.
    fn load_document(&self, project_id: &ProjectId) -> Result<Option<Value>>;

    /// Persist the full ledger snapshot atomically.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails. A failed save
    /// leaves the previously stored ledger in place.
    fn save(&mut self, ledger: &ProjectLedger) -> Result<()>;

    /// # Errors
    /// Returns an error when the backing storage cannot be listed.
    fn list_projects(&self) -> Result<Vec<ProjectId>>;

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    fn schema_status(&self) -> Result<SchemaStatus>;

    /// Bring the storage layout itself up to date. Stores without a
    /// versioned layout have nothing to do.
    ///
    /// # Errors
    /// Returns an error when a layout migration fails.
    fn migrate_storage(&mut self) -> Result<()> {
        Ok(())
    }

    /// Load and migrate a ledger, returning a fresh empty one when none exists.
    ///
    /// # Errors
    /// Returns an error when the stored document cannot be read or migrated, or
    /// belongs to a different project.
    fn load(&self, project_id: &ProjectId) -> Result<ProjectLedger> {
        Ok(self.load_with_report(project_id)?.map_or_else(
            || ProjectLedger::new(project_id.clone()),
            |(ledger, _)| ledger,
        ))
    }

    /// # Errors
    /// See [`LedgerStore::load`].
    fn load_with_report(
        &self,
        project_id: &ProjectId,
    ) -> Result<Option<(ProjectLedger, MigrationReport)>> {
        let Some(document) = self.load_document(project_id)? else {
            debug!(backend = self.backend_name(), project_id = %project_id, "no stored ledger");
            return Ok(None);
        };
        let (ledger, report) = migrate_ledger_value(document)
            .with_context(|| format!("failed to migrate stored ledger for {project_id}"))?;
        if &ledger.project_id != project_id {
            return Err(anyhow!(
                "stored ledger for {project_id} belongs to project {}",
                ledger.project_id
            ));
        }
        if report.changed() {
            info!(
                backend = self.backend_name(),
                project_id = %project_id,
                from_version = report.from_version,
                to_version = report.to_version,
                backfilled_entries = report.backfilled_entries,
                "migrated stored ledger on load"
            );
        }
        Ok(Some((ledger, report)))
    }

    /// Migrate the storage layout, then rewrite every stored ledger whose
    /// document is stale.
    ///
    /// # Errors
    /// Returns an error when any ledger fails to load, migrate or save.
    fn migrate_all(&mut self) -> Result<Vec<MigratedLedger>> {
        self.migrate_storage()?;
        let mut migrated = Vec::new();
        for project_id in self.list_projects()? {
            let Some((ledger, report)) = self.load_with_report(&project_id)? else {
                continue;
            };
            if report.changed() {
                self.save(&ledger)?;
                migrated.push(MigratedLedger { project_id, report });
            }
        }
        Ok(migrated)
    }
}

/// Version a persisted ledger document claims. Documents without a numeric
/// `schema_version` predate it.
#[must_use]
pub fn document_schema_version(document: &Value) -> u32 {
    document
        .get("schema_version")
        .and_then(Value::as_u64)
        .and_then(|version| u32::try_from(version).ok())
        .unwrap_or(1)
}

fn stale_ledgers(versions: &BTreeMap<ProjectId, u32>) -> Vec<ProjectId> {
    versions
        .iter()
        .filter(|(_, version)| **version < CURRENT_SCHEMA_VERSION)
        .map(|(project_id, _)| project_id.clone())
        .collect()
}

fn ledger_json(ledger: &ProjectLedger) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(ledger)
        .with_context(|| format!("failed to serialize ledger for {}", ledger.project_id))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
