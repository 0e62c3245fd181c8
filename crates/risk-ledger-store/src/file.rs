use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use risk_ledger_core::{ProjectId, ProjectLedger, CURRENT_SCHEMA_VERSION};
use serde_json::Value;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::{document_schema_version, ledger_json, stale_ledgers, LedgerStore, SchemaStatus};

const FILE_PREFIX: &str = "project_";
const FILE_SUFFIX: &str = ".json";
// One document per project; the directory layout itself has never changed.
const FILE_LAYOUT_VERSION: i64 = 1;

/// Ledger store keeping one pretty-printed JSON document per project.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// # Errors
    /// Returns an error when the store directory cannot be created.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create ledger directory {}", dir.display()))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    #[must_use]
    pub fn ledger_path(&self, project_id: &ProjectId) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{project_id}{FILE_SUFFIX}"))
    }

    fn stored_versions(&self) -> Result<BTreeMap<ProjectId, u32>> {
        let mut versions = BTreeMap::new();
        for project_id in self.list_projects()? {
            if let Some(document) = self.load_document(&project_id)? {
                versions.insert(project_id, document_schema_version(&document));
            }
        }
        Ok(versions)
    }
}

impl LedgerStore for JsonFileStore {
    fn backend_name(&self) -> &'static str {
        "json"
    }

    fn load_document(&self, project_id: &ProjectId) -> Result<Option<Value>> {
        let path = self.ledger_path(project_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read ledger file {}", path.display()))?;
        let document = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse ledger JSON {}", path.display()))?;
        Ok(Some(document))
    }

    fn save(&mut self, ledger: &ProjectLedger) -> Result<()> {
        let path = self.ledger_path(&ledger.project_id);
        write_atomic(&path, &ledger_json(ledger)?)?;
        info!(
            backend = "json",
            project_id = %ledger.project_id,
            risks = ledger.risks.len(),
            path = %path.display(),
            "saved ledger"
        );
        Ok(())
    }

    fn list_projects(&self) -> Result<Vec<ProjectId>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list ledger directory {}", self.dir.display()))?;

        let mut projects = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read entry in ledger directory {}", self.dir.display())
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(raw_id) =
                name.strip_prefix(FILE_PREFIX).and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            else {
                continue;
            };
            match ProjectId::parse(raw_id) {
                Ok(project_id) => projects.push(project_id),
                Err(err) => warn!(file = name, error = %err, "skipping unrecognised ledger file"),
            }
        }
        projects.sort();
        Ok(projects)
    }

    fn schema_status(&self) -> Result<SchemaStatus> {
        Ok(SchemaStatus {
            backend: self.backend_name().to_string(),
            current_version: FILE_LAYOUT_VERSION,
            target_version: FILE_LAYOUT_VERSION,
            pending_versions: Vec::new(),
            inferred_from_legacy: false,
            ledger_schema_version: CURRENT_SCHEMA_VERSION,
            stale_ledgers: stale_ledgers(&self.stored_versions()?),
        })
    }
}

/// Write `bytes` to `path` through a synced sibling temp file and a rename, so
/// readers see either the old document or the new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(path, bytes, |from, to| fs::rename(from, to))
}

fn write_atomic_with<F>(path: &Path, bytes: &[u8], rename: F) -> Result<()>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("atomic write target has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("ledger");
    let tmp = parent.join(format!(".{file_name}.tmp.{}", Ulid::new()));

    let written = write_synced(&tmp, bytes).and_then(|()| {
        rename(&tmp, path).with_context(|| {
            format!("failed to move {} into place at {}", tmp.display(), path.display())
        })
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    // Persist the rename itself; not every platform lets a directory be synced.
    if let Ok(dir) = File::open(parent) {
        if let Err(err) = dir.sync_all() {
            debug!(dir = %parent.display(), error = %err, "directory fsync skipped");
        }
    }
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("failed to create temp file {}", path.display()))?;
    file.write_all(bytes).with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all().with_context(|| format!("failed to sync {}", path.display()))?;
    Ok(())
}
