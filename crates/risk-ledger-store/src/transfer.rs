use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use risk_ledger_core::{migrate_ledger_value, ProjectId, CURRENT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::file::write_atomic;
use crate::{ledger_json, now_rfc3339, LedgerStore};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub project_id: ProjectId,
    pub sha256: String,
    pub risks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub exported_at: String,
    pub backend: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: Vec<ProjectId>,
    pub skipped_existing: Vec<ProjectId>,
    pub migrated: usize,
}

/// Write every stored ledger, migrated to the current shape, into `out_dir`
/// as `project_<id>.json` plus a `manifest.json` of sha256 digests.
///
/// # Errors
/// Returns an error when a ledger cannot be loaded or an export file cannot be written.
pub fn export_ledgers<S>(store: &S, out_dir: &Path) -> Result<ExportManifest>
where
    S: LedgerStore + ?Sized,
{
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

    let mut files = Vec::new();
    for project_id in store.list_projects()? {
        let ledger = store.load(&project_id)?;
        let bytes = ledger_json(&ledger)?;
        let path = format!("project_{project_id}.json");
        write_atomic(&out_dir.join(&path), &bytes)?;
        files.push(ExportFileDigest {
            path,
            project_id,
            sha256: sha256_hex(&bytes),
            risks: ledger.risks.len(),
        });
    }

    let manifest = ExportManifest {
        schema_version: CURRENT_SCHEMA_VERSION,
        exported_at: now_rfc3339()?,
        backend: store.backend_name().to_string(),
        files,
    };
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
    write_atomic(&out_dir.join(MANIFEST_FILE), &manifest_json)?;

    info!(
        backend = store.backend_name(),
        out_dir = %out_dir.display(),
        ledgers = manifest.files.len(),
        "exported ledgers"
    );
    Ok(manifest)
}

/// Import an export directory into `store` after verifying every digest.
///
/// Existing projects are skipped when `skip_existing` is set and rejected
/// otherwise. Nothing is written unless the whole manifest verifies.
///
/// # Errors
/// Returns an error when the manifest is unreadable or inconsistent, a ledger
/// fails to migrate, a project already exists without `skip_existing`, or a
/// save fails.
pub fn import_ledgers<S>(store: &mut S, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary>
where
    S: LedgerStore + ?Sized,
{
    let manifest_path = in_dir.join(MANIFEST_FILE);
    let manifest_bytes = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
    let manifest: ExportManifest = serde_json::from_slice(&manifest_bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", manifest_path.display()))?;
    validate_import_manifest(in_dir, &manifest)?;

    let existing: BTreeSet<ProjectId> = store.list_projects()?.into_iter().collect();
    let mut staged = Vec::new();
    let mut summary = ImportSummary::default();

    for file in &manifest.files {
        if existing.contains(&file.project_id) {
            if skip_existing {
                summary.skipped_existing.push(file.project_id.clone());
                continue;
            }
            return Err(anyhow!("ledger already exists for project {}", file.project_id));
        }

        let file_path = in_dir.join(&file.path);
        let bytes = fs::read(&file_path)
            .with_context(|| format!("failed to read export file {}", file_path.display()))?;
        let document = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse export file {}", file_path.display()))?;
        let (ledger, report) = migrate_ledger_value(document)
            .with_context(|| format!("failed to migrate export file {}", file.path))?;
        if ledger.project_id != file.project_id {
            return Err(anyhow!(
                "export file {} holds project {} but the manifest names {}",
                file.path,
                ledger.project_id,
                file.project_id
            ));
        }
        if report.changed() {
            summary.migrated += 1;
        }
        staged.push(ledger);
    }

    for ledger in staged {
        store.save(&ledger)?;
        summary.imported.push(ledger.project_id);
    }

    info!(
        backend = store.backend_name(),
        in_dir = %in_dir.display(),
        imported = summary.imported.len(),
        skipped = summary.skipped_existing.len(),
        "imported ledgers"
    );
    Ok(summary)
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version == 0 || manifest.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            CURRENT_SCHEMA_VERSION
        ));
    }

    let mut paths = BTreeSet::new();
    let mut projects = BTreeSet::new();
    for file in &manifest.files {
        if !paths.insert(file.path.as_str()) {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
        if !projects.insert(&file.project_id) {
            return Err(anyhow!("manifest lists project {} twice", file.project_id));
        }
        if file.path.contains('/') || file.path.contains('\\') || file.path.contains("..") {
            return Err(anyhow!("manifest file entry escapes the export directory: {}", file.path));
        }

        let file_path = in_dir.join(&file.path);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }
        let bytes = fs::read(&file_path)
            .with_context(|| format!("failed to read export file {}", file_path.display()))?;
        let actual = sha256_hex(&bytes);
        if actual != file.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {}: expected {}, got {}",
                file.path,
                file.sha256,
                actual
            ));
        }
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
