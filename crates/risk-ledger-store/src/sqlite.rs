use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use risk_ledger_core::{ProjectId, ProjectLedger, CURRENT_SCHEMA_VERSION};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

use crate::{
    document_schema_version, ledger_json, now_rfc3339, stale_ledgers, LedgerStore, SchemaStatus,
};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS project_ledgers (
  project_id TEXT PRIMARY KEY,
  document TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE project_ledgers ADD COLUMN schema_version INTEGER NOT NULL DEFAULT 1;
ALTER TABLE project_ledgers ADD COLUMN last_updated_period TEXT;

UPDATE project_ledgers
SET schema_version = COALESCE(json_extract(document, '$.schema_version'), 1),
    last_updated_period = COALESCE(
      json_extract(document, '$.last_updated_period'),
      json_extract(document, '$.last_updated_week')
    );

CREATE INDEX IF NOT EXISTS idx_project_ledgers_schema_version ON project_ledgers(schema_version);
";

/// Ledger store keeping one JSON document row per project in `SQLite`.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a `SQLite`-backed ledger store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for {}", path.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest table layout.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }
        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "project_ledgers")? {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "project_ledgers", "schema_version")? {
            // Current layout without migration rows.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        if table_has_column(&self.conn, "project_ledgers", "document")? {
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: project_ledgers has no document column"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "project_ledgers", "schema_version")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 2")?;
        tx.commit().context("failed to commit migration v2")?;

        info!(backend = "sqlite", version = 2, "applied table migration");
        Ok(())
    }

    fn stored_documents(&self) -> Result<BTreeMap<ProjectId, Value>> {
        let mut documents = BTreeMap::new();
        if !table_exists(&self.conn, "project_ledgers")? {
            return Ok(documents);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT project_id, document FROM project_ledgers ORDER BY project_id")
            .context("failed to prepare project_ledgers scan")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        for row in rows {
            let (raw_id, document) = row?;
            let project_id = ProjectId::parse(&raw_id)
                .with_context(|| format!("invalid project id in project_ledgers: {raw_id}"))?;
            let document = serde_json::from_str(&document)
                .with_context(|| format!("failed to parse stored ledger for {raw_id}"))?;
            documents.insert(project_id, document);
        }
        Ok(documents)
    }
}

impl LedgerStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn load_document(&self, project_id: &ProjectId) -> Result<Option<Value>> {
        if !table_exists(&self.conn, "project_ledgers")? {
            return Ok(None);
        }
        let document = self
            .conn
            .query_row(
                "SELECT document FROM project_ledgers WHERE project_id = ?1",
                params![project_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read stored ledger for {project_id}"))?;

        document
            .map(|raw| {
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse stored ledger for {project_id}"))
            })
            .transpose()
    }

    fn save(&mut self, ledger: &ProjectLedger) -> Result<()> {
        self.migrate()?;
        let document = String::from_utf8(ledger_json(ledger)?)
            .context("serialized ledger is not valid UTF-8")?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO project_ledgers(
                project_id, document, updated_at, schema_version, last_updated_period
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(project_id) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at,
                schema_version = excluded.schema_version,
                last_updated_period = excluded.last_updated_period",
            params![
                ledger.project_id.as_str(),
                document,
                now_rfc3339()?,
                i64::from(ledger.schema_version),
                ledger.last_updated_period.as_ref().map(|period| period.as_str().to_string()),
            ],
        )
        .with_context(|| format!("failed to upsert ledger for {}", ledger.project_id))?;
        tx.commit().context("failed to commit ledger save")?;

        info!(
            backend = "sqlite",
            project_id = %ledger.project_id,
            risks = ledger.risks.len(),
            "saved ledger"
        );
        Ok(())
    }

    fn list_projects(&self) -> Result<Vec<ProjectId>> {
        Ok(self.stored_documents()?.into_keys().collect())
    }

    fn migrate_storage(&mut self) -> Result<()> {
        self.migrate()
    }

    fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        let versions = self
            .stored_documents()?
            .into_iter()
            .map(|(project_id, document)| (project_id, document_schema_version(&document)))
            .collect();

        Ok(SchemaStatus {
            backend: self.backend_name().to_string(),
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
            ledger_schema_version: CURRENT_SCHEMA_VERSION,
            stale_ledgers: stale_ledgers(&versions),
        })
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }
    if !table_exists(conn, "project_ledgers")? {
        return Ok((0, false));
    }
    if table_has_column(conn, "project_ledgers", "schema_version")? {
        return Ok((2, true));
    }
    if table_has_column(conn, "project_ledgers", "document")? {
        return Ok((1, true));
    }
    Err(anyhow!("database schema is invalid: project_ledgers has no document column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
