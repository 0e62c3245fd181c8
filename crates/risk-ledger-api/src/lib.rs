use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use risk_ledger_core::{
    analyze_period, compare, ComparisonReport, DecayPolicy, IngestSummary, Period, PeriodClock,
    PeriodSnapshot, ProjectId, ProjectLedger, RawRiskRecord, SystemClock,
};
use risk_ledger_store::{
    export_ledgers, import_ledgers, ExportManifest, ImportSummary, JsonFileStore, LedgerStore,
    MigratedLedger, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const SQLITE_FILE_NAME: &str = "risk_ledger.sqlite3";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

impl StoreBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Sqlite => "sqlite",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend `{other}`, expected `json` or `sqlite`")),
        }
    }
}

/// Where ledgers live. For `Sqlite`, a `path` without an extension is treated
/// as a directory holding `risk_ledger.sqlite3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl StoreConfig {
    #[must_use]
    pub fn new(backend: StoreBackend, path: PathBuf) -> Self {
        Self { backend, path }
    }

    #[must_use]
    pub fn sqlite_file(&self) -> PathBuf {
        if self.path.extension().is_some() {
            self.path.clone()
        } else {
            self.path.join(SQLITE_FILE_NAME)
        }
    }

    /// # Errors
    /// Returns an error when the backing directory or database cannot be opened.
    pub fn open(&self) -> Result<Box<dyn LedgerStore>> {
        let store: Box<dyn LedgerStore> = match self.backend {
            StoreBackend::Json => Box::new(JsonFileStore::open(&self.path)?),
            StoreBackend::Sqlite => Box::new(SqliteStore::open(&self.sqlite_file())?),
        };
        Ok(store)
    }
}

/// Load a decay policy from YAML. Keys left out keep their defaults.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, or the policy is invalid.
pub fn load_policy(path: &Path) -> Result<DecayPolicy> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read decay policy {}", path.display()))?;
    let policy: DecayPolicy = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse decay policy {}", path.display()))?;
    policy.validate()?;
    Ok(policy)
}

/// One period's extracted risks as handed over by the extraction step.
///
/// `records` is required and unknown keys are rejected. An empty period is
/// sent as `"records": []`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PeriodUpdate {
    #[serde(default)]
    pub period: Option<String>,
    pub records: Vec<RawRiskRecord>,
    #[serde(default)]
    pub update_text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CompareRequest {
    pub updates: Vec<PeriodUpdate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LedgerCompareRequest {
    #[serde(default)]
    pub last_n: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResult {
    pub project_id: ProjectId,
    pub summary: IngestSummary,
    pub escalation_summary: Vec<String>,
    pub tracked_risks: usize,
    pub active_risks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub before: SchemaStatus,
    pub migrated: Vec<MigratedLedger>,
    pub after: Option<SchemaStatus>,
}

/// Storage-agnostic facade over the ledger core and a record store.
///
/// Every call opens the configured store afresh. Mutations of one project run
/// `load -> ingest -> save` under that project's in-process lock; writers in
/// other processes are not coordinated.
#[derive(Debug, Clone)]
pub struct RiskLedgerApi {
    store: StoreConfig,
    policy: DecayPolicy,
    clock: Arc<dyn PeriodClock>,
    locks: Arc<Mutex<BTreeMap<ProjectId, Arc<Mutex<()>>>>>,
}

impl RiskLedgerApi {
    #[must_use]
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            policy: DecayPolicy::default(),
            clock: Arc::new(SystemClock),
            locks: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// # Errors
    /// Returns an error when the policy fails validation.
    pub fn with_policy(mut self, policy: DecayPolicy) -> Result<Self> {
        policy.validate()?;
        self.policy = policy;
        Ok(self)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl PeriodClock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    #[must_use]
    pub fn store_config(&self) -> &StoreConfig {
        &self.store
    }

    /// Inspect storage and ledger schema versions without mutating anything.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.store.open()?.schema_status()
    }

    /// Migrate the storage layout and rewrite stale ledgers, or only report
    /// what would change in dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.store.open()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult { dry_run, before, migrated: Vec::new(), after: None });
        }

        let migrated = store.migrate_all()?;
        let after = store.schema_status()?;
        info!(backend = store.backend_name(), migrated = migrated.len(), "migrated store");
        Ok(MigrateResult { dry_run, before, migrated, after: Some(after) })
    }

    /// # Errors
    /// Returns an error when the store cannot be listed.
    pub fn list_projects(&self) -> Result<Vec<ProjectId>> {
        self.store.open()?.list_projects()
    }

    /// Current ledger for a project, empty if it was never ingested.
    ///
    /// # Errors
    /// Returns an error for an invalid project id or an unreadable ledger.
    pub fn show_ledger(&self, project_id: &str) -> Result<ProjectLedger> {
        let project_id = ProjectId::parse(project_id)?;
        self.store.open()?.load(&project_id)
    }

    /// Validate, calibrate and ingest one period for a project, then persist.
    ///
    /// Without a period label the clock's current period is used.
    ///
    /// # Errors
    /// Returns an error for an invalid project id, period or record, an
    /// out-of-order period, or a store failure. Nothing is saved on error.
    pub fn ingest(&self, project_id: &str, update: PeriodUpdate) -> Result<IngestResult> {
        let project_id = ProjectId::parse(project_id)?;
        let period = match update.period.as_deref() {
            Some(label) => Period::parse(label)?,
            None => self.clock.current_period(),
        };
        let analysis =
            analyze_period(&update.records, update.update_text.as_deref(), Some(period.clone()))?;

        let lock = self.project_lock(&project_id)?;
        let _guard = lock.lock().map_err(|_| anyhow!("project lock poisoned for {project_id}"))?;

        let mut store = self.store.open()?;
        let mut ledger = store.load(&project_id)?;
        let summary = ledger.ingest(&analysis.records, &period, &self.policy)?;
        store.save(&ledger)?;

        info!(
            project_id = %project_id,
            period = %period,
            replay = summary.replay,
            created = summary.created.len(),
            updated = summary.updated.len(),
            decayed = summary.decayed.len(),
            resolved = summary.resolved.len(),
            recurred = summary.recurred.len(),
            "ingested period"
        );

        Ok(IngestResult {
            project_id,
            summary,
            escalation_summary: analysis.escalation_summary,
            tracked_risks: ledger.risks.len(),
            active_risks: ledger.active_entries().count(),
        })
    }

    /// Compare an ordered list of period updates, oldest first, without
    /// touching any ledger.
    ///
    /// # Errors
    /// Returns an error for fewer than two updates or an invalid record or period.
    pub fn compare_updates(&self, request: CompareRequest) -> Result<ComparisonReport> {
        let mut snapshots = Vec::with_capacity(request.updates.len());
        for update in &request.updates {
            let period = update.period.as_deref().map(Period::parse).transpose()?;
            let analysis = analyze_period(&update.records, update.update_text.as_deref(), period)?;
            snapshots.push(PeriodSnapshot::from_analysis(&analysis));
        }
        Ok(compare(&snapshots)?)
    }

    /// Compare the periods recorded in a project's ledger, optionally only the
    /// last `last_n`.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be loaded or holds fewer than
    /// two periods in range.
    pub fn compare_ledger(
        &self,
        project_id: &str,
        request: LedgerCompareRequest,
    ) -> Result<ComparisonReport> {
        let ledger = self.show_ledger(project_id)?;
        let snapshots = ledger.period_snapshots(request.last_n);
        Ok(compare(&snapshots)?)
    }

    /// # Errors
    /// Returns an error when any ledger cannot be loaded or written out.
    pub fn export(&self, out_dir: &Path) -> Result<ExportManifest> {
        let store = self.store.open()?;
        export_ledgers(store.as_ref(), out_dir)
    }

    /// # Errors
    /// Returns an error when the manifest does not verify or a save fails.
    pub fn import(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        let mut store = self.store.open()?;
        import_ledgers(store.as_mut(), in_dir, skip_existing)
    }

    fn project_lock(&self, project_id: &ProjectId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| anyhow!("project lock registry poisoned"))?;
        Ok(Arc::clone(locks.entry(project_id.clone()).or_default()))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use risk_ledger_core::{FixedClock, Heat, RiskIdentity, RESOLUTION_REASON};
    use serde_json::json;

    use super::*;

    fn api_in(dir: &Path, backend: StoreBackend) -> RiskLedgerApi {
        RiskLedgerApi::new(StoreConfig::new(backend, dir.to_path_buf()))
    }

    fn update(period: &str, records: Vec<RawRiskRecord>) -> PeriodUpdate {
        PeriodUpdate { period: Some(period.to_string()), records, update_text: None }
    }

    fn vendor(severity: &str, attention: &str) -> RawRiskRecord {
        RawRiskRecord::new("Vendor contract unsigned", "Schedule", severity, attention)
            .with_owner("Vendor Manager")
    }

    #[test]
    fn ingest_decays_and_resolves_across_calls() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Json);

        api.ingest("apollo", update("2026-W01", vec![vendor("High", "Immediate")]))?;
        for week in 2..=6 {
            api.ingest("apollo", update(&format!("2026-W{week:02}"), Vec::new()))?;
        }

        let ledger = api.show_ledger("apollo")?;
        let entry = ledger
            .risks
            .get(&RiskIdentity::new("vendor_dependency"))
            .ok_or_else(|| anyhow!("vendor entry missing"))?;
        assert!(entry.resolution.is_resolved);
        assert_eq!(entry.resolution.resolution_reason.as_deref(), Some(RESOLUTION_REASON));
        assert_eq!(api.list_projects()?, vec![ProjectId::parse("apollo")?]);
        Ok(())
    }

    #[test]
    fn malformed_record_leaves_ledger_untouched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Sqlite);
        api.ingest("apollo", update("2026-W01", vec![vendor("High", "Immediate")]))?;
        let before = api.show_ledger("apollo")?;

        let mut broken = vendor("High", "Immediate");
        broken.description = None;
        let records = vec![vendor("Low", "Monitor"), broken];
        let Err(err) = api.ingest("apollo", update("2026-W02", records)) else {
            return Err(anyhow!("expected malformed record to fail ingestion"));
        };
        assert!(err.to_string().contains("index 1"));
        assert_eq!(api.show_ledger("apollo")?, before);
        Ok(())
    }

    #[test]
    fn missing_period_uses_clock() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Json)
            .with_clock(FixedClock(Period::parse("2026-W09")?));
        let result = api.ingest(
            "apollo",
            PeriodUpdate {
                period: None,
                records: vec![vendor("Medium", "Near-term")],
                update_text: None,
            },
        )?;
        assert_eq!(result.summary.period.as_str(), "2026-W09");
        assert_eq!(result.tracked_risks, 1);
        Ok(())
    }

    #[test]
    fn update_without_records_key_is_rejected_before_ingest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Json);
        let slipping = RawRiskRecord::new("Release slipping", "Schedule", "Low", "Monitor");
        api.ingest("apollo", update("2026-W01", vec![slipping]))?;
        let before = api.show_ledger("apollo")?;

        let record = json!({
            "description": "Release slipping",
            "category": "Schedule",
            "severity": "Low",
            "attention_level": "Monitor"
        });
        let misnamed = json!({ "period": "2026-W02", "risks": [record.clone()] });
        let Err(err) = serde_json::from_value::<PeriodUpdate>(misnamed) else {
            return Err(anyhow!("expected a `risks` key to be rejected"));
        };
        assert!(err.to_string().contains("unknown field `risks`"));

        let without_records = json!({ "period": "2026-W02" });
        let Err(err) = serde_json::from_value::<PeriodUpdate>(without_records) else {
            return Err(anyhow!("expected an update without records to be rejected"));
        };
        assert!(err.to_string().contains("missing field `records`"));

        let mut with_heat = record;
        with_heat["heat"] = json!("High");
        let Err(err) = serde_json::from_value::<PeriodUpdate>(json!({ "records": [with_heat] }))
        else {
            return Err(anyhow!("expected an unknown record field to be rejected"));
        };
        assert!(err.to_string().contains("unknown field `heat`"));
        assert_eq!(api.show_ledger("apollo")?, before);

        let empty: PeriodUpdate =
            serde_json::from_value(json!({ "period": "2026-W02", "records": [] }))?;
        let result = api.ingest("apollo", empty)?;
        assert_eq!(result.summary.decayed.len(), 1);
        Ok(())
    }

    #[test]
    fn out_of_order_period_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Json);
        api.ingest("apollo", update("2026-W05", vec![vendor("High", "Immediate")]))?;
        let Err(err) = api.ingest("apollo", update("2026-W04", Vec::new())) else {
            return Err(anyhow!("expected earlier period to be rejected"));
        };
        assert!(err.to_string().contains("earlier than the last ingested period"));
        Ok(())
    }

    #[test]
    fn compare_updates_reports_escalation_and_trend() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Json);
        let request = CompareRequest {
            updates: vec![
                update("2026-W01", vec![vendor("Low", "Monitor")]),
                update("2026-W02", vec![vendor("Medium", "Near-term")]),
                update("2026-W03", vec![vendor("High", "Immediate")]),
            ],
        };

        let report = api.compare_updates(request)?;
        assert_eq!(
            report.change_summary.escalated,
            vec!["Vendor contract unsigned (Medium → High)".to_string()]
        );
        assert_eq!(report.trend_escalation.len(), 1);
        assert!(report.snapshot.current.escalation);
        assert_eq!(report.snapshot.current.highest_risk_heat, Heat::High);
        assert_eq!(
            report.leadership_summary,
            "1 risk(s) have escalated since the last update. 1 risk(s) show sustained escalation trends."
        );

        let single = CompareRequest { updates: vec![update("2026-W01", Vec::new())] };
        let Err(err) = api.compare_updates(single) else {
            return Err(anyhow!("expected a single update to be rejected"));
        };
        assert!(err.to_string().contains("at least two periods"));
        Ok(())
    }

    #[test]
    fn compare_ledger_uses_recorded_periods() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Sqlite);
        api.ingest("apollo", update("2026-W01", vec![vendor("Medium", "Near-term")]))?;
        api.ingest("apollo", update("2026-W02", vec![vendor("High", "Immediate")]))?;

        let report = api.compare_ledger("apollo", LedgerCompareRequest::default())?;
        assert_eq!(report.change_summary.escalated.len(), 1);
        assert_eq!(report.risk_comparison_table.len(), 1);

        let Err(_) = api.compare_ledger("apollo", LedgerCompareRequest { last_n: Some(1) }) else {
            return Err(anyhow!("expected one recorded period to be insufficient"));
        };
        Ok(())
    }

    #[test]
    fn concurrent_ingests_for_one_project_lose_no_updates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Json);
        let records = [
            RawRiskRecord::new("Vendor contract unsigned", "Schedule", "High", "Immediate"),
            RawRiskRecord::new("Team morale dropping", "People", "Medium", "Near-term"),
            RawRiskRecord::new("Budget overrun", "Cost", "Low", "Monitor"),
            RawRiskRecord::new("Quality gate failures", "Quality", "High", "Near-term"),
            RawRiskRecord::new("Release date slipping", "Schedule", "Medium", "Immediate"),
            RawRiskRecord::new("Hiring freeze", "People", "Low", "Monitor"),
            RawRiskRecord::new("Scope unclear", "Risk", "Low", "Monitor"),
        ];

        let handles = records
            .into_iter()
            .map(|record| {
                let api = api.clone();
                thread::spawn(move || api.ingest("apollo", update("2026-W01", vec![record])))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().map_err(|_| anyhow!("ingest thread panicked"))??;
        }

        assert_eq!(api.show_ledger("apollo")?.risks.len(), 7);
        Ok(())
    }

    #[test]
    fn migrate_dry_run_reports_without_writing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let api = api_in(dir.path(), StoreBackend::Sqlite);
        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.before.pending_versions, vec![1, 2]);
        assert!(planned.after.is_none());

        let applied = api.migrate(false)?;
        let after = applied.after.ok_or_else(|| anyhow!("missing post-migration status"))?;
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn policy_yaml_overrides_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("policy.yaml");
        fs::write(
            &path,
            "resolution_absence_threshold: 3\nlow:\n  medium_after: 1\n  low_after: 2\n",
        )?;

        let policy = load_policy(&path)?;
        assert_eq!(policy.resolution_absence_threshold, 3);
        assert_eq!(policy.low.low_after, 2);
        assert_eq!(policy.high, DecayPolicy::default().high);

        fs::write(&path, "resolution_absence_threshold: 0\n")?;
        assert!(load_policy(&path).is_err());
        Ok(())
    }

    #[test]
    fn export_then_import_into_other_backend() -> Result<()> {
        let source_dir = tempfile::tempdir()?;
        let export_dir = tempfile::tempdir()?;
        let target_dir = tempfile::tempdir()?;
        let source = api_in(source_dir.path(), StoreBackend::Json);
        source.ingest("apollo", update("2026-W01", vec![vendor("High", "Immediate")]))?;

        let manifest = source.export(export_dir.path())?;
        assert_eq!(manifest.files.len(), 1);

        let target = api_in(target_dir.path(), StoreBackend::Sqlite);
        let summary = target.import(export_dir.path(), false)?;
        assert_eq!(summary.imported, vec![ProjectId::parse("apollo")?]);
        assert_eq!(target.show_ledger("apollo")?, source.show_ledger("apollo")?);
        Ok(())
    }
}
