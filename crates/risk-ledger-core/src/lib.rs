mod analysis;
mod compare;
mod identity;
mod ledger;
mod migrate;
mod period;
mod policy;
mod risk;

pub use analysis::{
    analyze_period, calibrate_early_stage, escalation_summary, validate_records, PeriodAnalysis,
};
pub use compare::{
    build_comparison_table, compare, detect_changes, detect_trend_escalations, leadership_summary,
    risk_history, snapshot_comparison, ChangeSummary, ComparisonReport, ComparisonRow,
    PeriodHeat, PeriodSnapshot, SnapshotComparison, SnapshotRisk, SnapshotSummary, Trend,
};
pub use identity::{resolve_identity, RiskIdentity};
pub use ledger::{
    Confidence, ConfidenceLevel, IngestSummary, LedgerEntry, ProjectLedger, Resolution,
    RiskStatus, CURRENT_SCHEMA_VERSION, RESOLUTION_REASON,
};
pub use migrate::{migrate_ledger_value, MigrationReport};
pub use period::{FixedClock, Period, PeriodClock, ProjectId, SystemClock};
pub use policy::{DecayPolicy, DecayThresholds};
pub use risk::{heat, AttentionLevel, Category, Heat, RawRiskRecord, RiskRecord, Severity};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("comparison requires at least two periods, {supplied} supplied")]
    InsufficientPeriods { supplied: usize },
    #[error("malformed risk record at index {index}: missing required field `{field}`")]
    MalformedRecord { index: usize, field: &'static str },
    #[error("invalid period label: {0:?}")]
    InvalidPeriod(String),
    #[error("period {period} is earlier than the last ingested period {last}")]
    OutOfOrderPeriod { period: Period, last: Period },
    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),
    #[error("invalid decay policy: {0}")]
    InvalidPolicy(String),
    #[error("ledger migration failed: {0}")]
    Migration(String),
}
