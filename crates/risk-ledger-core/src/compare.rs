use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analysis::PeriodAnalysis;
use crate::identity::RiskIdentity;
use crate::period::Period;
use crate::risk::{AttentionLevel, Category, Heat, RiskRecord, Severity};
use crate::LedgerError;

const NO_TOP_RISK: &str = "None";
const NO_CHANGES_SENTENCE: &str =
    "No material changes or escalation trends detected across updates.";
const TREND_WINDOW: usize = 3;

/// One risk as seen in a single period, keyed by identity in [`PeriodSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotRisk {
    pub display_name: String,
    pub category: Category,
    pub severity: Option<Severity>,
    pub attention_level: AttentionLevel,
    pub heat: Heat,
    pub owner: Option<String>,
}

impl SnapshotRisk {
    #[must_use]
    pub fn from_record(record: &RiskRecord) -> Self {
        Self {
            display_name: record.description().to_string(),
            category: record.category(),
            severity: Some(record.severity()),
            attention_level: record.attention_level(),
            heat: record.heat(),
            owner: Some(record.suggested_owner().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PeriodSnapshot {
    pub period: Option<Period>,
    pub risks: BTreeMap<RiskIdentity, SnapshotRisk>,
    #[serde(default)]
    pub escalations: Vec<String>,
}

impl PeriodSnapshot {
    /// Group one period's records by identity. A later record for the same
    /// identity replaces an earlier one.
    #[must_use]
    pub fn from_records(
        period: Option<Period>,
        records: &[RiskRecord],
        escalations: Vec<String>,
    ) -> Self {
        let mut risks = BTreeMap::new();
        for record in records {
            risks.insert(record.identity(), SnapshotRisk::from_record(record));
        }
        Self { period, risks, escalations }
    }

    #[must_use]
    pub fn from_analysis(analysis: &PeriodAnalysis) -> Self {
        Self::from_records(
            analysis.period.clone(),
            &analysis.records,
            analysis.escalation_summary.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotSummary {
    pub escalation: bool,
    pub highest_risk_heat: Heat,
    pub top_risk: String,
}

impl SnapshotSummary {
    fn of(snapshot: &PeriodSnapshot) -> Self {
        // Strict `>` keeps the first maximum, i.e. the smallest identity.
        let mut top: Option<&SnapshotRisk> = None;
        for risk in snapshot.risks.values() {
            if top.map_or(true, |current| risk.heat > current.heat) {
                top = Some(risk);
            }
        }

        Self {
            escalation: !snapshot.escalations.is_empty(),
            highest_risk_heat: top.map_or(Heat::Low, |risk| risk.heat),
            top_risk: top.map_or_else(|| NO_TOP_RISK.to_string(), |risk| risk.display_name.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotComparison {
    pub previous: SnapshotSummary,
    pub current: SnapshotSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangeSummary {
    pub new: Vec<String>,
    pub escalated: Vec<String>,
    pub de_escalated: Vec<String>,
    pub unchanged: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum Trend {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PeriodHeat {
    pub label: String,
    pub heat: Option<Heat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComparisonRow {
    pub risk_id: RiskIdentity,
    pub risk: String,
    pub heats: Vec<PeriodHeat>,
    pub trend: Trend,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComparisonReport {
    pub periods: Vec<Option<Period>>,
    pub snapshot: SnapshotComparison,
    pub change_summary: ChangeSummary,
    pub trend_escalation: Vec<String>,
    pub risk_comparison_table: Vec<ComparisonRow>,
    pub leadership_summary: String,
}

#[must_use]
pub fn snapshot_comparison(
    previous: &PeriodSnapshot,
    current: &PeriodSnapshot,
) -> SnapshotComparison {
    SnapshotComparison {
        previous: SnapshotSummary::of(previous),
        current: SnapshotSummary::of(current),
    }
}

/// Classify every identity of `current` against `previous`. Lists are in
/// identity order.
#[must_use]
pub fn detect_changes(previous: &PeriodSnapshot, current: &PeriodSnapshot) -> ChangeSummary {
    let mut changes = ChangeSummary::default();

    for (identity, risk) in &current.risks {
        let Some(before) = previous.risks.get(identity) else {
            changes.new.push(risk.display_name.clone());
            continue;
        };
        let transition = format!("{} ({} → {})", risk.display_name, before.heat, risk.heat);
        if risk.heat > before.heat {
            changes.escalated.push(transition);
        } else if risk.heat < before.heat {
            changes.de_escalated.push(transition);
        } else {
            changes.unchanged.push(risk.display_name.clone());
        }
    }

    changes
}

/// Per-identity observations across `snapshots`, oldest first. Periods where
/// an identity is absent are skipped, not padded.
#[must_use]
pub fn risk_history(snapshots: &[PeriodSnapshot]) -> BTreeMap<RiskIdentity, Vec<SnapshotRisk>> {
    let mut history: BTreeMap<RiskIdentity, Vec<SnapshotRisk>> = BTreeMap::new();
    for snapshot in snapshots {
        for (identity, risk) in &snapshot.risks {
            history.entry(identity.clone()).or_default().push(risk.clone());
        }
    }
    history
}

/// Flag identities whose last three observed heats read `a <= b < c`.
#[must_use]
pub fn detect_trend_escalations(
    history: &BTreeMap<RiskIdentity, Vec<SnapshotRisk>>,
) -> Vec<String> {
    history
        .values()
        .filter_map(|states| {
            let window = states.get(states.len().checked_sub(TREND_WINDOW)?..)?;
            let (oldest, middle, latest) = (window[0].heat, window[1].heat, window[2].heat);
            (latest > middle && middle >= oldest)
                .then(|| format!("{} escalated in recent updates", window[2].display_name))
        })
        .collect()
}

/// One row per identity seen in any snapshot, columns labelled `U1..Un`.
///
/// The row trend compares only the first and last heat the risk actually
/// has, so a dip in between does not show up here.
#[must_use]
pub fn build_comparison_table(snapshots: &[PeriodSnapshot]) -> Vec<ComparisonRow> {
    let mut names: BTreeMap<&RiskIdentity, &str> = BTreeMap::new();
    for snapshot in snapshots {
        for (identity, risk) in &snapshot.risks {
            names.insert(identity, &risk.display_name);
        }
    }

    names
        .into_iter()
        .map(|(identity, name)| {
            let heats: Vec<PeriodHeat> = snapshots
                .iter()
                .enumerate()
                .map(|(index, snapshot)| PeriodHeat {
                    label: format!("U{}", index + 1),
                    heat: snapshot.risks.get(identity).map(|risk| risk.heat),
                })
                .collect();

            let mut present = heats.iter().filter_map(|cell| cell.heat);
            let first = present.next();
            let last = present.last().or(first);
            let trend = match (first, last) {
                (Some(first), Some(last)) if last > first => Trend::Up,
                (Some(first), Some(last)) if last < first => Trend::Down,
                _ => Trend::Stable,
            };

            ComparisonRow { risk_id: identity.clone(), risk: name.to_string(), heats, trend }
        })
        .collect()
}

#[must_use]
pub fn leadership_summary(changes: &ChangeSummary, trend_escalations: &[String]) -> String {
    let mut lines = Vec::new();
    if !changes.escalated.is_empty() {
        lines.push(format!(
            "{} risk(s) have escalated since the last update.",
            changes.escalated.len()
        ));
    }
    if !trend_escalations.is_empty() {
        lines.push(format!(
            "{} risk(s) show sustained escalation trends.",
            trend_escalations.len()
        ));
    }
    if lines.is_empty() {
        return NO_CHANGES_SENTENCE.to_string();
    }
    lines.join(" ")
}

/// Compare an ordered run of period snapshots, oldest first.
///
/// The snapshot and change summary look at the last two periods; trends and
/// the table span all of them.
///
/// # Errors
/// Returns [`LedgerError::InsufficientPeriods`] for fewer than two snapshots.
pub fn compare(snapshots: &[PeriodSnapshot]) -> Result<ComparisonReport, LedgerError> {
    let [.., previous, current] = snapshots else {
        return Err(LedgerError::InsufficientPeriods { supplied: snapshots.len() });
    };

    let change_summary = detect_changes(previous, current);
    let trend_escalation = detect_trend_escalations(&risk_history(snapshots));
    let leadership_summary = leadership_summary(&change_summary, &trend_escalation);

    Ok(ComparisonReport {
        periods: snapshots.iter().map(|snapshot| snapshot.period.clone()).collect(),
        snapshot: snapshot_comparison(previous, current),
        change_summary,
        trend_escalation,
        risk_comparison_table: build_comparison_table(snapshots),
        leadership_summary,
    })
}
