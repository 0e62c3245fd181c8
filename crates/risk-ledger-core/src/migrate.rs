use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::RiskIdentity;
use crate::ledger::{
    Confidence, ConfidenceLevel, LedgerEntry, ProjectLedger, Resolution, RiskStatus,
    CURRENT_SCHEMA_VERSION,
};
use crate::period::{Period, ProjectId};
use crate::risk::{AttentionLevel, Category, Heat};
use crate::LedgerError;

const LEGACY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub backfilled_entries: usize,
}

impl MigrationReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from_version != self.to_version || self.backfilled_entries > 0
    }
}

/// Upgrade a persisted ledger document of any known version to the current
/// shape.
///
/// Legacy week-based keys are renamed, missing fields are backfilled from the
/// ones that exist, and unknown keys are dropped. Recorded histories are kept
/// as they are, even when they are longer than the recoverable period list.
///
/// # Errors
/// Returns [`LedgerError::Migration`] when the document or one of its entries
/// is not a JSON object, when an entry has no seen period at all, or when the
/// document claims a newer schema than this build understands.
pub fn migrate_ledger_value(value: Value) -> Result<(ProjectLedger, MigrationReport), LedgerError> {
    let Value::Object(document) = value else {
        return Err(LedgerError::Migration("ledger document is not a JSON object".to_string()));
    };

    let from_version = document_version(&document)?;
    if from_version > CURRENT_SCHEMA_VERSION {
        return Err(LedgerError::Migration(format!(
            "schema_version {from_version} is newer than supported version {CURRENT_SCHEMA_VERSION}"
        )));
    }

    let project_id = match text(&document, &["project_id"]) {
        Some(raw) => ProjectId::parse(raw)?,
        None => return Err(LedgerError::Migration("ledger document has no project_id".to_string())),
    };
    let last_updated_period = period(&document, &["last_updated_period", "last_updated_week"]);

    let mut risks = BTreeMap::new();
    let mut backfilled_entries = 0;
    match document.get("risks") {
        None | Some(Value::Null) => {}
        Some(Value::Object(entries)) => {
            for (key, entry) in entries {
                let Value::Object(fields) = entry else {
                    return Err(LedgerError::Migration(format!(
                        "ledger entry {key:?} is not a JSON object"
                    )));
                };
                let (entry, backfilled) = migrate_entry(key, fields)?;
                if backfilled {
                    backfilled_entries += 1;
                }
                risks.insert(entry.identity.clone(), entry);
            }
        }
        Some(_) => {
            return Err(LedgerError::Migration("ledger `risks` is not a JSON object".to_string()));
        }
    }

    let ledger = ProjectLedger {
        schema_version: CURRENT_SCHEMA_VERSION,
        project_id,
        last_updated_period,
        risks,
    };
    let report = MigrationReport {
        from_version,
        to_version: CURRENT_SCHEMA_VERSION,
        backfilled_entries,
    };
    Ok((ledger, report))
}

fn document_version(document: &Map<String, Value>) -> Result<u32, LedgerError> {
    if let Some(version) = document.get("schema_version").and_then(Value::as_u64) {
        return u32::try_from(version)
            .map_err(|_| LedgerError::Migration(format!("schema_version {version} out of range")));
    }
    // v1 documents carried a dotted `memory_version` string instead.
    Ok(LEGACY_SCHEMA_VERSION)
}

fn migrate_entry(
    key: &str,
    fields: &Map<String, Value>,
) -> Result<(LedgerEntry, bool), LedgerError> {
    let identity = RiskIdentity::new(key);
    let mut backfilled = false;

    let first_seen = period(fields, &["first_seen_period", "first_seen_week"]);
    let last_seen = period(fields, &["last_seen_period", "last_seen_week"]);
    let (first_seen_period, last_seen_period) = match (first_seen, last_seen) {
        (Some(first), Some(last)) => (first, last),
        (Some(only), None) | (None, Some(only)) => (only.clone(), only),
        (None, None) => {
            return Err(LedgerError::Migration(format!("ledger entry {key:?} has no seen period")));
        }
    };

    let periods_seen = match fields.get("periods_seen").and_then(Value::as_array) {
        Some(values) => {
            let mut periods: Vec<Period> = values
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|raw| Period::parse(raw).ok())
                .collect();
            periods.sort();
            periods.dedup();
            periods
        }
        None => {
            backfilled = true;
            let mut periods = vec![first_seen_period.clone(), last_seen_period.clone()];
            periods.sort();
            periods.dedup();
            periods
        }
    };
    let first_seen_period = periods_seen.first().cloned().unwrap_or(first_seen_period);
    let last_seen_period = periods_seen.last().cloned().unwrap_or(last_seen_period);

    let display_name = match text(fields, &["display_name"]) {
        Some(name) => name.to_string(),
        None => {
            backfilled = true;
            key.to_string()
        }
    };

    let resolution_fields = fields.get("resolution").and_then(Value::as_object);
    let mut resolution = resolution_fields.map_or_else(Resolution::default, |block| Resolution {
        is_resolved: block.get("is_resolved").and_then(Value::as_bool).unwrap_or(false),
        resolved_period: period(block, &["resolved_period", "resolved_week"]),
        resolution_reason: text(block, &["resolution_reason"]).map(str::to_string),
    });
    if resolution.is_resolved && resolution.resolved_period.is_none() {
        backfilled = true;
        resolution.resolved_period = Some(last_seen_period.clone());
    }

    let confidence = match fields.get("confidence").and_then(Value::as_object) {
        Some(block) => Confidence {
            level: text(block, &["level"])
                .and_then(confidence_level)
                .unwrap_or(ConfidenceLevel::High),
            absence_count: count(block, "absence_count"),
            last_confident_period: period(block, &["last_confident_period"])
                .unwrap_or_else(|| last_seen_period.clone()),
        },
        None => {
            backfilled = true;
            Confidence {
                level: ConfidenceLevel::High,
                absence_count: resolution_fields.map_or(0, |block| count(block, "absence_count")),
                last_confident_period: last_seen_period.clone(),
            }
        }
    };

    let current_status = if resolution.is_resolved {
        RiskStatus::Resolved
    } else {
        text(fields, &["current_status"]).and_then(RiskStatus::parse).unwrap_or(RiskStatus::Stable)
    };

    let entry = LedgerEntry {
        identity,
        category: text(fields, &["category"]).and_then(Category::parse).unwrap_or(Category::Risk),
        display_name,
        first_seen_period,
        last_seen_period,
        periods_open: u32::try_from(periods_seen.len()).unwrap_or(u32::MAX),
        periods_seen,
        heat_history: history(fields, "heat_history", |raw| Heat::parse(raw).unwrap_or(Heat::Low)),
        attention_history: history(fields, "attention_history", |raw| {
            AttentionLevel::parse(raw).unwrap_or(AttentionLevel::Monitor)
        }),
        escalation_count: count(fields, "escalation_count"),
        de_escalation_count: count(fields, "de_escalation_count"),
        recurrence_count: count(fields, "recurrence_count"),
        current_status,
        confidence,
        resolution,
    };
    Ok((entry, backfilled))
}

fn text<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

fn period(fields: &Map<String, Value>, keys: &[&str]) -> Option<Period> {
    text(fields, keys).and_then(|raw| Period::parse(raw).ok())
}

fn count(fields: &Map<String, Value>, key: &str) -> u32 {
    fields
        .get(key)
        .and_then(Value::as_u64)
        .map_or(0, |value| u32::try_from(value).unwrap_or(u32::MAX))
}

fn history<T>(fields: &Map<String, Value>, key: &str, parse: impl Fn(&str) -> T) -> Vec<T> {
    fields
        .get(key)
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).map(&parse).collect())
        .unwrap_or_default()
}

fn confidence_level(raw: &str) -> Option<ConfidenceLevel> {
    match raw.to_ascii_lowercase().as_str() {
        "high" => Some(ConfidenceLevel::High),
        "medium" => Some(ConfidenceLevel::Medium),
        "low" => Some(ConfidenceLevel::Low),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::policy::DecayPolicy;
    use crate::risk::{RiskRecord, Severity};

    fn legacy_document() -> Value {
        json!({
            "memory_version": "1.0",
            "project_id": "default",
            "last_updated_week": "2026-W05",
            "risks": {
                "vendor_dependency": {
                    "risk_id": "vendor_dependency",
                    "category": "Schedule",
                    "first_seen_week": "2026-W01",
                    "last_seen_week": "2026-W04",
                    "weeks_open": 3,
                    "heat_history": ["Medium", "High", "High"],
                    "attention_history": ["Near-term", "Immediate", "Immediate"],
                    "escalation_count": 1,
                    "de_escalation_count": 0,
                    "recurrence_count": 0,
                    "current_status": "Stable",
                    "resolution": {
                        "is_resolved": false,
                        "resolved_week": null,
                        "resolution_reason": null,
                        "absence_count": 1
                    }
                },
                "cost_overrun": {
                    "risk_id": "cost_overrun",
                    "category": "Cost",
                    "first_seen_week": "2026-W02",
                    "last_seen_week": "2026-W02",
                    "weeks_open": 1,
                    "heat_history": ["Low"],
                    "attention_history": ["Monitor"],
                    "escalation_count": 0,
                    "de_escalation_count": 0,
                    "recurrence_count": 0,
                    "current_status": "Resolved",
                    "resolution": {
                        "is_resolved": true,
                        "resolved_week": "2026-W04",
                        "resolution_reason": "Not observed in recent updates",
                        "absence_count": 2
                    }
                }
            }
        })
    }

    fn migrated(value: Value) -> (ProjectLedger, MigrationReport) {
        migrate_ledger_value(value).unwrap_or_else(|err| panic!("migration failed: {err}"))
    }

    fn period(label: &str) -> Period {
        Period::parse(label).unwrap_or_else(|err| panic!("invalid fixture period: {err}"))
    }

    #[test]
    fn legacy_document_is_renamed_and_backfilled() {
        let (ledger, report) = migrated(legacy_document());

        assert_eq!(report.from_version, 1);
        assert_eq!(report.to_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(report.backfilled_entries, 2);
        assert_eq!(ledger.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(ledger.project_id.as_str(), "default");
        assert_eq!(ledger.last_updated_period, Some(period("2026-W05")));

        let vendor = ledger
            .risks
            .get(&RiskIdentity::new("vendor_dependency"))
            .unwrap_or_else(|| panic!("vendor entry missing"));
        assert_eq!(vendor.periods_seen, vec![period("2026-W01"), period("2026-W04")]);
        assert_eq!(vendor.periods_open, 2);
        assert_eq!(vendor.heat_history, vec![Heat::Medium, Heat::High, Heat::High]);
        assert_eq!(vendor.confidence.level, ConfidenceLevel::High);
        assert_eq!(vendor.confidence.absence_count, 1);
        assert_eq!(vendor.confidence.last_confident_period, period("2026-W04"));
        assert_eq!(vendor.display_name, "vendor_dependency");
        assert_eq!(vendor.escalation_count, 1);
        assert!(vendor.invariant_violations().is_empty());
        // Known labels align with the tail of the longer history.
        assert_eq!(
            vendor.observation_at(&period("2026-W01")),
            Some((Heat::High, AttentionLevel::Immediate))
        );

        let cost = ledger
            .risks
            .get(&RiskIdentity::new("cost_overrun"))
            .unwrap_or_else(|| panic!("cost entry missing"));
        assert!(cost.resolution.is_resolved);
        assert_eq!(cost.resolution.resolved_period, Some(period("2026-W04")));
        assert_eq!(cost.current_status, RiskStatus::Resolved);
        assert_eq!(cost.confidence.absence_count, 2);
    }

    #[test]
    fn migrated_legacy_ledger_keeps_ingesting() {
        let (mut ledger, _) = migrated(legacy_document());
        let record = RiskRecord::new(
            "Budget overrun on licences",
            Category::Cost,
            Severity::Medium,
            AttentionLevel::NearTerm,
            None,
        );
        let summary = ledger
            .ingest(&[record], &period("2026-W06"), &DecayPolicy::default())
            .unwrap_or_else(|err| panic!("ingest failed: {err}"));

        assert_eq!(summary.recurred, vec![RiskIdentity::new("cost_overrun")]);
        let vendor = ledger
            .risks
            .get(&RiskIdentity::new("vendor_dependency"))
            .unwrap_or_else(|| panic!("vendor entry missing"));
        assert_eq!(vendor.confidence.absence_count, 2);
        assert_eq!(vendor.heat_history.len(), 3);
    }

    #[test]
    fn current_document_round_trips_without_backfill() {
        let (ledger, _) = migrated(legacy_document());
        let value = serde_json::to_value(&ledger).unwrap_or_else(|err| panic!("serialize: {err}"));

        let (again, report) = migrated(value);
        assert_eq!(again, ledger);
        assert_eq!(report.from_version, CURRENT_SCHEMA_VERSION);
        assert!(!report.changed());
    }

    #[test]
    fn unreadable_shapes_are_migration_errors() {
        assert!(matches!(migrate_ledger_value(json!([1, 2])), Err(LedgerError::Migration(_))));
        assert!(matches!(
            migrate_ledger_value(json!({"project_id": "apollo", "risks": []})),
            Err(LedgerError::Migration(_))
        ));
        assert!(matches!(
            migrate_ledger_value(json!({"project_id": "apollo", "schema_version": 99})),
            Err(LedgerError::Migration(_))
        ));
        assert!(matches!(
            migrate_ledger_value(json!({
                "project_id": "apollo",
                "risks": {"x": {"category": "Cost"}}
            })),
            Err(LedgerError::Migration(_))
        ));
    }

    #[test]
    fn unknown_values_are_normalized_leniently() {
        let (ledger, _) = migrated(json!({
            "schema_version": 2,
            "project_id": "apollo",
            "risks": {
                "odd": {
                    "category": "Logistics",
                    "first_seen_period": "2026-W01",
                    "last_seen_period": "2026-W01",
                    "heat_history": ["Scorching"],
                    "attention_history": ["Whenever"],
                    "current_status": "Sideways",
                    "extra_key": true
                }
            }
        }));
        let entry = ledger
            .risks
            .get(&RiskIdentity::new("odd"))
            .unwrap_or_else(|| panic!("entry missing"));
        assert_eq!(entry.category, Category::Risk);
        assert_eq!(entry.heat_history, vec![Heat::Low]);
        assert_eq!(entry.attention_history, vec![AttentionLevel::Monitor]);
        assert_eq!(entry.current_status, RiskStatus::Stable);
    }
}
