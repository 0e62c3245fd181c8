use serde::Serialize;

use crate::period::Period;
use crate::risk::{AttentionLevel, RawRiskRecord, RiskRecord, Severity};
use crate::LedgerError;

const EARLY_STAGE_INDICATORS: [&str; 8] = [
    "initial",
    "ongoing",
    "pending",
    "monitor",
    "no immediate",
    "at this stage",
    "no major",
    "early",
];

const IMPACT_INDICATORS: [&str; 6] = [
    "uat at risk",
    "timeline impacted",
    "schedule rebaseline",
    "delay confirmed",
    "will impact",
    "now at risk",
];

const STRONG_ESCALATION_SIGNALS: [&str; 5] = [
    "uat at risk",
    "schedule rebaseline",
    "leadership attention",
    "timeline will be impacted",
    "requires escalation",
];

fn mentions_any(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| text.contains(phrase))
}

/// Downgrade a record to Medium / Near-term when the update reads as early
/// stage and names no concrete impact.
#[must_use]
pub fn calibrate_early_stage(record: &RiskRecord, update_text: &str) -> RiskRecord {
    let text = update_text.to_lowercase();
    if mentions_any(&text, &EARLY_STAGE_INDICATORS) && !mentions_any(&text, &IMPACT_INDICATORS) {
        return record.reassessed(Severity::Medium, AttentionLevel::NearTerm);
    }
    record.clone()
}

/// Escalation lines for an update: every record when the text carries a strong
/// signal, otherwise only the High / Immediate ones.
#[must_use]
pub fn escalation_summary(records: &[RiskRecord], update_text: &str) -> Vec<String> {
    let strong_signal = mentions_any(&update_text.to_lowercase(), &STRONG_ESCALATION_SIGNALS);

    records
        .iter()
        .filter(|record| {
            strong_signal
                || (record.severity() == Severity::High
                    && record.attention_level() == AttentionLevel::Immediate)
        })
        .map(|record| {
            format!(
                "- {} (Owner: {}, Severity: {})",
                record.description(),
                record.suggested_owner(),
                record.severity()
            )
        })
        .collect()
}

/// Validate a whole period's input. Fails on the first malformed record so
/// nothing downstream sees a partial period.
///
/// # Errors
/// Returns [`LedgerError::MalformedRecord`] for the first invalid record.
pub fn validate_records(raw: &[RawRiskRecord]) -> Result<Vec<RiskRecord>, LedgerError> {
    raw.iter()
        .enumerate()
        .map(|(index, record)| RiskRecord::from_raw(record, index))
        .collect()
}

/// One analysed status update: calibrated records plus the escalation lines.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PeriodAnalysis {
    pub period: Option<Period>,
    pub records: Vec<RiskRecord>,
    pub escalation_summary: Vec<String>,
}

/// # Errors
/// Returns [`LedgerError::MalformedRecord`] when any raw record is invalid.
pub fn analyze_period(
    raw: &[RawRiskRecord],
    update_text: Option<&str>,
    period: Option<Period>,
) -> Result<PeriodAnalysis, LedgerError> {
    let validated = validate_records(raw)?;
    let text = update_text.unwrap_or_default();
    let records: Vec<RiskRecord> = if text.trim().is_empty() {
        validated
    } else {
        validated.iter().map(|record| calibrate_early_stage(record, text)).collect()
    };
    let escalation_summary = escalation_summary(&records, text);

    Ok(PeriodAnalysis { period, records, escalation_summary })
}
