use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::compare::{PeriodSnapshot, SnapshotRisk};
use crate::identity::RiskIdentity;
use crate::period::{Period, ProjectId};
use crate::policy::DecayPolicy;
use crate::risk::{AttentionLevel, Category, Heat, RiskRecord};
use crate::LedgerError;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
pub const RESOLUTION_REASON: &str = "confidence decayed after sustained absence";

/// Variant order is the confidence order, so `min` never raises confidence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum RiskStatus {
    Stable,
    Escalated,
    #[serde(rename = "De-escalated")]
    DeEscalated,
    Recurring,
    Resolved,
}

impl RiskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "Stable",
            Self::Escalated => "Escalated",
            Self::DeEscalated => "De-escalated",
            Self::Recurring => "Recurring",
            Self::Resolved => "Resolved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stable" => Some(Self::Stable),
            "escalated" => Some(Self::Escalated),
            "de-escalated" | "deescalated" | "de_escalated" => Some(Self::DeEscalated),
            "recurring" => Some(Self::Recurring),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Confidence {
    pub level: ConfidenceLevel,
    pub absence_count: u32,
    pub last_confident_period: Period,
}

impl Confidence {
    fn observed(period: &Period) -> Self {
        Self {
            level: ConfidenceLevel::High,
            absence_count: 0,
            last_confident_period: period.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Resolution {
    pub is_resolved: bool,
    pub resolved_period: Option<Period>,
    pub resolution_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerEntry {
    pub identity: RiskIdentity,
    pub category: Category,
    pub display_name: String,
    pub first_seen_period: Period,
    pub last_seen_period: Period,
    pub periods_seen: Vec<Period>,
    pub periods_open: u32,
    pub heat_history: Vec<Heat>,
    pub attention_history: Vec<AttentionLevel>,
    pub escalation_count: u32,
    pub de_escalation_count: u32,
    pub recurrence_count: u32,
    pub current_status: RiskStatus,
    pub confidence: Confidence,
    pub resolution: Resolution,
}

enum Observation {
    AlreadyRecorded,
    Updated { recurred: bool },
}

enum Decay {
    Decayed,
    Resolved,
}

impl LedgerEntry {
    /// Entry for the first observation of `identity`.
    #[must_use]
    pub fn first_observed(identity: RiskIdentity, record: &RiskRecord, period: &Period) -> Self {
        Self {
            identity,
            category: record.category(),
            display_name: record.description().to_string(),
            first_seen_period: period.clone(),
            last_seen_period: period.clone(),
            periods_seen: vec![period.clone()],
            periods_open: 1,
            heat_history: vec![record.heat()],
            attention_history: vec![record.attention_level()],
            escalation_count: 0,
            de_escalation_count: 0,
            recurrence_count: 0,
            current_status: RiskStatus::Stable,
            confidence: Confidence::observed(period),
            resolution: Resolution::default(),
        }
    }

    #[must_use]
    pub fn last_heat(&self) -> Option<Heat> {
        self.heat_history.last().copied()
    }

    /// Heat and attention recorded for `period`, if the entry was observed then.
    ///
    /// Migrated entries can carry more history than recoverable period labels;
    /// their labels are aligned with the tail of the histories.
    #[must_use]
    pub fn observation_at(&self, period: &Period) -> Option<(Heat, AttentionLevel)> {
        let index = self.periods_seen.binary_search(period).ok()?;
        let heat_offset = self.heat_history.len().checked_sub(self.periods_seen.len())?;
        let attention_offset = self.attention_history.len().checked_sub(self.periods_seen.len())?;
        let heat = self.heat_history.get(heat_offset + index)?;
        let attention = self.attention_history.get(attention_offset + index)?;
        Some((*heat, *attention))
    }

    /// Structural invariant violations, empty for a consistent entry.
    #[must_use]
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if usize::try_from(self.periods_open).ok() != Some(self.periods_seen.len()) {
            violations.push(format!(
                "periods_open={} but periods_seen has {} entries",
                self.periods_open,
                self.periods_seen.len()
            ));
        }
        if self.heat_history.len() != self.attention_history.len() {
            violations.push("heat_history and attention_history lengths differ".to_string());
        }
        if self.heat_history.len() < self.periods_seen.len() {
            violations.push("heat_history is shorter than periods_seen".to_string());
        }
        if self.periods_seen.windows(2).any(|pair| pair[0] >= pair[1]) {
            violations.push("periods_seen is not strictly ascending".to_string());
        }
        if self.periods_seen.first() != Some(&self.first_seen_period) {
            violations.push("first_seen_period does not match periods_seen".to_string());
        }
        if self.periods_seen.last() != Some(&self.last_seen_period) {
            violations.push("last_seen_period does not match periods_seen".to_string());
        }
        if self.resolution.is_resolved
            && (self.resolution.resolved_period.is_none()
                || self.current_status != RiskStatus::Resolved)
        {
            violations.push("resolved entry is missing resolved_period or status".to_string());
        }
        violations
    }

    fn observe(&mut self, record: &RiskRecord, period: &Period) -> Observation {
        if self.periods_seen.contains(period) {
            return Observation::AlreadyRecorded;
        }

        let previous_heat = self.last_heat();
        let current_heat = record.heat();

        self.periods_seen.push(period.clone());
        self.periods_open = self.periods_open.saturating_add(1);
        self.heat_history.push(current_heat);
        self.attention_history.push(record.attention_level());
        self.last_seen_period = period.clone();
        self.display_name = record.description().to_string();
        self.confidence = Confidence::observed(period);

        self.current_status = match previous_heat.map(|previous| current_heat.cmp(&previous)) {
            Some(Ordering::Greater) => {
                self.escalation_count += 1;
                RiskStatus::Escalated
            }
            Some(Ordering::Less) => {
                self.de_escalation_count += 1;
                RiskStatus::DeEscalated
            }
            _ => RiskStatus::Stable,
        };

        let recurred = self.resolution.is_resolved;
        if recurred {
            self.resolution = Resolution::default();
            self.recurrence_count += 1;
            self.current_status = RiskStatus::Recurring;
        }

        Observation::Updated { recurred }
    }

    fn decay(&mut self, period: &Period, policy: &DecayPolicy) -> Decay {
        self.confidence.absence_count = self.confidence.absence_count.saturating_add(1);
        let absence = self.confidence.absence_count;
        // Severity as last truly observed; an entry without history decays as Low.
        let thresholds = policy.thresholds_for(self.last_heat().unwrap_or(Heat::Low));

        let target = if absence >= thresholds.low_after {
            ConfidenceLevel::Low
        } else if absence >= thresholds.medium_after {
            ConfidenceLevel::Medium
        } else {
            self.confidence.level
        };
        self.confidence.level = self.confidence.level.min(target);

        if self.confidence.level == ConfidenceLevel::Low
            && absence >= policy.resolution_absence_threshold
        {
            self.resolution = Resolution {
                is_resolved: true,
                resolved_period: Some(period.clone()),
                resolution_reason: Some(RESOLUTION_REASON.to_string()),
            };
            self.current_status = RiskStatus::Resolved;
            return Decay::Resolved;
        }

        Decay::Decayed
    }
}

/// What one call to [`ProjectLedger::ingest`] did, by identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IngestSummary {
    pub period: Period,
    pub replay: bool,
    pub created: Vec<RiskIdentity>,
    pub updated: Vec<RiskIdentity>,
    pub replayed: Vec<RiskIdentity>,
    pub recurred: Vec<RiskIdentity>,
    pub decayed: Vec<RiskIdentity>,
    pub resolved: Vec<RiskIdentity>,
}

impl IngestSummary {
    fn new(period: &Period, replay: bool) -> Self {
        Self {
            period: period.clone(),
            replay,
            created: Vec::new(),
            updated: Vec::new(),
            replayed: Vec::new(),
            recurred: Vec::new(),
            decayed: Vec::new(),
            resolved: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProjectLedger {
    pub schema_version: u32,
    pub project_id: ProjectId,
    pub last_updated_period: Option<Period>,
    #[serde(default)]
    pub risks: BTreeMap<RiskIdentity, LedgerEntry>,
}

impl ProjectLedger {
    #[must_use]
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            project_id,
            last_updated_period: None,
            risks: BTreeMap::new(),
        }
    }

    /// Apply one period's validated records to the ledger.
    ///
    /// Observed identities are created or updated; every other unresolved entry
    /// takes one decay step. Re-ingesting the ledger's last period is a replay:
    /// entries already holding the period are left alone and no decay runs, so
    /// repeated calls with the same input leave the ledger unchanged.
    ///
    /// Within one call the first record for an identity wins; later records
    /// resolving to the same identity find the period already recorded.
    ///
    /// # Errors
    /// Returns [`LedgerError::OutOfOrderPeriod`] when `period` sorts before the
    /// last ingested period. The ledger is not modified in that case.
    pub fn ingest(
        &mut self,
        records: &[RiskRecord],
        period: &Period,
        policy: &DecayPolicy,
    ) -> Result<IngestSummary, LedgerError> {
        if let Some(last) = &self.last_updated_period {
            if period < last {
                return Err(LedgerError::OutOfOrderPeriod {
                    period: period.clone(),
                    last: last.clone(),
                });
            }
        }

        let replay = self.last_updated_period.as_ref() == Some(period);
        let mut summary = IngestSummary::new(period, replay);
        let mut observed: BTreeSet<RiskIdentity> = BTreeSet::new();

        for record in records {
            let identity = record.identity();
            let first_in_call = observed.insert(identity.clone());

            match self.risks.entry(identity.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(LedgerEntry::first_observed(identity.clone(), record, period));
                    summary.created.push(identity);
                }
                Entry::Occupied(mut slot) => match slot.get_mut().observe(record, period) {
                    Observation::AlreadyRecorded => {
                        if first_in_call {
                            summary.replayed.push(identity);
                        }
                    }
                    Observation::Updated { recurred } => {
                        if recurred {
                            summary.recurred.push(identity.clone());
                        }
                        summary.updated.push(identity);
                    }
                },
            }
        }

        if !replay {
            for (identity, entry) in &mut self.risks {
                if observed.contains(identity) || entry.resolution.is_resolved {
                    continue;
                }
                if let Decay::Resolved = entry.decay(period, policy) {
                    summary.resolved.push(identity.clone());
                }
                summary.decayed.push(identity.clone());
            }
        }

        self.last_updated_period = Some(period.clone());
        Ok(summary)
    }

    /// Entries not currently resolved, in identity order.
    pub fn active_entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.risks.values().filter(|entry| !entry.resolution.is_resolved)
    }

    /// Rebuild per-period comparison snapshots from recorded history.
    ///
    /// Covers every period any entry was observed in, ascending, keeping the
    /// last `last_n` when given. Severity and owner are not tracked by the
    /// ledger and come back empty; the escalation list holds the High-heat
    /// risks of each period.
    #[must_use]
    pub fn period_snapshots(&self, last_n: Option<usize>) -> Vec<PeriodSnapshot> {
        let periods: BTreeSet<&Period> =
            self.risks.values().flat_map(|entry| entry.periods_seen.iter()).collect();
        let skip = last_n.map_or(0, |n| periods.len().saturating_sub(n));

        periods
            .into_iter()
            .skip(skip)
            .map(|period| {
                let mut risks = BTreeMap::new();
                let mut escalations = Vec::new();
                for (identity, entry) in &self.risks {
                    let Some((heat, attention_level)) = entry.observation_at(period) else {
                        continue;
                    };
                    if heat == Heat::High {
                        escalations.push(format!("- {} (Heat: {heat})", entry.display_name));
                    }
                    risks.insert(
                        identity.clone(),
                        SnapshotRisk {
                            display_name: entry.display_name.clone(),
                            category: entry.category,
                            severity: None,
                            attention_level,
                            heat,
                            owner: None,
                        },
                    );
                }
                PeriodSnapshot { period: Some(period.clone()), risks, escalations }
            })
            .collect()
    }
}
