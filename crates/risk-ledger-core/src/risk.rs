use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::identity::{resolve_identity, RiskIdentity};
use crate::LedgerError;

const DEFAULT_OWNER: &str = "Unassigned";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum AttentionLevel {
    Immediate,
    #[serde(rename = "Near-term")]
    NearTerm,
    Monitor,
}

impl AttentionLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "Immediate",
            Self::NearTerm => "Near-term",
            Self::Monitor => "Monitor",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "immediate" => Some(Self::Immediate),
            "near-term" | "near term" | "near_term" | "nearterm" => Some(Self::NearTerm),
            "monitor" => Some(Self::Monitor),
            _ => None,
        }
    }
}

impl Display for AttentionLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse severity/urgency classification. Variant order is the heat rank order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Heat {
    Low,
    Medium,
    High,
}

impl Heat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl Display for Heat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Category {
    Schedule,
    Cost,
    People,
    Quality,
    Risk,
}

impl Category {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "Schedule",
            Self::Cost => "Cost",
            Self::People => "People",
            Self::Quality => "Quality",
            Self::Risk => "Risk",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "schedule" => Some(Self::Schedule),
            "cost" => Some(Self::Cost),
            "people" => Some(Self::People),
            "quality" => Some(Self::Quality),
            "risk" => Some(Self::Risk),
            _ => None,
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map raw severity and attention onto a heat rank.
///
/// Anything outside the table lands on `Low`. Unknown inputs are parsed to
/// `Severity::Low` / `AttentionLevel::Monitor` before they get here, so the
/// calculator leans towards under-escalation.
#[must_use]
pub fn heat(severity: Severity, attention: AttentionLevel) -> Heat {
    match (severity, attention) {
        (Severity::High, AttentionLevel::Immediate) => Heat::High,
        (Severity::High, AttentionLevel::NearTerm)
        | (Severity::Medium, AttentionLevel::Immediate | AttentionLevel::NearTerm) => Heat::Medium,
        _ => Heat::Low,
    }
}

/// Risk record as delivered by the extraction step, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RawRiskRecord {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub attention_level: Option<String>,
    #[serde(default)]
    pub suggested_owner: Option<String>,
    /// Accepted from the extractor and not tracked by the ledger.
    #[serde(default)]
    pub response_strategy: Option<String>,
}

impl RawRiskRecord {
    #[must_use]
    pub fn new(description: &str, category: &str, severity: &str, attention_level: &str) -> Self {
        Self {
            description: Some(description.to_string()),
            category: Some(category.to_string()),
            severity: Some(severity.to_string()),
            attention_level: Some(attention_level.to_string()),
            suggested_owner: None,
            response_strategy: None,
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: &str) -> Self {
        self.suggested_owner = Some(owner.to_string());
        self
    }
}

/// Validated per-period risk record. Heat is always derived, never supplied.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct RiskRecord {
    description: String,
    category: Category,
    severity: Severity,
    attention_level: AttentionLevel,
    heat: Heat,
    suggested_owner: String,
}

impl RiskRecord {
    #[must_use]
    pub fn new(
        description: &str,
        category: Category,
        severity: Severity,
        attention_level: AttentionLevel,
        suggested_owner: Option<&str>,
    ) -> Self {
        let suggested_owner = suggested_owner
            .map(str::trim)
            .filter(|owner| !owner.is_empty())
            .unwrap_or(DEFAULT_OWNER)
            .to_string();
        Self {
            description: description.trim().to_string(),
            category,
            severity,
            attention_level,
            heat: heat(severity, attention_level),
            suggested_owner,
        }
    }

    /// Validate one raw record at position `index` of its period input.
    ///
    /// # Errors
    /// Returns [`LedgerError::MalformedRecord`] when description, category,
    /// severity or attention level is missing or blank. Unrecognised values for
    /// present fields are defaulted instead of rejected.
    pub fn from_raw(raw: &RawRiskRecord, index: usize) -> Result<Self, LedgerError> {
        let description = required(raw.description.as_deref(), index, "description")?;
        let category = required(raw.category.as_deref(), index, "category")?;
        let severity = required(raw.severity.as_deref(), index, "severity")?;
        let attention = required(raw.attention_level.as_deref(), index, "attention_level")?;

        Ok(Self::new(
            description,
            Category::parse(category).unwrap_or(Category::Risk),
            Severity::parse(severity).unwrap_or(Severity::Low),
            AttentionLevel::parse(attention).unwrap_or(AttentionLevel::Monitor),
            raw.suggested_owner.as_deref(),
        ))
    }

    /// Copy of this record with a new severity/attention pair and recomputed heat.
    #[must_use]
    pub fn reassessed(&self, severity: Severity, attention_level: AttentionLevel) -> Self {
        Self {
            severity,
            attention_level,
            heat: heat(severity, attention_level),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    #[must_use]
    pub fn attention_level(&self) -> AttentionLevel {
        self.attention_level
    }

    #[must_use]
    pub fn heat(&self) -> Heat {
        self.heat
    }

    #[must_use]
    pub fn suggested_owner(&self) -> &str {
        &self.suggested_owner
    }

    #[must_use]
    pub fn identity(&self) -> RiskIdentity {
        resolve_identity(&self.description, self.category.as_str())
    }
}

fn required<'a>(
    value: Option<&'a str>,
    index: usize,
    field: &'static str,
) -> Result<&'a str, LedgerError> {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(LedgerError::MalformedRecord { index, field }),
    }
}
