use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

const VENDOR_KEYWORDS: [&str; 2] = ["vendor", "external"];
const TEAM_KEYWORDS: [&str; 3] = ["team", "morale", "capacity"];
const COST_KEYWORDS: [&str; 2] = ["cost", "budget"];
const QUALITY_KEYWORDS: [&str; 1] = ["quality"];

/// Stable ledger key for a risk.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RiskIdentity(String);

impl RiskIdentity {
    #[must_use]
    pub fn new(value: &str) -> Self {
        Self(value.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RiskIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the ledger identity for a risk by keyword precedence.
///
/// Matching runs case-insensitively over `"{category} {description}"`, first
/// rule wins: vendor/external, then team/morale/capacity, then cost/budget,
/// then quality. Otherwise the category name is used, lower-cased with spaces
/// turned into underscores.
///
/// This is keyword clustering, not semantic matching: two unrelated risks that
/// both mention a vendor share `vendor_dependency` and are tracked as one
/// ledger entry.
#[must_use]
pub fn resolve_identity(description: &str, category: &str) -> RiskIdentity {
    let text = format!("{category} {description}").to_lowercase();

    let key = if mentions(&text, &VENDOR_KEYWORDS) {
        "vendor_dependency".to_string()
    } else if mentions(&text, &TEAM_KEYWORDS) {
        "team_capacity".to_string()
    } else if mentions(&text, &COST_KEYWORDS) {
        "cost_overrun".to_string()
    } else if mentions(&text, &QUALITY_KEYWORDS) {
        "quality_risk".to_string()
    } else {
        category.trim().to_lowercase().replace(' ', "_")
    };

    RiskIdentity(key)
}

fn mentions(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| text.contains(keyword))
}
