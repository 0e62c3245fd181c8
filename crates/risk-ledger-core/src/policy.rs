use serde::{Deserialize, Serialize};

use crate::risk::Heat;
use crate::LedgerError;

/// Absence counts at which confidence drops to `Medium` and to `Low`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecayThresholds {
    pub medium_after: u32,
    pub low_after: u32,
}

/// Confidence decay and resolution settings applied to unobserved ledger entries.
///
/// Thresholds are keyed by the last observed heat: a risk last seen hot gets
/// more periods of silence before it is considered resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DecayPolicy {
    pub high: DecayThresholds,
    pub medium: DecayThresholds,
    pub low: DecayThresholds,
    pub resolution_absence_threshold: u32,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            high: DecayThresholds { medium_after: 3, low_after: 5 },
            medium: DecayThresholds { medium_after: 2, low_after: 4 },
            low: DecayThresholds { medium_after: 1, low_after: 3 },
            resolution_absence_threshold: 2,
        }
    }
}

impl DecayPolicy {
    #[must_use]
    pub fn thresholds_for(&self, last_heat: Heat) -> DecayThresholds {
        match last_heat {
            Heat::High => self.high,
            Heat::Medium => self.medium,
            Heat::Low => self.low,
        }
    }

    /// # Errors
    /// Returns [`LedgerError::InvalidPolicy`] when a threshold is zero or a
    /// `Low` threshold comes before its `Medium` threshold.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for (name, thresholds) in [("high", self.high), ("medium", self.medium), ("low", self.low)]
        {
            if thresholds.medium_after == 0 || thresholds.low_after == 0 {
                return Err(LedgerError::InvalidPolicy(format!(
                    "{name} thresholds MUST be >= 1"
                )));
            }
            if thresholds.low_after < thresholds.medium_after {
                return Err(LedgerError::InvalidPolicy(format!(
                    "{name}.low_after MUST be >= {name}.medium_after"
                )));
            }
        }
        if self.resolution_absence_threshold == 0 {
            return Err(LedgerError::InvalidPolicy(
                "resolution_absence_threshold MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
