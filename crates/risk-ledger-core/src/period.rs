use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::LedgerError;

/// Opaque reporting-period label, ordered lexicographically (e.g. `2026-W07`).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Period(String);

impl Period {
    /// # Errors
    /// Returns [`LedgerError::InvalidPeriod`] for an empty or whitespace label.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::InvalidPeriod(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// ISO-8601 week label for `date`, formatted `YYYY-Www`.
    #[must_use]
    pub fn iso_week(date: Date) -> Self {
        let (year, week, _) = date.to_iso_week_date();
        Self(format!("{year:04}-W{week:02}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Period {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.0
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supplies the default period when a caller does not name one.
pub trait PeriodClock: std::fmt::Debug + Send + Sync {
    fn current_period(&self) -> Period;
}

/// Wall-clock ISO week in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl PeriodClock for SystemClock {
    fn current_period(&self) -> Period {
        Period::iso_week(OffsetDateTime::now_utc().date())
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock(pub Period);

impl PeriodClock for FixedClock {
    fn current_period(&self) -> Period {
        self.0.clone()
    }
}

/// Project key. Restricted to ASCII alphanumerics, `-` and `_` since it names
/// files and rows in the record stores.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    /// # Errors
    /// Returns [`LedgerError::InvalidProjectId`] for empty ids or ids with
    /// characters outside `[A-Za-z0-9_-]`.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        let valid = !value.is_empty()
            && value.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            return Err(LedgerError::InvalidProjectId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProjectId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(value: ProjectId) -> Self {
        value.0
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use time::Month;

    use super::*;

    fn date(year: i32, month: Month, day: u8) -> Date {
        Date::from_calendar_date(year, month, day)
            .unwrap_or_else(|err| panic!("invalid fixture date: {err}"))
    }

    #[test]
    fn iso_week_label_is_zero_padded() {
        assert_eq!(Period::iso_week(date(2026, Month::February, 11)).as_str(), "2026-W07");
    }

    #[test]
    fn iso_week_uses_iso_year_at_year_boundary() {
        // 2026-01-01 is a Thursday, so it belongs to 2026-W01.
        assert_eq!(Period::iso_week(date(2026, Month::January, 1)).as_str(), "2026-W01");
        // 2027-01-01 is a Friday, still in 2026-W53.
        assert_eq!(Period::iso_week(date(2027, Month::January, 1)).as_str(), "2026-W53");
    }

    #[test]
    fn periods_order_lexicographically() {
        let earlier = Period::parse("2026-W09").unwrap_or_else(|err| panic!("{err}"));
        let later = Period::parse("2026-W10").unwrap_or_else(|err| panic!("{err}"));
        assert!(earlier < later);
    }

    #[test]
    fn blank_period_is_rejected() {
        assert!(matches!(Period::parse("  "), Err(LedgerError::InvalidPeriod(_))));
    }

    #[test]
    fn project_id_rejects_path_characters() {
        assert!(ProjectId::parse("apollo-2_rev").is_ok());
        assert!(matches!(ProjectId::parse("../etc"), Err(LedgerError::InvalidProjectId(_))));
        assert!(matches!(ProjectId::parse(""), Err(LedgerError::InvalidProjectId(_))));
    }

    #[test]
    fn fixed_clock_returns_its_period() {
        let period = Period::parse("2026-W01").unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(FixedClock(period.clone()).current_period(), period);
    }
}
