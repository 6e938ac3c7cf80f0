use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Opaque time-matching policy for recurring jobs.
///
/// Wraps a cron expression and exposes only the two operations the
/// scheduling core needs: the next firing time after an instant, and
/// whether a given instant (at one-second granularity) matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecurringPattern {
    expression: String,
}

impl RecurringPattern {
    /// Validates the cron expression eagerly so a bad pattern is rejected
    /// at subscribe time, not at promotion time.
    pub fn new(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        cron::Schedule::from_str(&expression)
            .map_err(|e| Error::InvalidPattern(format!("{expression}: {e}")))?;
        Ok(Self { expression })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn schedule(&self) -> Option<cron::Schedule> {
        // Validated at construction; a record hand-edited into storage
        // with a bad expression just never matches.
        cron::Schedule::from_str(&self.expression).ok()
    }

    /// The next instant strictly after `after` at which the pattern fires.
    pub fn next_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule()?.after(&after).next()
    }

    /// Whether the pattern fires at `instant`, truncated to the second.
    pub fn is_matching(&self, instant: DateTime<Utc>) -> bool {
        let instant = match instant.with_nanosecond(0) {
            Some(t) => t,
            None => instant,
        };
        self.schedule().is_some_and(|s| s.includes(instant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(RecurringPattern::new("not a cron line").is_err());
    }

    #[test]
    fn every_minute_pattern_matches_minute_boundaries() {
        // sec min hour day month weekday
        let pattern = RecurringPattern::new("0 * * * * *").unwrap();
        let on_boundary = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let off_boundary = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 17).unwrap();
        assert!(pattern.is_matching(on_boundary));
        assert!(!pattern.is_matching(off_boundary));
    }

    #[test]
    fn next_time_is_strictly_after() {
        let pattern = RecurringPattern::new("0 * * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let next = pattern.next_time(at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 31, 0).unwrap());
    }
}
