//! Calendar-day resolution
//!
//! A conversation state belongs to one calendar day in a single, fixed
//! reference timezone. Subject-local timezones are not consulted.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

use sdk::errors::EngineError;

/// Decides whether two instants fall on the same reference-timezone day
#[derive(Debug, Clone, Copy)]
pub struct DayWindowResolver {
    timezone: Tz,
}

impl Default for DayWindowResolver {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl DayWindowResolver {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// Build a resolver from an IANA timezone name such as `"Asia/Jerusalem"`
    pub fn from_name(name: &str) -> Result<Self, EngineError> {
        let timezone = Tz::from_str(name)
            .map_err(|e| EngineError::Config(format!("Invalid timezone '{}': {}", name, e)))?;
        Ok(Self::new(timezone))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Calendar date of `t` in the reference timezone
    pub fn day_key(&self, t: DateTime<Utc>) -> NaiveDate {
        t.with_timezone(&self.timezone).date_naive()
    }

    pub fn is_same_day(&self, t: DateTime<Utc>, reference: DateTime<Utc>) -> bool {
        self.day_key(t) == self.day_key(reference)
    }
}
