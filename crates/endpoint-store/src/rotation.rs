use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Duration, OffsetDateTime, UtcOffset};

/// Calendar period after which the history is cleared. Boundaries are UTC midnights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPeriod {
    Daily,
    /// Weeks start on Monday.
    #[default]
    Weekly,
    Monthly,
    Never,
}

impl RotationPeriod {
    /// Unix timestamp of the start of the period containing `at`.
    pub fn epoch_start(&self, at: OffsetDateTime) -> i64 {
        let date = at.to_offset(UtcOffset::UTC).date();
        let start = match self {
            RotationPeriod::Daily => date,
            RotationPeriod::Weekly => date - Duration::days(i64::from(date.weekday().number_days_from_monday())),
            RotationPeriod::Monthly => date.replace_day(1).unwrap_or(date),
            RotationPeriod::Never => return 0,
        };
        start.midnight().assume_utc().unix_timestamp()
    }
}

impl fmt::Display for RotationPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotationPeriod::Daily => "daily",
            RotationPeriod::Weekly => "weekly",
            RotationPeriod::Monthly => "monthly",
            RotationPeriod::Never => "never",
        };
        f.write_str(s)
    }
}

impl FromStr for RotationPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(RotationPeriod::Daily),
            "weekly" => Ok(RotationPeriod::Weekly),
            "monthly" => Ok(RotationPeriod::Monthly),
            "never" => Ok(RotationPeriod::Never),
            other => Err(format!("unknown rotation period: {other}")),
        }
    }
}
