//! Named run schedules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named schedule a job can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Operator-defined timer; also where non-manual jobs without schedule
    /// flags run.
    Custom,
    Midnight,
    Noon,
    EveryFiveMinutes,
    EveryHour,
}

impl Schedule {
    pub const ALL: [Schedule; 5] = [
        Schedule::Custom,
        Schedule::Midnight,
        Schedule::Noon,
        Schedule::EveryFiveMinutes,
        Schedule::EveryHour,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Custom => "custom",
            Schedule::Midnight => "midnight",
            Schedule::Noon => "noon",
            Schedule::EveryFiveMinutes => "every_five_minutes",
            Schedule::EveryHour => "every_hour",
        }
    }

    /// Six-field cron expression (seconds first) of the fixed schedules.
    pub fn cron(&self) -> Option<&'static str> {
        match self {
            Schedule::Custom => None,
            Schedule::Midnight => Some("0 0 0 * * *"),
            Schedule::Noon => Some("0 0 12 * * *"),
            Schedule::EveryFiveMinutes => Some("5 */5 * * * *"),
            Schedule::EveryHour => Some("10 0 * * * *"),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Schedule {
    type Err = String;

    /// Case-insensitive; `EveryHour`, `every_hour` and `every-hour` all parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        Schedule::ALL
            .into_iter()
            .find(|schedule| schedule.as_str().replace('_', "") == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown schedule '{}' (expected one of: {})",
                    s,
                    Schedule::ALL.map(|s| s.as_str()).join(", ")
                )
            })
    }
}
