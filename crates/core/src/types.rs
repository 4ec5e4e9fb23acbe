use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a rule. A segment shares the id of the rule it materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RuleId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Refresh cadence of a rule's segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Schedule {
    Once,
    Hourly,
    #[default]
    Daily,
    Weekly,
}

impl Schedule {
    /// Fixed interval between runs. `Once` falls back to a daily cadence.
    pub fn interval(&self) -> Duration {
        match self {
            Schedule::Hourly => Duration::hours(1),
            Schedule::Daily | Schedule::Once => Duration::days(1),
            Schedule::Weekly => Duration::weeks(1),
        }
    }

    /// Next run time, always computed from `now` rather than the previous
    /// `next_run_at`.
    pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.interval()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Once => "ONCE",
            Schedule::Hourly => "HOURLY",
            Schedule::Daily => "DAILY",
            Schedule::Weekly => "WEEKLY",
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

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONCE" => Ok(Schedule::Once),
            "HOURLY" => Ok(Schedule::Hourly),
            "DAILY" => Ok(Schedule::Daily),
            "WEEKLY" => Ok(Schedule::Weekly),
            other => Err(format!("unknown schedule '{other}'")),
        }
    }
}

/// Set operation used to combine dependency segments of a composite rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetOperation {
    Union,
    Intersection,
    Difference,
}

impl SetOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetOperation::Union => "UNION",
            SetOperation::Intersection => "INTERSECTION",
            SetOperation::Difference => "DIFFERENCE",
        }
    }
}

impl fmt::Display for SetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SetOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNION" => Ok(SetOperation::Union),
            "INTERSECTION" | "INTERSECT" => Ok(SetOperation::Intersection),
            "DIFFERENCE" | "EXCEPT" => Ok(SetOperation::Difference),
            other => Err(format!("unsupported operation '{other}'")),
        }
    }
}
