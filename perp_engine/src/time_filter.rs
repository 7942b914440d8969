/// time_filter.rs — UTC session filter for new entries
///
///   01–06 UTC   Asian dead hours, thin books → no new entries
///   08–11 UTC   European session             → optimal
///   13–17 UTC   US market hours              → optimal
///   20–23 UTC   Asian-US overlap             → optimal
///   otherwise   moderate, entries allowed
///
/// Open positions are managed regardless of the hour.
use chrono::{DateTime, Timelike, Utc};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Dead,
    European,
    UsHours,
    AsianUsOverlap,
    Moderate,
}

impl Session {
    pub fn for_hour(utc_hour: u32) -> Self {
        match utc_hour {
            1..=6   => Self::Dead,
            8..=11  => Self::European,
            13..=17 => Self::UsHours,
            20..=23 => Self::AsianUsOverlap,
            _       => Self::Moderate,
        }
    }

    pub fn allows_entries(self) -> bool {
        self != Self::Dead
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Dead           => "Low volatility period (Asian dead hours)",
            Self::European       => "European session (high volatility)",
            Self::UsHours        => "US market hours (high volatility)",
            Self::AsianUsOverlap => "Asian-US overlap (good momentum)",
            Self::Moderate       => "Moderate trading hours",
        }
    }
}

/// (entries allowed, reason) for a UTC hour.
pub fn session_quality(utc_hour: u32) -> (bool, &'static str) {
    let s = Session::for_hour(utc_hour);
    (s.allows_entries(), s.describe())
}

/// Whether new entries may be opened at `now`, honouring USE_TIME_FILTER.
pub fn entries_allowed(cfg: &AppConfig, now: DateTime<Utc>) -> (bool, &'static str) {
    if !cfg.use_time_filter {
        return (true, "time filter disabled");
    }
    session_quality(now.hour())
}
