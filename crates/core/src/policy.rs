use chrono::{DateTime, Duration, Utc};

use crate::types::parse_timestamp;

/// Decides whether a successful login should trigger a fresh assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverifyPolicy {
    window: Duration,
}

impl ReverifyPolicy {
    /// Creates a policy that re-verifies assignments older than `days`.
    pub fn from_days(days: u32) -> Self {
        Self {
            window: Duration::days(i64::from(days)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Evaluates the stored bookkeeping timestamp against `now`.
    ///
    /// Missing or unreadable timestamps always require re-verification.
    pub fn evaluate(&self, last_assigned: Option<&str>, now: DateTime<Utc>) -> ReverifyDecision {
        let Some(raw) = last_assigned.filter(|value| !value.trim().is_empty()) else {
            return ReverifyDecision::Due(DueReason::NeverAssigned);
        };

        match parse_timestamp(raw) {
            None => ReverifyDecision::Due(DueReason::Unreadable),
            Some(last) if now - last > self.window => ReverifyDecision::Due(DueReason::Expired),
            Some(_) => ReverifyDecision::Fresh,
        }
    }
}

impl Default for ReverifyPolicy {
    fn default() -> Self {
        Self::from_days(30)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverifyDecision {
    Fresh,
    Due(DueReason),
}

impl ReverifyDecision {
    pub fn is_due(self) -> bool {
        matches!(self, Self::Due(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    NeverAssigned,
    Unreadable,
    Expired,
}

impl DueReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverAssigned => "never_assigned",
            Self::Unreadable => "unreadable_timestamp",
            Self::Expired => "expired",
        }
    }
}
